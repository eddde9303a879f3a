//! MpiJob Validating Webhook
//!
//! Handles AdmissionReview requests for MpiJob resources, running the
//! admission check battery before the object reaches the store. Denials are
//! synchronous and side-effect free; the reconciler never sees a denied job.

mod validation;

pub use validation::{QuotaSource, QuotaSourceImpl, Validator};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{extract::State, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{error, info, warn};

use crate::crd::MpiJob;
use crate::Error;

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Validator running the admission check battery
    pub validator: Validator,
}

/// Build the webhook router
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate/mpijobs", post(validate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Handle a validating admission review for MpiJobs
///
/// Deletions (no object in the request) are always allowed; creates and
/// updates run the full check battery.
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<MpiJob>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<MpiJob> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = validate_job(&state, &req).await;
    Json(response.into_review())
}

async fn validate_job(
    state: &WebhookState,
    request: &AdmissionRequest<MpiJob>,
) -> AdmissionResponse {
    let Some(job) = &request.object else {
        return AdmissionResponse::from(request);
    };

    match state.validator.validate(job).await {
        Ok(()) => {
            info!(job = %job.name_any(), "admission allowed");
            AdmissionResponse::from(request)
        }
        Err(e) => {
            let message = match e {
                Error::Validation(msg) => msg,
                other => other.to_string(),
            };
            warn!(job = %job.name_any(), reason = %message, "admission denied");
            AdmissionResponse::from(request).deny(message)
        }
    }
}

/// Start the validating webhook server
///
/// Serves TLS when a certificate/key pair is configured (the API server
/// requires TLS for webhooks); plain HTTP is for local development behind a
/// terminating proxy.
pub async fn start_webhook_server(
    addr: SocketAddr,
    tls: Option<(PathBuf, PathBuf)>,
    validator: Validator,
) -> Result<(), Error> {
    let state = Arc::new(WebhookState { validator });
    let app = router(state);

    match tls {
        Some((cert, key)) => {
            let tls_config = RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| Error::config(format!("webhook TLS config: {e}")))?;
            info!(addr = %addr, "starting validating webhook (TLS)");
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::config(format!("webhook server: {e}")))
        }
        None => {
            warn!(addr = %addr, "starting validating webhook without TLS");
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::config(format!("webhook server: {e}")))
        }
    }
}
