//! MpiJob controller implementation
//!
//! This module implements the reconciliation logic for MpiJob resources. It
//! follows the Kubernetes controller pattern: observe the current child
//! resources, compare against the declared job, and create whatever is
//! missing. Every pass is level-triggered and idempotent, so a missed watch
//! event or a crash mid-pass heals on the next pass.
//!
//! Children are never deleted here. Each child carries a controller owner
//! reference and the garbage collector reclaims them when the job goes away.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{JobConditionType, MpiJob, MpiJobStatus};
use crate::{resources, status, Error, CONTROLLER_NAME, FINALIZER_NAME, REQUEUE_DELAY_SECS};

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Trait abstracting Kubernetes client operations for MpiJob
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Replace the finalizer list of an MpiJob
    async fn patch_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: &[String],
    ) -> Result<(), Error>;

    /// Patch the status subresource of an MpiJob
    async fn patch_job_status(
        &self,
        name: &str,
        namespace: &str,
        status: &MpiJobStatus,
    ) -> Result<(), Error>;

    /// Delete an MpiJob; absence is treated as success
    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a pod by name, None when absent
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;

    /// Get a service by name, None when absent
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;

    /// Create a service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Get a config map by name, None when absent
    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error>;

    /// Create a config map
    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error>;

    /// Update a config map in place
    async fn update_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct JobApiImpl {
    client: Client,
}

impl JobApiImpl {
    /// Create a new JobApiImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobApi for JobApiImpl {
    async fn patch_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: &[String],
    ) -> Result<(), Error> {
        let api: Api<MpiJob> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(
            name,
            &PatchParams::apply(CONTROLLER_NAME),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_job_status(
        &self,
        name: &str,
        namespace: &str,
        status: &MpiJobStatus,
    ) -> Result<(), Error> {
        let api: Api<MpiJob> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(CONTROLLER_NAME),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<MpiJob> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), pod).await {
            Ok(_) => Ok(()),
            // Lost a create race with a previous pass; the pod exists, which
            // is the state we wanted.
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), service).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(Some(cm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), cm).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = cm.name_any();
        api.patch(
            &name,
            &PatchParams::apply(CONTROLLER_NAME).force(),
            &Patch::Apply(cm),
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls and holds resources
/// that are expensive to create (like Kubernetes clients).
pub struct Context {
    /// Kubernetes client for API operations
    pub api: Arc<dyn JobApi>,
}

impl Context {
    /// Create a new Context with the given dependencies
    pub fn new(api: Arc<dyn JobApi>) -> Self {
        Self { api }
    }

    /// Create a new Context from a Kubernetes client
    pub fn from_client(client: Client) -> Self {
        Self {
            api: Arc::new(JobApiImpl::new(client)),
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(api: Arc<dyn JobApi>) -> Self {
        Self::new(api)
    }
}

// =============================================================================
// MpiJob reconciliation
// =============================================================================

/// Reconcile an MpiJob resource
///
/// Called whenever an MpiJob is created, updated, or deleted, and on the
/// fixed requeue. Ensures the hostfile ConfigMap, headless service, worker
/// pods, and launcher pod exist, then derives and persists the job status.
///
/// # Returns
///
/// An `Action` indicating when to requeue, or an `Error` if the pass failed.
#[instrument(skip(job, ctx), fields(job = %job.name_any()))]
pub async fn reconcile(job: Arc<MpiJob>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = job.name_any();
    let namespace = job
        .namespace()
        .ok_or_else(|| Error::reconcile("MpiJob is missing a namespace"))?;

    if job.metadata.deletion_timestamp.is_some() {
        if job.finalizers().iter().any(|f| f == FINALIZER_NAME) {
            let remaining: Vec<String> = job
                .finalizers()
                .iter()
                .filter(|f| *f != FINALIZER_NAME)
                .cloned()
                .collect();
            ctx.api
                .patch_finalizers(&name, &namespace, &remaining)
                .await?;
            info!("removed finalizer, children are garbage collected");
        }
        return Ok(Action::await_change());
    }

    if !job.finalizers().iter().any(|f| f == FINALIZER_NAME) {
        let mut finalizers = job.finalizers().to_vec();
        finalizers.push(FINALIZER_NAME.to_string());
        ctx.api
            .patch_finalizers(&name, &namespace, &finalizers)
            .await?;
        debug!("added finalizer");
        return Ok(Action::requeue(Duration::ZERO));
    }

    match run_pass(&job, &ctx, &name, &namespace).await {
        Ok(action) => Ok(action),
        Err(e) => {
            record_reconcile_failure(&job, &ctx, &name, &namespace, &e).await;
            Err(e)
        }
    }
}

/// One ensure-and-track pass over a live (non-deleting) job
async fn run_pass(
    job: &MpiJob,
    ctx: &Context,
    name: &str,
    namespace: &str,
) -> Result<Action, Error> {
    let mut job_status = job.status.clone().unwrap_or_default();
    if job_status.conditions.is_empty() {
        job_status.update_condition(
            JobConditionType::Created,
            "MpiJobCreated",
            format!("MpiJob {name} is created"),
        );
    }

    // A finished job is observed but never re-created: recreating a pod the
    // garbage collector reclaimed would rerun the workload.
    let finished = job_status.is_finished();

    if !finished {
        ensure_config_map(job, ctx, name, namespace).await?;
        ensure_service(job, ctx, name, namespace).await?;
    }

    let workers = ensure_workers(job, ctx, name, namespace, finished).await?;
    let launcher = ensure_launcher(job, ctx, name, namespace, finished).await?;

    status::track_status(name, &mut job_status, launcher.as_ref(), &workers);

    if job.status.as_ref() != Some(&job_status) {
        ctx.api
            .patch_job_status(name, namespace, &job_status)
            .await?;
    }

    if job_status.is_finished() {
        return finish_action(job, ctx, name, namespace, &job_status).await;
    }

    Ok(Action::requeue(Duration::from_secs(REQUEUE_DELAY_SECS)))
}

async fn ensure_config_map(
    job: &MpiJob,
    ctx: &Context,
    name: &str,
    namespace: &str,
) -> Result<(), Error> {
    let desired = resources::build_config_map(job);
    match ctx
        .api
        .get_config_map(&resources::config_map_name(name), namespace)
        .await?
    {
        None => {
            ctx.api.create_config_map(namespace, &desired).await?;
            info!("created hostfile config map");
        }
        Some(existing) => {
            if existing.data != desired.data {
                ctx.api.update_config_map(namespace, &desired).await?;
                info!("updated hostfile after spec change");
            }
        }
    }
    Ok(())
}

async fn ensure_service(
    job: &MpiJob,
    ctx: &Context,
    name: &str,
    namespace: &str,
) -> Result<(), Error> {
    if ctx
        .api
        .get_service(&resources::service_name(name), namespace)
        .await?
        .is_none()
    {
        let svc = resources::build_worker_service(job);
        ctx.api.create_service(namespace, &svc).await?;
        info!("created headless worker service");
    }
    Ok(())
}

/// Ensure worker pods 0..replicas exist, returning the ones observed
async fn ensure_workers(
    job: &MpiJob,
    ctx: &Context,
    name: &str,
    namespace: &str,
    finished: bool,
) -> Result<Vec<Pod>, Error> {
    let replicas = job.spec.worker_replicas();
    let mut observed = Vec::with_capacity(replicas as usize);
    for index in 0..replicas {
        let pod_name = resources::worker_pod_name(name, index);
        match ctx.api.get_pod(&pod_name, namespace).await? {
            Some(pod) => observed.push(pod),
            None if !finished => {
                let pod = resources::build_worker_pod(job, index)?;
                ctx.api.create_pod(namespace, &pod).await?;
                debug!(pod = %pod_name, "created worker pod");
            }
            None => {}
        }
    }
    Ok(observed)
}

async fn ensure_launcher(
    job: &MpiJob,
    ctx: &Context,
    name: &str,
    namespace: &str,
    finished: bool,
) -> Result<Option<Pod>, Error> {
    let pod_name = resources::launcher_pod_name(name);
    match ctx.api.get_pod(&pod_name, namespace).await? {
        Some(pod) => Ok(Some(pod)),
        None if !finished => {
            let pod = resources::build_launcher_pod(job)?;
            ctx.api.create_pod(namespace, &pod).await?;
            debug!(pod = %pod_name, "created launcher pod");
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Terminal handling: TTL delete, requeue at the remaining TTL, or stop
async fn finish_action(
    job: &MpiJob,
    ctx: &Context,
    name: &str,
    namespace: &str,
    job_status: &MpiJobStatus,
) -> Result<Action, Error> {
    let Some(ttl) = job.spec.ttl_seconds_after_finished() else {
        return Ok(Action::await_change());
    };
    let completion = job_status.completion_time.unwrap_or_else(Utc::now);
    let deadline = completion + chrono::Duration::seconds(i64::from(ttl));
    let now = Utc::now();
    if now >= deadline {
        info!(ttl_seconds = ttl, "TTL elapsed, deleting finished job");
        ctx.api.delete_job(name, namespace).await?;
        return Ok(Action::await_change());
    }
    let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
    debug!(remaining_secs = remaining.as_secs(), "requeueing for TTL");
    Ok(Action::requeue(remaining))
}

/// Record a failed pass on the job status, best effort
///
/// Terminal stickiness still applies: an already finished job keeps its
/// conditions even when a later pass errors.
async fn record_reconcile_failure(
    job: &MpiJob,
    ctx: &Context,
    name: &str,
    namespace: &str,
    error: &Error,
) {
    let mut job_status = job.status.clone().unwrap_or_default();
    if job_status.is_finished() {
        return;
    }
    job_status.update_condition(JobConditionType::Failed, "ReconcileError", error.to_string());
    if job_status.completion_time.is_none() {
        job_status.completion_time = Some(Utc::now());
    }
    if let Err(patch_err) = ctx
        .api
        .patch_job_status(name, namespace, &job_status)
        .await
    {
        warn!(error = %patch_err, "failed to record reconcile failure on status");
    }
}

/// Error policy for the MpiJob controller
///
/// All reconcile errors are retried on the standard delay: transient store
/// errors resolve themselves and terminal ones have already been recorded on
/// the status, so a retry is harmless.
pub fn error_policy(job: Arc<MpiJob>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        job = %job.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(REQUEUE_DELAY_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MpiJobSpec, ReplicaSpec, ReplicaType, RunPolicy};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn replica_spec(replicas: i32) -> ReplicaSpec {
        ReplicaSpec {
            replicas: Some(replicas),
            template: Some(PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "mpi".to_string(),
                        image: Some("mpioperator/mpi-pi:latest".to_string()),
                        command: Some(vec!["mpirun".to_string()]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            }),
            restart_policy: None,
        }
    }

    fn sample_job(name: &str, workers: i32) -> MpiJob {
        let mut replica_specs = BTreeMap::new();
        replica_specs.insert(ReplicaType::Launcher, replica_spec(1));
        replica_specs.insert(ReplicaType::Worker, replica_spec(workers));
        let mut job = MpiJob::new(
            name,
            MpiJobSpec {
                replica_specs,
                slots_per_worker: None,
                mpi_implementation: None,
                run_policy: None,
                network_policy: None,
            },
        );
        job.metadata.namespace = Some("training".to_string());
        job.metadata.uid = Some("abc-123".to_string());
        job.metadata.finalizers = Some(vec![FINALIZER_NAME.to_string()]);
        job
    }

    fn running_pod(name: &str) -> Pod {
        Pod {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // =========================================================================
    // Finalizer Stories
    // =========================================================================

    /// Story: a brand-new job gets the finalizer before anything else
    ///
    /// The first pass only installs the finalizer and requeues immediately;
    /// children are created on the next pass against the updated object.
    #[tokio::test]
    async fn story_first_pass_installs_finalizer() {
        let mut job = sample_job("train", 2);
        job.metadata.finalizers = None;

        let mut mock = MockJobApi::new();
        mock.expect_patch_finalizers()
            .withf(|name, ns, fins| {
                name == "train" && ns == "training" && fins.len() == 1 && fins[0] == FINALIZER_NAME
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(job), ctx).await.expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::ZERO));
    }

    /// Story: deletion removes the finalizer and lets GC do the rest
    #[tokio::test]
    async fn story_deletion_releases_finalizer() {
        let mut job = sample_job("train", 2);
        job.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut mock = MockJobApi::new();
        mock.expect_patch_finalizers()
            .withf(|name, _, fins| name == "train" && fins.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(job), ctx).await.expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Child Creation Stories
    // =========================================================================

    /// Story: a fresh job gets all its children in one pass
    ///
    /// ConfigMap, service, two workers, and the launcher are created; the
    /// status picks up the Created condition and the pass requeues on the
    /// standard delay.
    #[tokio::test]
    async fn story_fresh_job_creates_all_children() {
        let job = sample_job("train", 2);

        let mut mock = MockJobApi::new();
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        mock.expect_create_config_map()
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_get_service().returning(|_, _| Ok(None));
        mock.expect_create_service()
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_get_pod().returning(|_, _| Ok(None));
        // 2 workers + 1 launcher
        mock.expect_create_pod().times(3).returning(|_, _| Ok(()));
        mock.expect_patch_job_status()
            .withf(|name, _, status| {
                name == "train" && status.has_condition(JobConditionType::Created)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(job), ctx).await.expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_DELAY_SECS)));
    }

    /// Story: a second pass over an unchanged job creates nothing
    ///
    /// Every child already exists and the recorded status matches what the
    /// tracker derives, so no write reaches the API server.
    #[tokio::test]
    async fn story_steady_state_pass_is_read_only() {
        let mut job = sample_job("train", 1);
        let mut recorded = MpiJobStatus::default();
        recorded.update_condition(JobConditionType::Created, "MpiJobCreated", "MpiJob train is created");
        recorded.update_condition(JobConditionType::Running, "JobRunning", "MpiJob train is running");
        recorded.start_time = Some(Utc::now());
        let launcher = running_pod("train-launcher");
        let worker = running_pod("train-worker-0");
        status::track_status("train", &mut recorded, Some(&launcher), std::slice::from_ref(&worker));
        job.status = Some(recorded);

        let mut mock = MockJobApi::new();
        mock.expect_get_config_map()
            .returning(move |_, _| Ok(Some(resources::build_config_map(&sample_job("train", 1)))));
        mock.expect_get_service()
            .returning(|_, _| Ok(Some(Service::default())));
        mock.expect_get_pod()
            .returning(|name, _| Ok(Some(running_pod(name))));
        // no create_* and no patch_job_status expectations: any call panics
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(job), ctx).await.expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_DELAY_SECS)));
    }

    /// Story: a drifted hostfile is rewritten in place
    #[tokio::test]
    async fn story_hostfile_drift_triggers_update() {
        // job scaled from 1 to 3 workers; the stored ConfigMap still lists one
        let job = sample_job("train", 3);
        let stale = resources::build_config_map(&sample_job("train", 1));

        let mut mock = MockJobApi::new();
        mock.expect_get_config_map()
            .returning(move |_, _| Ok(Some(stale.clone())));
        mock.expect_update_config_map()
            .withf(|_, cm| {
                cm.data
                    .as_ref()
                    .and_then(|d| d.get("hostfile"))
                    .is_some_and(|h| h.lines().count() == 3)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_get_service()
            .returning(|_, _| Ok(Some(Service::default())));
        mock.expect_get_pod()
            .returning(|name, _| Ok(Some(running_pod(name))));
        mock.expect_patch_job_status().returning(|_, _, _| Ok(()));
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));

        reconcile(Arc::new(job), ctx).await.expect("reconcile");
    }

    // =========================================================================
    // TTL Stories
    // =========================================================================

    fn finished_job(name: &str, ttl: i32, completed_secs_ago: i64) -> MpiJob {
        let mut job = sample_job(name, 1);
        job.spec.run_policy = Some(RunPolicy {
            ttl_seconds_after_finished: Some(ttl),
            ..Default::default()
        });
        let mut recorded = MpiJobStatus::default();
        recorded.update_condition(JobConditionType::Succeeded, "JobSucceeded", "done");
        recorded.completion_time = Some(Utc::now() - chrono::Duration::seconds(completed_secs_ago));
        job.status = Some(recorded);
        job
    }

    /// Story: an expired TTL deletes the finished job
    #[tokio::test]
    async fn story_elapsed_ttl_deletes_job() {
        let job = finished_job("train", 60, 120);

        let mut mock = MockJobApi::new();
        mock.expect_get_pod().returning(|_, _| Ok(None));
        mock.expect_patch_job_status().returning(|_, _, _| Ok(()));
        mock.expect_delete_job()
            .withf(|name, ns| name == "train" && ns == "training")
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(job), ctx).await.expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    /// Story: an unexpired TTL requeues instead of deleting
    #[tokio::test]
    async fn story_pending_ttl_requeues_for_later() {
        let job = finished_job("train", 60, 10);

        let mut mock = MockJobApi::new();
        mock.expect_get_pod().returning(|_, _| Ok(None));
        mock.expect_patch_job_status().returning(|_, _, _| Ok(()));
        // no delete_job expectation: deleting early panics the test
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(job), ctx).await.expect("reconcile");
        assert_ne!(action, Action::await_change());
    }

    /// Story: a finished job without TTL parks until its spec changes
    #[tokio::test]
    async fn story_finished_job_without_ttl_stops() {
        let mut job = finished_job("train", 0, 0);
        job.spec.run_policy = None;

        let mut mock = MockJobApi::new();
        mock.expect_get_pod().returning(|_, _| Ok(None));
        mock.expect_patch_job_status().returning(|_, _, _| Ok(()));
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(job), ctx).await.expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Failure Recording Stories
    // =========================================================================

    /// Story: a pass that cannot build children records ReconcileError
    ///
    /// Admission normally prevents a role-less job, but one that slips
    /// through is marked Failed for the operator to inspect rather than
    /// silently dropped.
    #[tokio::test]
    async fn story_broken_job_records_reconcile_error() {
        let mut job = sample_job("train", 1);
        job.spec.replica_specs.remove(&ReplicaType::Launcher);

        let mut mock = MockJobApi::new();
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        mock.expect_create_config_map().returning(|_, _| Ok(()));
        mock.expect_get_service().returning(|_, _| Ok(None));
        mock.expect_create_service().returning(|_, _| Ok(()));
        mock.expect_get_pod().returning(|_, _| Ok(None));
        mock.expect_create_pod().returning(|_, _| Ok(()));
        mock.expect_patch_job_status()
            .withf(|_, _, status| {
                status
                    .conditions
                    .iter()
                    .any(|c| c.type_ == JobConditionType::Failed && c.reason == "ReconcileError")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));

        let result = reconcile(Arc::new(job), ctx).await;
        assert!(result.is_err());
    }
}
