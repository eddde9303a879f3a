//! MPI Operator - Kubernetes operator for distributed MPI training jobs
//!
//! The operator manages the lifecycle of multi-process training jobs: a single
//! launcher pod coordinates N worker pods over MPI. Clients declare a desired
//! job (replica counts, images, resources, scheduling policy) and the operator
//! converges cluster state toward that declaration, tracks progress through a
//! condition-based state machine, and cleans up after completion.
//!
//! # Architecture
//!
//! - An admission webhook gates every MPIJob write with an ordered battery of
//!   invariant checks, so the controller can rely on a well-formed spec
//! - The controller reconciles each MPIJob level-triggered: ensure children
//!   exist (idempotently), derive status from observed pod phases, persist,
//!   requeue
//! - Child pods, the headless discovery service, and the hostfile ConfigMap
//!   all carry an owner reference; Kubernetes garbage collection is the only
//!   thing that ever deletes them
//!
//! # Modules
//!
//! - [`crd`] - MPIJob Custom Resource Definition and supporting types
//! - [`controller`] - Reconciliation loop for MPIJob resources
//! - [`status`] - Condition and replica-count derivation from pod phases
//! - [`resources`] - Child resource builders (pods, service, hostfile)
//! - [`webhook`] - Validating admission webhook
//! - [`api`] - REST facade for job CRUD and log retrieval
//! - [`quantity`] - Exact resource-quantity arithmetic for validation
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod api;
pub mod controller;
pub mod crd;
pub mod error;
pub mod quantity;
pub mod resources;
pub mod status;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer attached to every MPIJob before children are created.
///
/// Blocks physical deletion until the controller has run its cleanup path.
pub const FINALIZER_NAME: &str = "mpijob.training.dev/finalizer";

/// Fixed requeue delay between reconciliation passes of an active job.
///
/// The loop is level-triggered: it re-derives the full desired action on every
/// pass, so a missed watch event only delays convergence by this interval.
pub const REQUEUE_DELAY_SECS: u64 = 10;

/// Field manager name used for server-side apply and status patches
pub const CONTROLLER_NAME: &str = "mpi-operator";

/// Default port for the validating admission webhook
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Default port for the REST API facade
pub const DEFAULT_API_PORT: u16 = 8080;
