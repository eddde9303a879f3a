//! Controller implementation for the MpiJob CRD
//!
//! The operator binary wires [`reconcile`] and [`error_policy`] into a
//! `kube::runtime::Controller` watching MpiJobs and owning their child
//! pods, services, and config maps.

mod mpijob;

pub use mpijob::{error_policy, reconcile, Context, JobApi, JobApiImpl};

#[cfg(test)]
pub use mpijob::MockJobApi;
