//! MPIJob Custom Resource Definition
//!
//! An MPIJob declares a distributed training job: one launcher process
//! coordinating N workers over MPI. The spec is client-authored and immutable
//! once admitted (apart from a small allow-list); the status is owned by the
//! controller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    JobCondition, JobConditionType, NetworkPolicySpec, ReplicaSpec, ReplicaStatus, ReplicaType,
    RunPolicy,
};

/// Specification for an MPIJob
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "training.dev",
    version = "v1alpha1",
    kind = "MpiJob",
    plural = "mpijobs",
    singular = "mpijob",
    shortname = "mj",
    status = "MpiJobStatus",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"Started","type":"date","jsonPath":".status.startTime"}"#,
    printcolumn = r#"{"name":"Completed","type":"date","jsonPath":".status.completionTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MpiJobSpec {
    /// Replica specification per role
    ///
    /// Admission guarantees both roles are present, Launcher has exactly one
    /// replica, and Worker has at least one.
    pub replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,

    /// Processing slots advertised per worker in the generated hostfile
    /// (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots_per_worker: Option<i32>,

    /// MPI implementation (OpenMPI, IntelMPI, MPICH)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpi_implementation: Option<String>,

    /// Execution policy (cleanup, TTL, deadline, backoff, scheduling)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_policy: Option<RunPolicy>,

    /// Network policy template for the job's pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicySpec>,
}

impl MpiJobSpec {
    /// Effective slots per worker, defaulting to 1
    pub fn slots_per_worker(&self) -> i32 {
        self.slots_per_worker.unwrap_or(1)
    }

    /// Desired worker replica count, defaulting to 1
    pub fn worker_replicas(&self) -> i32 {
        self.replica_specs
            .get(&ReplicaType::Worker)
            .and_then(|s| s.replicas)
            .unwrap_or(1)
    }

    /// TTL after finish, if configured
    pub fn ttl_seconds_after_finished(&self) -> Option<i32> {
        self.run_policy
            .as_ref()
            .and_then(|rp| rp.ttl_seconds_after_finished)
    }
}

/// Status for an MPIJob, owned by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MpiJobStatus {
    /// Lifecycle conditions, at most one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<JobCondition>,

    /// Observed pod counts per role, recomputed every pass
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replica_statuses: BTreeMap<ReplicaType, ReplicaStatus>,

    /// Set once, the first time any pod is observed running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Set once, when the job reaches a terminal condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl MpiJobStatus {
    /// Update an existing condition of the given type in place, or append a
    /// new one
    ///
    /// In-place updates refresh both timestamps along with reason and message,
    /// preserving the at-most-one-per-type invariant.
    pub fn update_condition(
        &mut self,
        type_: JobConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let now = Utc::now();
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            existing.status = super::types::ConditionStatus::True;
            existing.reason = reason.into();
            existing.message = message.into();
            existing.last_transition_time = now;
            existing.last_update_time = now;
            return;
        }
        self.conditions
            .push(JobCondition::new(type_, reason, message));
    }

    /// Returns true if a condition of the given type exists with status True
    pub fn has_condition(&self, type_: JobConditionType) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == super::types::ConditionStatus::True)
    }

    /// Returns true once a terminal condition (Succeeded or Failed) is set
    pub fn is_finished(&self) -> bool {
        self.has_condition(JobConditionType::Succeeded)
            || self.has_condition(JobConditionType::Failed)
    }

    /// Latest true condition type, or "Created" before any condition exists
    pub fn phase(&self) -> String {
        if self.conditions.is_empty() {
            return "Created".to_string();
        }
        for cond in self.conditions.iter().rev() {
            if cond.status == super::types::ConditionStatus::True {
                return cond.type_.to_string();
            }
        }
        "Unknown".to_string()
    }

    /// Wall-clock duration from start to completion (or to now while running)
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.start_time?;
        let end = self.completion_time.unwrap_or_else(Utc::now);
        Some(end - start)
    }

    /// Human-readable worker progress summary, e.g. "2/3 running, 1 failed"
    pub fn worker_summary(&self) -> String {
        let Some(ws) = self.replica_statuses.get(&ReplicaType::Worker) else {
            return "No workers".to_string();
        };
        let total = ws.active + ws.succeeded + ws.failed;
        if ws.failed > 0 {
            format!("{}/{} running, {} failed", ws.active, total, ws.failed)
        } else if ws.succeeded > 0 {
            format!("{}/{} succeeded", ws.succeeded, total)
        } else {
            format!("{}/{} running", ws.active, total)
        }
    }
}
