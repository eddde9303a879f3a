//! Supporting types for the MPIJob CRD

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Role of a replica set within an MPIJob
///
/// Closed enum rather than an open string map key: a typo'd role name fails
/// to deserialize at the API boundary instead of propagating past admission.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ReplicaType {
    /// The single coordinating process (runs `mpirun`)
    Launcher,
    /// One of N parallel training processes
    Worker,
}

impl ReplicaType {
    /// Label value used on child pods for this role
    pub fn label_value(&self) -> &'static str {
        match self {
            Self::Launcher => "launcher",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launcher => write!(f, "Launcher"),
            Self::Worker => write!(f, "Worker"),
        }
    }
}

/// Restart policy for replica pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never restart (default for batch workloads)
    #[default]
    Never,
    /// Restart only on failure
    OnFailure,
    /// Always restart
    Always,
}

/// Specification for one replica role (Launcher or Worker)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Desired number of replicas for this role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Pod template describing the containers to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,

    /// Restart policy for pods of this role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

/// MPI implementation used by the job
///
/// Stored as a string in the spec and validated at admission, so an unknown
/// implementation is denied with a readable message rather than a decode error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MpiImplementation {
    /// Open MPI
    OpenMpi,
    /// Intel MPI
    IntelMpi,
    /// MPICH
    Mpich,
}

/// The set of accepted `mpiImplementation` values
pub const VALID_MPI_IMPLEMENTATIONS: &[&str] = &["OpenMPI", "IntelMPI", "MPICH"];

impl std::str::FromStr for MpiImplementation {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OpenMPI" => Ok(Self::OpenMpi),
            "IntelMPI" => Ok(Self::IntelMpi),
            "MPICH" => Ok(Self::Mpich),
            _ => Err(crate::Error::validation(format!(
                "mpiImplementation must be one of {:?}, got {}",
                VALID_MPI_IMPLEMENTATIONS, s
            ))),
        }
    }
}

/// Policy for cleaning up pods after the job finishes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanPodPolicy {
    /// Delete all pods
    All,
    /// Delete only pods still running
    Running,
    /// Keep all pods
    None,
}

/// The set of accepted `cleanPodPolicy` values
pub const VALID_CLEAN_POD_POLICIES: &[&str] = &["All", "Running", "None"];

impl std::str::FromStr for CleanPodPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "All" => Ok(Self::All),
            "Running" => Ok(Self::Running),
            "None" => Ok(Self::None),
            _ => Err(crate::Error::validation(format!(
                "cleanPodPolicy must be one of {:?}, got {}",
                VALID_CLEAN_POD_POLICIES, s
            ))),
        }
    }
}

/// Execution policy for the job as a whole
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    /// Pod cleanup policy after the job finishes (All, Running, None)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<String>,

    /// Seconds to keep the finished job before automatic deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    /// Upper bound on job runtime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    /// Number of retries before the job is marked failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    /// Gang-scheduling configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
}

/// Gang-scheduling configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingPolicy {
    /// Priority class for all pods of the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,

    /// Queue name for gang scheduling (lowercase alphanumeric and hyphens,
    /// 1-63 chars, not hyphen-bounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

/// Network policy configuration for the job's pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    /// Policy template to apply (Default, Restricted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// The set of accepted `networkPolicy.template` values
pub const VALID_NETWORK_POLICY_TEMPLATES: &[&str] = &["Default", "Restricted"];

/// Job lifecycle condition type
///
/// Closed enum with a fixed priority order; the status tracker derives exactly
/// one of these per pass instead of comparing ad hoc strings.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum JobConditionType {
    /// Pods have been created but are not all running yet
    Created,
    /// Launcher and all workers are running
    Running,
    /// Launcher and all workers completed successfully (terminal)
    Succeeded,
    /// A pod or container failed (terminal)
    Failed,
}

impl JobConditionType {
    /// Returns true for the terminal condition types
    ///
    /// Once a terminal condition is recorded the job's status is frozen; no
    /// further condition transitions occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// A named fact about the job's lifecycle stage
///
/// At most one condition exists per type; updates mutate in place rather than
/// appending duplicates.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    /// Type of condition (Created, Running, Succeeded, Failed)
    #[serde(rename = "type")]
    pub type_: JobConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,

    /// Last time the condition was updated
    pub last_update_time: DateTime<Utc>,
}

impl JobCondition {
    /// Create a new true condition with the current timestamps
    pub fn new(
        type_: JobConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            type_,
            status: ConditionStatus::True,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
            last_update_time: now,
        }
    }
}

/// Observed pod counts for one replica role
///
/// Recomputed from scratch on every reconciliation pass; never incremented,
/// so a missed watch event cannot cause drift.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ReplicaStatus {
    /// Pods in Running or Pending phase
    pub active: i32,
    /// Pods in Succeeded phase
    pub succeeded: i32,
    /// Pods in Failed phase
    pub failed: i32,
}
