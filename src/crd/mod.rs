//! Custom Resource Definitions for the MPI operator

mod mpijob;
mod types;

pub use mpijob::{MpiJob, MpiJobSpec, MpiJobStatus};
pub use types::{
    CleanPodPolicy, ConditionStatus, JobCondition, JobConditionType, MpiImplementation,
    NetworkPolicySpec, ReplicaSpec, ReplicaStatus, ReplicaType, RestartPolicy, RunPolicy,
    SchedulingPolicy, VALID_CLEAN_POD_POLICIES, VALID_MPI_IMPLEMENTATIONS,
    VALID_NETWORK_POLICY_TEMPLATES,
};
