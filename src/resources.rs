//! Child resource builders for MPIJob
//!
//! Pure functions deriving child resource specifications from a job
//! declaration: launcher pod, worker pods, headless discovery service, and
//! the hostfile ConfigMap. No side effects; the controller decides when to
//! create or update what these functions produce.
//!
//! Every child carries a controller owner reference back to the MPIJob so
//! Kubernetes garbage collection reclaims it when the job is deleted. The
//! controller itself never deletes children.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, EnvVar, Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::{MpiJob, ReplicaType};
use crate::Error;

/// Label carrying the owning job's name on every child resource
pub const LABEL_JOB_NAME: &str = "mpijob-name";
/// Label carrying the replica role ("launcher" or "worker")
pub const LABEL_ROLE: &str = "mpijob-role";
/// Label carrying the worker index on worker pods
pub const LABEL_INDEX: &str = "mpijob-index";

/// Name of the launcher pod for a job
pub fn launcher_pod_name(job_name: &str) -> String {
    format!("{job_name}-launcher")
}

/// Name of the worker pod at the given index
pub fn worker_pod_name(job_name: &str, index: i32) -> String {
    format!("{job_name}-worker-{index}")
}

/// Name of the headless worker discovery service
pub fn service_name(job_name: &str) -> String {
    format!("{job_name}-worker")
}

/// Name of the hostfile ConfigMap
pub fn config_map_name(job_name: &str) -> String {
    format!("{job_name}-config")
}

fn base_labels(job_name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_JOB_NAME.to_string(), job_name.to_string()),
        ("app.kubernetes.io/name".to_string(), "mpijob".to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            component.to_string(),
        ),
    ])
}

fn child_meta(job: &MpiJob, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: job.namespace(),
        labels: Some(labels),
        owner_references: job.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Build the launcher pod for a job
///
/// The pod spec is the declared launcher template with role-identifying
/// labels and `MPIJOB_NAME` / `MPIJOB_ROLE` environment variables appended to
/// every container.
pub fn build_launcher_pod(job: &MpiJob) -> crate::Result<Pod> {
    let spec = job
        .spec
        .replica_specs
        .get(&ReplicaType::Launcher)
        .ok_or_else(|| Error::reconcile("launcher spec not found"))?;
    let mut pod_spec = spec
        .template
        .as_ref()
        .and_then(|t| t.spec.clone())
        .ok_or_else(|| Error::reconcile("launcher template has no pod spec"))?;

    let job_name = job.name_any();
    for container in &mut pod_spec.containers {
        let env = container.env.get_or_insert_with(Vec::new);
        env.push(env_var("MPIJOB_NAME", &job_name));
        env.push(env_var("MPIJOB_ROLE", ReplicaType::Launcher.label_value()));
    }

    let mut labels = base_labels(&job_name, "launcher");
    labels.insert(
        LABEL_ROLE.to_string(),
        ReplicaType::Launcher.label_value().to_string(),
    );

    Ok(Pod {
        metadata: child_meta(job, launcher_pod_name(&job_name), labels),
        spec: Some(pod_spec),
        ..Default::default()
    })
}

/// Build the worker pod at the given index
pub fn build_worker_pod(job: &MpiJob, index: i32) -> crate::Result<Pod> {
    let spec = job
        .spec
        .replica_specs
        .get(&ReplicaType::Worker)
        .ok_or_else(|| Error::reconcile("worker spec not found"))?;
    let mut pod_spec = spec
        .template
        .as_ref()
        .and_then(|t| t.spec.clone())
        .ok_or_else(|| Error::reconcile("worker template has no pod spec"))?;

    let job_name = job.name_any();
    for container in &mut pod_spec.containers {
        let env = container.env.get_or_insert_with(Vec::new);
        env.push(env_var("MPIJOB_NAME", &job_name));
        env.push(env_var("MPIJOB_ROLE", ReplicaType::Worker.label_value()));
        env.push(env_var("MPIJOB_WORKER_INDEX", &index.to_string()));
    }

    let mut labels = base_labels(&job_name, "worker");
    labels.insert(
        LABEL_ROLE.to_string(),
        ReplicaType::Worker.label_value().to_string(),
    );
    labels.insert(LABEL_INDEX.to_string(), index.to_string());

    Ok(Pod {
        metadata: child_meta(job, worker_pod_name(&job_name, index), labels),
        spec: Some(pod_spec),
        ..Default::default()
    })
}

/// Build the headless service that gives workers stable DNS names
///
/// Cluster-IP None, selecting worker pods on port 22 (the MPI runtime
/// bootstraps over SSH between pods).
pub fn build_worker_service(job: &MpiJob) -> Service {
    let job_name = job.name_any();
    Service {
        metadata: child_meta(job, service_name(&job_name), base_labels(&job_name, "service")),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(BTreeMap::from([
                (LABEL_JOB_NAME.to_string(), job_name.clone()),
                (
                    LABEL_ROLE.to_string(),
                    ReplicaType::Worker.label_value().to_string(),
                ),
            ])),
            ports: Some(vec![ServicePort {
                name: Some("mpi".to_string()),
                port: 22,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the ConfigMap carrying the MPI hostfile
pub fn build_config_map(job: &MpiJob) -> ConfigMap {
    let job_name = job.name_any();
    ConfigMap {
        metadata: child_meta(job, config_map_name(&job_name), base_labels(&job_name, "config")),
        data: Some(BTreeMap::from([(
            "hostfile".to_string(),
            generate_hostfile(job),
        )])),
        ..Default::default()
    }
}

/// Generate the MPI hostfile content for a job
///
/// One line per worker: `{job}-worker-{i} slots={slotsPerWorker}`. The
/// worker names resolve through the headless service.
pub fn generate_hostfile(job: &MpiJob) -> String {
    let job_name = job.name_any();
    let replicas = job.spec.worker_replicas();
    let slots = job.spec.slots_per_worker();

    let mut hostfile = String::new();
    for i in 0..replicas {
        hostfile.push_str(&format!(
            "{} slots={}\n",
            worker_pod_name(&job_name, i),
            slots
        ));
    }
    hostfile
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MpiJobSpec, ReplicaSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

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

    fn sample_job(name: &str, workers: i32, slots: Option<i32>) -> MpiJob {
        let mut replica_specs = BTreeMap::new();
        replica_specs.insert(ReplicaType::Launcher, replica_spec(1));
        replica_specs.insert(ReplicaType::Worker, replica_spec(workers));
        let mut job = MpiJob::new(
            name,
            MpiJobSpec {
                replica_specs,
                slots_per_worker: slots,
                mpi_implementation: None,
                run_policy: None,
                network_policy: None,
            },
        );
        job.metadata.namespace = Some("training".to_string());
        job.metadata.uid = Some("abc-123".to_string());
        job
    }

    // =========================================================================
    // Hostfile Stories
    // =========================================================================

    /// Story: hostfile lists every worker with the declared slot count
    ///
    /// For R workers and S slots the hostfile has exactly R lines of
    /// `{job}-worker-{i} slots={S}`; the MPI runtime reads this at startup.
    #[test]
    fn story_hostfile_lists_every_worker() {
        let job = sample_job("train", 3, Some(4));
        let hostfile = generate_hostfile(&job);

        let lines: Vec<&str> = hostfile.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "train-worker-0 slots=4");
        assert_eq!(lines[1], "train-worker-1 slots=4");
        assert_eq!(lines[2], "train-worker-2 slots=4");
    }

    #[test]
    fn test_hostfile_defaults_to_one_slot() {
        let job = sample_job("train", 2, None);
        assert_eq!(
            generate_hostfile(&job),
            "train-worker-0 slots=1\ntrain-worker-1 slots=1\n"
        );
    }

    // =========================================================================
    // Pod Builder Stories
    // =========================================================================

    /// Story: launcher pod is identifiable and owned by the job
    #[test]
    fn story_launcher_pod_carries_identity_and_ownership() {
        let job = sample_job("train", 2, None);
        let pod = build_launcher_pod(&job).unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("train-launcher"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("training"));

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(LABEL_JOB_NAME).unwrap(), "train");
        assert_eq!(labels.get(LABEL_ROLE).unwrap(), "launcher");

        let owners = pod.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "MpiJob");
        assert_eq!(owners[0].name, "train");
        assert_eq!(owners[0].controller, Some(true));
    }

    /// Story: workers learn their identity through environment variables
    #[test]
    fn story_worker_pod_env_carries_rank_identity() {
        let job = sample_job("train", 2, None);
        let pod = build_worker_pod(&job, 1).unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("train-worker-1"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_INDEX).unwrap(), "1");

        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        let get = |n: &str| {
            env.iter()
                .find(|e| e.name == n)
                .and_then(|e| e.value.clone())
        };
        assert_eq!(get("MPIJOB_NAME").as_deref(), Some("train"));
        assert_eq!(get("MPIJOB_ROLE").as_deref(), Some("worker"));
        assert_eq!(get("MPIJOB_WORKER_INDEX").as_deref(), Some("1"));
    }

    #[test]
    fn test_missing_role_is_a_reconcile_error() {
        let mut job = sample_job("train", 2, None);
        job.spec.replica_specs.remove(&ReplicaType::Launcher);

        let err = build_launcher_pod(&job).unwrap_err();
        assert!(err.to_string().contains("launcher spec not found"));
    }

    // =========================================================================
    // Service and ConfigMap Stories
    // =========================================================================

    /// Story: the discovery service is headless and selects workers only
    #[test]
    fn story_service_is_headless_worker_selector() {
        let job = sample_job("train", 2, None);
        let svc = build_worker_service(&job);

        assert_eq!(svc.metadata.name.as_deref(), Some("train-worker"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));

        let selector = spec.selector.unwrap();
        assert_eq!(selector.get(LABEL_ROLE).unwrap(), "worker");

        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 22);
    }

    #[test]
    fn test_config_map_holds_single_hostfile_key() {
        let job = sample_job("train", 2, Some(2));
        let cm = build_config_map(&job);

        assert_eq!(cm.metadata.name.as_deref(), Some("train-config"));
        let data = cm.data.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data.get("hostfile").unwrap(), &generate_hostfile(&job));
    }
}
