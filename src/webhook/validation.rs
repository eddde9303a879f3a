//! Admission validation for MpiJob
//!
//! A fixed, ordered battery of structural checks run before a job is
//! committed to the store. The first failing check denies the request with
//! a human-readable message; each check is independent so the order only
//! decides which of several problems a user hears about first.
//!
//! Quantity comparisons are exact (see [`crate::quantity`]); "500m" of CPU
//! is never approximated through a float.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, ResourceQuota};
use kube::{Api, Client, ResourceExt};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    CleanPodPolicy, MpiImplementation, MpiJob, ReplicaSpec, ReplicaType,
    VALID_NETWORK_POLICY_TEMPLATES,
};
use crate::quantity::ResourceAmount;
use crate::Error;

const GPU_RESOURCE: &str = "nvidia.com/gpu";

// =============================================================================
// Quota source
// =============================================================================

/// Trait abstracting namespace quota lookups
///
/// Allows mocking the quota subsystem in tests while using the real API
/// server in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QuotaSource: Send + Sync {
    /// List the resource quotas active in a namespace
    async fn list_quotas(&self, namespace: &str) -> Result<Vec<ResourceQuota>, Error>;
}

/// Real quota source backed by the API server
pub struct QuotaSourceImpl {
    client: Client,
}

impl QuotaSourceImpl {
    /// Create a new QuotaSourceImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QuotaSource for QuotaSourceImpl {
    async fn list_quotas(&self, namespace: &str) -> Result<Vec<ResourceQuota>, Error> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&Default::default()).await?;
        Ok(list.items)
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Admission validator for MpiJob declarations
pub struct Validator {
    quotas: Arc<dyn QuotaSource>,
}

impl Validator {
    /// Create a new Validator with the given quota source
    pub fn new(quotas: Arc<dyn QuotaSource>) -> Self {
        Self { quotas }
    }

    /// Create a new Validator from a Kubernetes client
    pub fn from_client(client: Client) -> Self {
        Self::new(Arc::new(QuotaSourceImpl::new(client)))
    }

    /// Run the full check battery, returning the first failure
    pub async fn validate(&self, job: &MpiJob) -> Result<(), Error> {
        check_replica_structure(job)?;
        check_resource_specs(job)?;
        check_slots_per_worker(job)?;
        check_mpi_implementation(job)?;
        check_run_policy(job)?;
        check_queue_name(job)?;
        check_container_specs(job)?;
        self.check_quota_compliance(job).await?;
        check_security_context(job)?;
        check_network_policy(job)?;
        Ok(())
    }

    /// Sum requested resources over launcher and workers and compare against
    /// every quota the namespace currently carries
    ///
    /// Fails open: an unreachable quota subsystem admits the job and leaves
    /// enforcement to the built-in quota admission controller.
    async fn check_quota_compliance(&self, job: &MpiJob) -> Result<(), Error> {
        let Some(namespace) = job.namespace() else {
            return Ok(());
        };
        let required = required_resources(job);
        if required.is_empty() {
            return Ok(());
        }

        let quotas = match self.quotas.list_quotas(&namespace).await {
            Ok(quotas) => quotas,
            Err(e) => {
                warn!(error = %e, namespace = %namespace, "quota lookup failed, admitting without quota check");
                return Ok(());
            }
        };

        for quota in &quotas {
            let quota_name = quota.name_any();
            let Some(quota_status) = quota.status.as_ref() else {
                continue;
            };
            let Some(hard) = quota_status.hard.as_ref() else {
                continue;
            };
            let empty = BTreeMap::new();
            let used = quota_status.used.as_ref().unwrap_or(&empty);

            for (key, hard_q) in hard {
                let Some(needed) = required.get(normalize_quota_key(key)) else {
                    continue;
                };
                let hard_amount = ResourceAmount::from_quantity(hard_q)?;
                let used_amount = match used.get(key) {
                    Some(q) => ResourceAmount::from_quantity(q)?,
                    None => ResourceAmount::ZERO,
                };
                let available = hard_amount.sub(used_amount);
                if *needed > available {
                    return Err(Error::validation(format!(
                        "insufficient quota {quota_name}: requires {needed} {key} but only {available} available"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Map a quota resource key onto the request key it constrains
fn normalize_quota_key(key: &str) -> &str {
    key.strip_prefix("requests.").unwrap_or(key)
}

/// Total requests per resource name: launcher once plus workers times the
/// replica count
fn required_resources(job: &MpiJob) -> BTreeMap<String, ResourceAmount> {
    let mut totals: BTreeMap<String, ResourceAmount> = BTreeMap::new();
    for (role, spec) in &job.spec.replica_specs {
        let replicas = match role {
            ReplicaType::Launcher => 1,
            ReplicaType::Worker => spec.replicas.unwrap_or(1),
        };
        for container in containers(spec) {
            let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
            else {
                continue;
            };
            for (resource, q) in requests {
                let Ok(amount) = ResourceAmount::from_quantity(q) else {
                    continue;
                };
                let entry = totals
                    .entry(resource.clone())
                    .or_insert(ResourceAmount::ZERO);
                *entry = entry.add(amount.scale(replicas));
            }
        }
    }
    totals
}

// =============================================================================
// Individual checks
// =============================================================================

fn role_spec(job: &MpiJob, role: ReplicaType) -> Result<&ReplicaSpec, Error> {
    job.spec.replica_specs.get(&role).ok_or_else(|| {
        Error::validation(format!("replicaSpecs must define the {role} role"))
    })
}

fn containers(spec: &ReplicaSpec) -> &[Container] {
    spec.template
        .as_ref()
        .and_then(|t| t.spec.as_ref())
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[])
}

fn check_replica_structure(job: &MpiJob) -> Result<(), Error> {
    let launcher = role_spec(job, ReplicaType::Launcher)?;
    let worker = role_spec(job, ReplicaType::Worker)?;

    let launcher_replicas = launcher.replicas.unwrap_or(1);
    if launcher_replicas != 1 {
        return Err(Error::validation(format!(
            "Launcher replicas must be exactly 1, got {launcher_replicas}"
        )));
    }
    let worker_replicas = worker.replicas.unwrap_or(1);
    if worker_replicas < 1 {
        return Err(Error::validation(format!(
            "Worker replicas must be >= 1, got {worker_replicas}"
        )));
    }

    for (role, spec) in &job.spec.replica_specs {
        if containers(spec).is_empty() {
            return Err(Error::validation(format!(
                "{role} template must define at least one container"
            )));
        }
    }
    Ok(())
}

fn check_resource_specs(job: &MpiJob) -> Result<(), Error> {
    for (role, spec) in &job.spec.replica_specs {
        for container in containers(spec) {
            let requests = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref());
            let Some(requests) = requests else {
                return Err(Error::validation(format!(
                    "Container {} in {role} must declare CPU and memory requests",
                    container.name
                )));
            };
            for resource in ["cpu", "memory"] {
                if !requests.contains_key(resource) {
                    return Err(Error::validation(format!(
                        "Container {} in {role} must declare CPU and memory requests (missing {resource})",
                        container.name
                    )));
                }
            }

            if let Some(limits) = container.resources.as_ref().and_then(|r| r.limits.as_ref()) {
                for (resource, limit_q) in limits {
                    let Some(request_q) = requests.get(resource) else {
                        continue;
                    };
                    let limit = ResourceAmount::from_quantity(limit_q)?;
                    let request = ResourceAmount::from_quantity(request_q)?;
                    if limit < request {
                        return Err(Error::validation(format!(
                            "Container {} in {role}: {resource} limit {} is less than request {}",
                            container.name, limit_q.0, request_q.0
                        )));
                    }
                }
            }

            if let Some(gpu_q) = requests.get(GPU_RESOURCE) {
                if ResourceAmount::from_quantity(gpu_q)?.is_negative() {
                    return Err(Error::validation(format!(
                        "Container {} in {role}: GPU request must be >= 0, got {}",
                        container.name, gpu_q.0
                    )));
                }
            }
        }
    }
    Ok(())
}

fn check_slots_per_worker(job: &MpiJob) -> Result<(), Error> {
    if let Some(slots) = job.spec.slots_per_worker {
        if slots < 1 {
            return Err(Error::validation(format!(
                "slotsPerWorker must be >= 1, got {slots}"
            )));
        }
    }
    Ok(())
}

fn check_mpi_implementation(job: &MpiJob) -> Result<(), Error> {
    if let Some(implementation) = &job.spec.mpi_implementation {
        implementation.parse::<MpiImplementation>()?;
    }
    Ok(())
}

fn check_run_policy(job: &MpiJob) -> Result<(), Error> {
    let Some(rp) = &job.spec.run_policy else {
        return Ok(());
    };
    if let Some(policy) = &rp.clean_pod_policy {
        policy.parse::<CleanPodPolicy>()?;
    }
    if let Some(ttl) = rp.ttl_seconds_after_finished {
        if ttl < 0 {
            return Err(Error::validation(format!(
                "runPolicy.ttlSecondsAfterFinished must be >= 0, got {ttl}"
            )));
        }
    }
    if let Some(deadline) = rp.active_deadline_seconds {
        if deadline < 0 {
            return Err(Error::validation(format!(
                "runPolicy.activeDeadlineSeconds must be >= 0, got {deadline}"
            )));
        }
    }
    if let Some(backoff) = rp.backoff_limit {
        if backoff < 0 {
            return Err(Error::validation(format!(
                "runPolicy.backoffLimit must be >= 0, got {backoff}"
            )));
        }
    }
    Ok(())
}

fn check_queue_name(job: &MpiJob) -> Result<(), Error> {
    let queue = job
        .spec
        .run_policy
        .as_ref()
        .and_then(|rp| rp.scheduling_policy.as_ref())
        .and_then(|sp| sp.queue.as_deref());
    let Some(queue) = queue else {
        return Ok(());
    };

    let shape_ok = !queue.is_empty()
        && queue.len() <= 63
        && queue
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !queue.starts_with('-')
        && !queue.ends_with('-');
    if !shape_ok {
        return Err(Error::validation(format!(
            "schedulingPolicy.queue must match ^[a-z0-9-]{{1,63}}$ and not start or end with a hyphen, got {queue}"
        )));
    }
    Ok(())
}

fn check_container_specs(job: &MpiJob) -> Result<(), Error> {
    for (role, spec) in &job.spec.replica_specs {
        let declared_volumes: HashSet<&str> = spec
            .template
            .as_ref()
            .and_then(|t| t.spec.as_ref())
            .and_then(|s| s.volumes.as_ref())
            .map(|vols| vols.iter().map(|v| v.name.as_str()).collect())
            .unwrap_or_default();

        for container in containers(spec) {
            if container.image.as_deref().unwrap_or("").is_empty() {
                return Err(Error::validation(format!(
                    "Container {} in {role} must specify an image",
                    container.name
                )));
            }
            let has_command = container
                .command
                .as_ref()
                .is_some_and(|c| !c.is_empty());
            let has_args = container.args.as_ref().is_some_and(|a| !a.is_empty());
            if !has_command && !has_args {
                return Err(Error::validation(format!(
                    "Container {} in {role} must specify a command or args",
                    container.name
                )));
            }
            for mount in container.volume_mounts.iter().flatten() {
                if !declared_volumes.contains(mount.name.as_str()) {
                    return Err(Error::validation(format!(
                        "Container {} in {role} mounts undeclared volume {}",
                        container.name, mount.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Privileged containers are denied. Root and privilege-escalation settings
/// are observed but do not block; there is no warning channel on this path.
fn check_security_context(job: &MpiJob) -> Result<(), Error> {
    for (role, spec) in &job.spec.replica_specs {
        for container in containers(spec) {
            let Some(sc) = container.security_context.as_ref() else {
                continue;
            };
            if sc.privileged == Some(true) {
                return Err(Error::validation(format!(
                    "Container {} in {role} must not run privileged",
                    container.name
                )));
            }
            if sc.run_as_non_root == Some(false) || sc.allow_privilege_escalation == Some(true) {
                warn!(
                    container = %container.name,
                    role = %role,
                    "container allows root or privilege escalation"
                );
            }
        }
    }
    Ok(())
}

fn check_network_policy(job: &MpiJob) -> Result<(), Error> {
    let template = job
        .spec
        .network_policy
        .as_ref()
        .and_then(|np| np.template.as_deref());
    if let Some(template) = template {
        if !VALID_NETWORK_POLICY_TEMPLATES.contains(&template) {
            return Err(Error::validation(format!(
                "networkPolicy.template must be one of {:?}, got {}",
                VALID_NETWORK_POLICY_TEMPLATES, template
            )));
        }
    }
    Ok(())
}
