//! Status derivation for MPIJob
//!
//! Pure functions mapping observed child pods onto the job status. The
//! controller fetches pods and calls [`track_status`]; nothing here talks to
//! the API server, which keeps the derivation rules directly testable.
//!
//! Condition derivation is priority ordered and terminal states are sticky:
//! once `Succeeded` or `Failed` is recorded, no later pass may touch the
//! condition list. Replica counts are recomputed from scratch every pass so
//! a missed watch event cannot leave a stale counter behind.

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;

use crate::crd::{
    ConditionStatus, JobConditionType, MpiJobStatus, ReplicaStatus, ReplicaType,
};

const PHASE_RUNNING: &str = "Running";
const PHASE_PENDING: &str = "Pending";
const PHASE_SUCCEEDED: &str = "Succeeded";
const PHASE_FAILED: &str = "Failed";

/// Recompute conditions and replica counts from the observed pods
///
/// Mutates `status` in place. Rules, first match wins:
///
/// 1. Already terminal: leave conditions alone.
/// 2. Any pod Failed, or any container exited non-zero: `Failed`.
/// 3. Launcher and all workers Succeeded: `Succeeded`.
/// 4. Launcher and all workers Running: `Running` (added once).
/// 5. Any pod Pending: `Created` with the dominant pending cause.
pub fn track_status(
    job_name: &str,
    status: &mut MpiJobStatus,
    launcher: Option<&Pod>,
    workers: &[Pod],
) {
    recount_replicas(status, launcher, workers);

    let any_running = launcher
        .iter()
        .copied()
        .chain(workers.iter())
        .any(|p| pod_phase(p) == PHASE_RUNNING);
    if status.start_time.is_none() && any_running {
        status.start_time = Some(Utc::now());
    }

    if status.is_finished() {
        return;
    }

    if let Some((reason, message)) = detect_failure(launcher, workers) {
        ensure_condition(status, JobConditionType::Failed, &reason, &message);
        if status.completion_time.is_none() {
            status.completion_time = Some(Utc::now());
        }
        return;
    }

    let have_both = launcher.is_some() && !workers.is_empty();
    let all_in = |phase: &str| {
        launcher
            .iter()
            .copied()
            .chain(workers.iter())
            .all(|p| pod_phase(p) == phase)
    };

    if have_both && all_in(PHASE_SUCCEEDED) {
        ensure_condition(
            status,
            JobConditionType::Succeeded,
            "JobSucceeded",
            &format!("MpiJob {job_name} successfully completed"),
        );
        if status.completion_time.is_none() {
            status.completion_time = Some(Utc::now());
        }
        return;
    }

    if have_both && all_in(PHASE_RUNNING) {
        if !status.has_condition(JobConditionType::Running) {
            status.update_condition(
                JobConditionType::Running,
                "JobRunning",
                format!("MpiJob {job_name} is running"),
            );
        }
        return;
    }

    let any_pending = launcher
        .iter()
        .copied()
        .chain(workers.iter())
        .any(|p| pod_phase(p) == PHASE_PENDING);
    if any_pending {
        let (reason, message) = pending_cause(launcher, workers);
        ensure_condition(status, JobConditionType::Created, &reason, &message);
    }
}

fn recount_replicas(status: &mut MpiJobStatus, launcher: Option<&Pod>, workers: &[Pod]) {
    status.replica_statuses.insert(
        ReplicaType::Launcher,
        count_role(launcher.iter().copied()),
    );
    status
        .replica_statuses
        .insert(ReplicaType::Worker, count_role(workers.iter()));
}

fn count_role<'a>(pods: impl Iterator<Item = &'a Pod>) -> ReplicaStatus {
    let mut counts = ReplicaStatus::default();
    for pod in pods {
        match pod_phase(pod) {
            PHASE_RUNNING | PHASE_PENDING => counts.active += 1,
            PHASE_SUCCEEDED => counts.succeeded += 1,
            PHASE_FAILED => counts.failed += 1,
            _ => {}
        }
    }
    counts
}

/// Failure trigger and reason selection
///
/// Reason sources are consulted in a fixed order: launcher phase, launcher
/// container exit, worker container exit, worker phase aggregate, then a
/// generic fallback.
fn detect_failure(launcher: Option<&Pod>, workers: &[Pod]) -> Option<(String, String)> {
    let launcher_phase_failed = launcher.is_some_and(|p| pod_phase(p) == PHASE_FAILED);
    let launcher_container = launcher.and_then(container_failure);
    let worker_container = workers.iter().find_map(container_failure);
    let failed_workers: Vec<&str> = workers
        .iter()
        .filter(|p| pod_phase(p) == PHASE_FAILED)
        .map(pod_name)
        .collect();

    if !launcher_phase_failed
        && launcher_container.is_none()
        && worker_container.is_none()
        && failed_workers.is_empty()
    {
        return None;
    }

    // A Failed launcher always names the failure, whether or not the kubelet
    // recorded a phase reason. Container-level detail never outranks it.
    if let Some(pod) = launcher {
        if pod_phase(pod) == PHASE_FAILED {
            let reason = pod
                .status
                .as_ref()
                .and_then(|s| s.reason.clone())
                .unwrap_or_else(|| "LauncherFailed".to_string());
            let message = pod
                .status
                .as_ref()
                .and_then(|s| s.message.clone())
                .unwrap_or_else(|| format!("Launcher pod {} failed", pod_name(pod)));
            return Some((reason, message));
        }
    }
    if let Some(found) = launcher_container {
        return Some(found);
    }
    if let Some(found) = worker_container {
        return Some(found);
    }
    if !failed_workers.is_empty() {
        return Some((
            "WorkerFailed".to_string(),
            format!(
                "{} worker pod(s) failed: {}",
                failed_workers.len(),
                failed_workers.join(", ")
            ),
        ));
    }
    Some(("JobFailed".to_string(), "Unknown failure reason".to_string()))
}

fn container_failure(pod: &Pod) -> Option<(String, String)> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    for cs in statuses {
        if let Some(term) = cs.state.as_ref().and_then(|s| s.terminated.as_ref()) {
            if term.exit_code != 0 {
                let reason = term.reason.clone().unwrap_or_else(|| "Error".to_string());
                let message = format!(
                    "Container {} in pod {} exited with code {}",
                    cs.name,
                    pod_name(pod),
                    term.exit_code
                );
                return Some((reason, message));
            }
        }
    }
    None
}

/// Most frequent pending cause across pod conditions and container waiting
/// states, first seen winning ties
///
/// Only pods still in the Pending phase are counted; a Running pod with a
/// False condition is not waiting to be scheduled and must not skew the tally.
fn pending_cause(launcher: Option<&Pod>, workers: &[Pod]) -> (String, String) {
    // insertion order doubles as the tie-break order
    let mut causes: Vec<(String, String, usize)> = Vec::new();
    let mut tally = |reason: &str, message: String| {
        if let Some(entry) = causes.iter_mut().find(|(r, _, _)| r == reason) {
            entry.2 += 1;
        } else {
            causes.push((reason.to_string(), message, 1));
        }
    };

    for pod in launcher.iter().copied().chain(workers.iter()) {
        if pod_phase(pod) != PHASE_PENDING {
            continue;
        }
        let Some(pod_status) = pod.status.as_ref() else {
            continue;
        };
        for cond in pod_status.conditions.iter().flatten() {
            if cond.status == "False" {
                if let Some(reason) = &cond.reason {
                    tally(reason, cond.message.clone().unwrap_or_default());
                }
            }
        }
        for cs in pod_status.container_statuses.iter().flatten() {
            if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                if let Some(reason) = &waiting.reason {
                    tally(reason, waiting.message.clone().unwrap_or_default());
                }
            }
        }
    }

    causes
        .into_iter()
        .max_by_key(|(_, _, count)| *count)
        .map(|(reason, message, count)| {
            let message = if message.is_empty() {
                format!("{count} pod(s) pending: {reason}")
            } else {
                message
            };
            (reason, message)
        })
        .unwrap_or_else(|| {
            (
                "PodsPending".to_string(),
                "Waiting for pods to be scheduled".to_string(),
            )
        })
}

/// Set a condition only when it differs from what is already recorded, so an
/// unchanged pass leaves the status bit-identical
fn ensure_condition(
    status: &mut MpiJobStatus,
    type_: JobConditionType,
    reason: &str,
    message: &str,
) {
    let unchanged = status.conditions.iter().any(|c| {
        c.type_ == type_
            && c.status == ConditionStatus::True
            && c.reason == reason
            && c.message == message
    });
    if !unchanged {
        status.update_condition(type_, reason, message);
    }
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("")
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}
