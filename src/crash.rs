//! Crash classification over observed pod status.

use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod};

/// The container the reconciler decided crashed, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crash {
    pub container: String,
    pub exit_code: i32,
    pub reason: String,
}

fn terminated_crash(state: Option<&ContainerState>) -> Option<(i32, String)> {
    let term = state?.terminated.as_ref()?;
    let reason = term.reason.as_deref().unwrap_or_default();
    if reason == "Error" || reason == "OOMKilled" || term.exit_code != 0 {
        let reason = if reason.is_empty() { "Error" } else { reason };
        return Some((term.exit_code, reason.to_string()));
    }
    None
}

fn status_crash(status: &ContainerStatus) -> Option<Crash> {
    // Current state first, then last state so CrashLoopBackOff pods (already
    // restarted into Waiting) are still classified.
    terminated_crash(status.state.as_ref())
        .or_else(|| terminated_crash(status.last_state.as_ref()))
        .map(|(exit_code, reason)| Crash {
            container: status.name.clone(),
            exit_code,
            reason,
        })
}

/// Returns the first crashed container of `pod`, checking main container
/// statuses before init container statuses.
///
/// Falls back to the `Failed` pod phase with the first main container and
/// exit code 1 when no per-container status carries a termination record.
pub fn classify(pod: &Pod) -> Option<Crash> {
    let status = pod.status.as_ref();

    let crash = status
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .chain(
            status
                .and_then(|s| s.init_container_statuses.as_ref())
                .into_iter()
                .flatten(),
        )
        .find_map(status_crash);
    if crash.is_some() {
        return crash;
    }

    if status.and_then(|s| s.phase.as_deref()) == Some("Failed") {
        let container = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone())?;
        return Some(Crash {
            container,
            exit_code: 1,
            reason: "PodFailed".to_string(),
        });
    }

    None
}
