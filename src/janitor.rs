//! TTL-based expiry of forensic replicas and cascade deletion of everything
//! that shares their source-pod UID.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::labels::{parse_ttl_label, ANNOTATION_HOLD, LABEL_FORENSIC_TTL, LABEL_SOURCE_POD_UID};
use crate::snapshot::volume_snapshot_resource;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Whether a replica is past its TTL and not held.
///
/// A missing or unparseable TTL label means the pod is never reaped; the hold
/// annotation wins over everything.
pub fn should_reap(pod: &Pod, now: DateTime<Utc>) -> bool {
    let held = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_HOLD))
        .map(|v| v == "true")
        .unwrap_or(false);
    if held {
        return false;
    }

    let Some(ttl) = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_FORENSIC_TTL))
        .and_then(|v| parse_ttl_label(v))
    else {
        return false;
    };
    let Some(created) = pod.metadata.creation_timestamp.as_ref() else {
        return false;
    };
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };
    created.0 + ttl < now
}

async fn delete_dependents(client: Client, config: &Config, uid: &str) {
    let selector = format!("{LABEL_SOURCE_POD_UID}={uid}");
    let params = ListParams::default().labels(&selector);

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &config.target_namespace);
    if let Ok(list) = config_maps.list(&params).await {
        for cm in list {
            let name = cm.name_any();
            if let Err(err) = config_maps.delete(&name, &DeleteParams::default()).await {
                warn!(%name, %err, "failed to delete expired log/config clone");
            }
        }
    }

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &config.target_namespace);
    if let Ok(list) = secrets.list(&params).await {
        for secret in list {
            let name = secret.name_any();
            if let Err(err) = secrets.delete(&name, &DeleteParams::default()).await {
                warn!(%name, %err, "failed to delete expired secret clone");
            }
        }
    }

    // Snapshots live in source namespaces, so locate them by label selector
    // across the whole cluster. A missing CRD is fine.
    let resource = volume_snapshot_resource();
    let snapshots: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
    match snapshots.list(&params).await {
        Ok(list) => {
            for snap in list {
                let name = snap.name_any();
                let namespace = snap.namespace().unwrap_or_default();
                info!(%name, %namespace, "deleting expired forensic snapshot");
                let api: Api<DynamicObject> =
                    Api::namespaced_with(client.clone(), &namespace, &resource);
                if let Err(err) = api.delete(&name, &DeleteParams::default()).await {
                    warn!(%name, %namespace, %err, "failed to delete expired snapshot");
                }
            }
        }
        Err(err) => {
            debug!(%err, "could not list volume snapshots for cleanup (CRD missing?)");
        }
    }
}

/// One janitor pass over the forensic namespace.
pub async fn sweep(client: Client, config: &Config) {
    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.target_namespace);
    let list = match pods.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(err) => {
            error!(%err, "failed to list forensic pods for TTL cleanup");
            return;
        }
    };

    let now = Utc::now();
    for pod in list {
        if !should_reap(&pod, now) {
            continue;
        }
        let name = pod.name_any();
        info!(pod = %name, "cleaning up expired forensic pod");

        // The source UID, not the replica's own: it is the foreign key the
        // dependencies were stamped with.
        let uid = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_SOURCE_POD_UID))
            .cloned()
            .unwrap_or_default();

        if let Err(err) = pods.delete(&name, &DeleteParams::default()).await {
            error!(pod = %name, %err, "failed to delete expired forensic pod");
            continue;
        }
        if !uid.is_empty() {
            delete_dependents(client.clone(), config, &uid).await;
        }
    }
}

/// Runs the janitor until the process exits, one sweep per hour.
pub async fn run(client: Client, config: Config) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    // The interval fires immediately; the first real sweep waits a full
    // period, matching the reconciler having nothing to reap at startup.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        sweep(client.clone(), &config).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::ttl_label;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn replica(created: DateTime<Utc>, ttl: Option<&str>, hold: bool) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.creation_timestamp = Some(Time(created));
        if let Some(ttl) = ttl {
            pod.metadata.labels = Some(BTreeMap::from([(
                LABEL_FORENSIC_TTL.to_string(),
                ttl.to_string(),
            )]));
        }
        if hold {
            pod.metadata.annotations = Some(BTreeMap::from([(
                ANNOTATION_HOLD.to_string(),
                "true".to_string(),
            )]));
        }
        pod
    }

    #[test]
    fn expired_pod_is_reaped() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();
        let pod = replica(t0, Some("1h"), false);
        assert!(should_reap(&pod, t0 + chrono::Duration::hours(2)));
    }

    #[test]
    fn unexpired_pod_is_kept() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();
        let pod = replica(t0, Some("1h"), false);
        assert!(!should_reap(&pod, t0 + chrono::Duration::minutes(30)));
    }

    #[test]
    fn hold_annotation_exempts_expired_pod() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();
        let held = replica(t0, Some("1h"), true);
        let unheld = replica(t0, Some("1h"), false);
        let now = t0 + chrono::Duration::hours(2);
        assert!(!should_reap(&held, now));
        assert!(should_reap(&unheld, now));
    }

    #[test]
    fn missing_or_invalid_ttl_is_never_reaped() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();
        let now = t0 + chrono::Duration::days(365);
        assert!(!should_reap(&replica(t0, None, false), now));
        assert!(!should_reap(&replica(t0, Some("soon"), false), now));
    }

    #[test]
    fn generated_ttl_labels_parse() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap();
        let label = ttl_label(Duration::from_secs(24 * 3600));
        let pod = replica(t0, Some(&label), false);
        assert!(should_reap(&pod, t0 + chrono::Duration::days(2)));
        assert!(!should_reap(&pod, t0 + chrono::Duration::hours(12)));
    }
}
