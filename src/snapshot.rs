//! Volume snapshots of the crashed pod's persistent claims.
//!
//! The VolumeSnapshot CRD has no typed binding here, so objects go through
//! the dynamic API. Snapshots are created in the source namespace because the
//! snapshot must be co-located with its claim.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ApiResource, DynamicObject, PostParams};
use kube::core::ErrorResponse;
use kube::{Client, ResourceExt};
use serde_json::json;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::labels::{ttl_label, LABEL_FORENSIC_TTL, LABEL_SOURCE_POD_UID};

pub fn volume_snapshot_resource() -> ApiResource {
    ApiResource {
        group: "snapshot.storage.k8s.io".to_string(),
        version: "v1".to_string(),
        api_version: "snapshot.storage.k8s.io/v1".to_string(),
        kind: "VolumeSnapshot".to_string(),
        plural: "volumesnapshots".to_string(),
    }
}

/// Builds one VolumeSnapshot for a PVC-backed volume, named by generate-name
/// so retries never conflict.
pub fn build_snapshot(config: &Config, pod: &Pod, volume_name: &str, claim: &str) -> DynamicObject {
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let uid = pod.metadata.uid.clone().unwrap_or_default();

    let mut snap = DynamicObject::new("", &volume_snapshot_resource()).data(json!({
        "spec": {
            "source": { "persistentVolumeClaimName": claim },
        }
    }));
    snap.metadata.name = None;
    snap.metadata.generate_name = Some(format!("forensic-{pod_name}-{volume_name}-"));
    snap.metadata.namespace = pod.metadata.namespace.clone();
    snap.metadata.labels = Some(BTreeMap::from([
        (LABEL_SOURCE_POD_UID.to_string(), uid),
        (
            LABEL_FORENSIC_TTL.to_string(),
            ttl_label(config.forensic_ttl),
        ),
    ]));
    snap
}

fn is_crd_missing(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { code: 404, .. }))
}

/// Creates one snapshot per persistent claim referenced by the pod.
///
/// Returns claim name → server-assigned snapshot name. A 404 from the API
/// means the snapshot CRD is absent; the caller downgrades that to a warning.
pub async fn snapshot_claims(
    client: Client,
    config: &Config,
    pod: &Pod,
) -> Result<BTreeMap<String, String>> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let api: Api<DynamicObject> =
        Api::namespaced_with(client, namespace, &volume_snapshot_resource());

    let mut snapshots = BTreeMap::new();
    let volumes = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .into_iter()
        .flatten();
    for volume in volumes {
        let Some(claim) = volume
            .persistent_volume_claim
            .as_ref()
            .map(|pvc| pvc.claim_name.clone())
        else {
            continue;
        };
        let snap = build_snapshot(config, pod, &volume.name, &claim);
        let created = match api.create(&PostParams::default(), &snap).await {
            Ok(created) => created,
            Err(err) if is_crd_missing(&err) => return Err(Error::SnapshotCrdMissing),
            Err(err) => return Err(err.into()),
        };
        snapshots.insert(claim, created.name_any());
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pod() -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some("api-abc".to_string());
        pod.metadata.namespace = Some("prod".to_string());
        pod.metadata.uid = Some("uid-1".to_string());
        pod
    }

    #[test]
    fn snapshot_created_in_source_namespace_with_generate_name() {
        let config = Config::default();
        let snap = build_snapshot(&config, &pod(), "data", "data-claim");

        assert_eq!(snap.metadata.name, None);
        assert_eq!(
            snap.metadata.generate_name.as_deref(),
            Some("forensic-api-abc-data-")
        );
        assert_eq!(snap.metadata.namespace.as_deref(), Some("prod"));

        let labels = snap.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_SOURCE_POD_UID], "uid-1");
        assert_eq!(labels[LABEL_FORENSIC_TTL], "1day");

        assert_eq!(
            snap.data["spec"]["source"]["persistentVolumeClaimName"],
            "data-claim"
        );
    }

    #[test]
    fn ttl_label_follows_config() {
        let config = Config {
            forensic_ttl: Duration::from_secs(3600),
            ..Config::default()
        };
        let snap = build_snapshot(&config, &pod(), "data", "data-claim");
        assert_eq!(
            snap.metadata.labels.as_ref().unwrap()[LABEL_FORENSIC_TTL],
            "1h"
        );
    }
}
