//! Forensic replica construction.
//!
//! Deterministic transformation of a crashed pod's spec into a non-executing
//! clone: commands swapped for a sleep shell, probes stripped, privileges
//! dropped, every config/secret reference rewritten to its forensic-namespace
//! clone, plus the captured log and a toolkit of shell utilities mounted in.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, Pod, ResourceRequirements,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::labels::{
    forensic_time, ttl_label, ANNOTATION_CHECKPOINT, ANNOTATION_EXIT_CODE, ANNOTATION_LOG_S3_URL,
    ANNOTATION_LOG_SHA256, ANNOTATION_ORIGINAL_ARGS, ANNOTATION_ORIGINAL_COMMAND,
    ANNOTATION_SNAPSHOTS, LABEL_CRASH_SIGNATURE, LABEL_FORENSIC_TIME, LABEL_FORENSIC_TTL,
    LABEL_SOURCE_POD, LABEL_SOURCE_POD_UID, LOG_MOUNT_PATH, TOOLKIT_MOUNT_PATH,
};

const LOG_VOLUME: &str = "forensic-logs";
const TOOLKIT_VOLUME: &str = "toolbox";
const TOOLKIT_INIT_CONTAINER: &str = "install-toolkit";
const TOOLKIT_IMAGE: &str = "busybox:1.36";

/// Capabilities a replica container may never hold, on top of whatever the
/// original spec dropped.
const DROPPED_CAPABILITIES: [&str; 3] = ["NET_ADMIN", "SYS_ADMIN", "SYS_PTRACE"];

/// Everything the builder needs; `now` is a parameter so output is exact.
pub struct ReplicaInputs<'a> {
    pub source: &'a Pod,
    /// Rename map from the dependency cloner (`cm/{name}` → clone name).
    pub clones: &'a BTreeMap<String, String>,
    /// Server-assigned name of the log ConfigMap.
    pub log_configmap: &'a str,
    pub signature: &'a str,
    pub crashed_container: &'a str,
    pub exit_code: i32,
    pub log_sha256: &'a str,
    /// Claim name → snapshot name.
    pub snapshots: &'a BTreeMap<String, String>,
    pub checkpoint: Option<&'a str>,
    pub blob_url: Option<&'a str>,
    pub ttl: Duration,
    pub now: DateTime<Utc>,
}

fn cm_clone<'a>(clones: &'a BTreeMap<String, String>, name: &str) -> Option<&'a String> {
    clones.get(&format!("cm/{name}"))
}

fn secret_clone<'a>(clones: &'a BTreeMap<String, String>, name: &str) -> Option<&'a String> {
    clones.get(&format!("secret/{name}"))
}

fn rewrite_volume(volume: &mut Volume, clones: &BTreeMap<String, String>) {
    if let Some(cm) = volume.config_map.as_mut() {
        if let Some(new) = cm_clone(clones, cm.name.as_str()) {
            cm.name = new.clone();
        }
    }
    if let Some(secret) = volume.secret.as_mut() {
        if let Some(new) = secret
            .secret_name
            .as_deref()
            .and_then(|n| secret_clone(clones, n))
        {
            secret.secret_name = Some(new.clone());
        }
    }
    for source in volume
        .projected
        .iter_mut()
        .flat_map(|p| p.sources.iter_mut().flatten())
    {
        if let Some(cm) = source.config_map.as_mut() {
            if let Some(new) = cm_clone(clones, cm.name.as_str()) {
                cm.name = new.clone();
            }
        }
        if let Some(secret) = source.secret.as_mut() {
            if let Some(new) = secret_clone(clones, secret.name.as_str()) {
                secret.name = new.clone();
            }
        }
    }
}

fn rewrite_container_refs(container: &mut Container, clones: &BTreeMap<String, String>) {
    for env_from in container.env_from.iter_mut().flatten() {
        if let Some(cm) = env_from.config_map_ref.as_mut() {
            if let Some(new) = cm_clone(clones, cm.name.as_str()) {
                cm.name = new.clone();
            }
        }
        if let Some(secret) = env_from.secret_ref.as_mut() {
            if let Some(new) = secret_clone(clones, secret.name.as_str()) {
                secret.name = new.clone();
            }
        }
    }
    for env in container.env.iter_mut().flatten() {
        let Some(source) = env.value_from.as_mut() else {
            continue;
        };
        if let Some(cm) = source.config_map_key_ref.as_mut() {
            if let Some(new) = cm_clone(clones, cm.name.as_str()) {
                cm.name = new.clone();
            }
        }
        if let Some(secret) = source.secret_key_ref.as_mut() {
            if let Some(new) = secret_clone(clones, secret.name.as_str()) {
                secret.name = new.clone();
            }
        }
    }
}

/// Swaps the container's entrypoint for an idle shell with the toolkit on
/// PATH, strips probes, mounts the log and toolkit volumes, and drops the
/// dangerous capabilities.
fn neutralize_container(container: &mut Container) {
    container.command = Some(vec![
        format!("{TOOLKIT_MOUNT_PATH}/sh"),
        "-c".to_string(),
        format!(
            "export PATH=$PATH:{TOOLKIT_MOUNT_PATH}; \
             echo 'Forensic Mode Active. Run your app manually.'; sleep infinity"
        ),
    ]);
    container.args = None;
    container.liveness_probe = None;
    container.readiness_probe = None;
    container.startup_probe = None;

    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    mounts.push(VolumeMount {
        name: LOG_VOLUME.to_string(),
        mount_path: LOG_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    });
    mounts.push(VolumeMount {
        name: TOOLKIT_VOLUME.to_string(),
        mount_path: TOOLKIT_MOUNT_PATH.to_string(),
        ..Default::default()
    });

    let security = container.security_context.get_or_insert_with(SecurityContext::default);
    let caps = security.capabilities.get_or_insert_with(Capabilities::default);
    caps.drop
        .get_or_insert_with(Vec::new)
        .extend(DROPPED_CAPABILITIES.iter().map(|c| c.to_string()));
}

fn toolkit_init_container() -> Container {
    Container {
        name: TOOLKIT_INIT_CONTAINER.to_string(),
        image: Some(TOOLKIT_IMAGE.to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "cp /bin/sh /bin/ls /bin/cat /tools/".to_string(),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: TOOLKIT_VOLUME.to_string(),
            mount_path: "/tools".to_string(),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("100m".to_string())),
                ("memory".to_string(), Quantity("50Mi".to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Finds the crashed container in the original spec, main containers first,
/// and renders its command and args for the provenance annotations.
fn original_invocation(pod: &Pod, crashed: &str) -> (Option<String>, Option<String>) {
    let Some(spec) = pod.spec.as_ref() else {
        return (None, None);
    };
    let container = spec
        .containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .find(|c| c.name == crashed);
    let Some(container) = container else {
        return (None, None);
    };
    let join = |parts: &Option<Vec<String>>| {
        parts
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| p.join(" "))
    };
    (join(&container.command), join(&container.args))
}

fn replica_labels(inputs: &ReplicaInputs<'_>) -> BTreeMap<String, String> {
    let mut source_pod = inputs
        .source
        .metadata
        .name
        .clone()
        .unwrap_or_default();
    source_pod.truncate(63);

    BTreeMap::from([
        (LABEL_SOURCE_POD.to_string(), source_pod),
        (
            LABEL_SOURCE_POD_UID.to_string(),
            inputs.source.metadata.uid.clone().unwrap_or_default(),
        ),
        (
            LABEL_CRASH_SIGNATURE.to_string(),
            inputs.signature.to_string(),
        ),
        (LABEL_FORENSIC_TIME.to_string(), forensic_time(inputs.now)),
        (LABEL_FORENSIC_TTL.to_string(), ttl_label(inputs.ttl)),
    ])
}

fn replica_annotations(inputs: &ReplicaInputs<'_>) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([
        (
            ANNOTATION_EXIT_CODE.to_string(),
            inputs.exit_code.to_string(),
        ),
        (
            ANNOTATION_LOG_SHA256.to_string(),
            inputs.log_sha256.to_string(),
        ),
    ]);

    if !inputs.snapshots.is_empty() {
        let joined = inputs
            .snapshots
            .iter()
            .map(|(claim, snap)| format!("{claim}:{snap}"))
            .collect::<Vec<_>>()
            .join(",");
        annotations.insert(ANNOTATION_SNAPSHOTS.to_string(), joined);
    }
    if let Some(checkpoint) = inputs.checkpoint.filter(|c| !c.is_empty()) {
        annotations.insert(ANNOTATION_CHECKPOINT.to_string(), checkpoint.to_string());
    }
    if let Some(url) = inputs.blob_url.filter(|u| !u.is_empty()) {
        annotations.insert(ANNOTATION_LOG_S3_URL.to_string(), url.to_string());
    }

    let (command, args) = original_invocation(inputs.source, inputs.crashed_container);
    if let Some(command) = command {
        annotations.insert(ANNOTATION_ORIGINAL_COMMAND.to_string(), command);
    }
    if let Some(args) = args {
        annotations.insert(ANNOTATION_ORIGINAL_ARGS.to_string(), args);
    }
    annotations
}

/// Builds the forensic replica for `inputs.source` in `target_namespace`.
pub fn build_forensic_pod(target_namespace: &str, inputs: &ReplicaInputs<'_>) -> Pod {
    let source_name = inputs.source.metadata.name.as_deref().unwrap_or_default();

    let mut replica = Pod::default();
    replica.metadata.generate_name = Some(format!("{source_name}-forensic-"));
    replica.metadata.namespace = Some(target_namespace.to_string());
    replica.metadata.labels = Some(replica_labels(inputs));
    replica.metadata.annotations = Some(replica_annotations(inputs));

    let mut spec = inputs
        .source
        .spec
        .clone()
        .unwrap_or_default();

    // The replica must never land back on the tainted node, never restart,
    // and never hold a token for the source's service account.
    spec.node_name = None;
    spec.restart_policy = Some("Never".to_string());
    spec.automount_service_account_token = Some(false);
    spec.service_account_name = None;

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    for volume in volumes.iter_mut() {
        rewrite_volume(volume, inputs.clones);
    }
    volumes.push(Volume {
        name: LOG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: inputs.log_configmap.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });
    volumes.push(Volume {
        name: TOOLKIT_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });

    for container in spec.containers.iter_mut() {
        neutralize_container(container);
        rewrite_container_refs(container, inputs.clones);
    }

    // Original init containers keep their commands (they never run: the
    // toolkit installer is prepended and the pod idles), but their
    // references must still resolve in the forensic namespace.
    let init_containers = spec.init_containers.get_or_insert_with(Vec::new);
    for container in init_containers.iter_mut() {
        rewrite_container_refs(container, inputs.clones);
    }
    init_containers.insert(0, toolkit_init_container());

    replica.spec = Some(spec);
    replica
}
