//! Discovery and cloning of the config/secret objects a crashed pod
//! references, so the forensic replica resolves everything inside its own
//! namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Container, Pod, Secret};
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::core::ErrorResponse;
use kube::Client;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::labels::{ANNOTATION_NO_SECRET_CLONE, LABEL_SOURCE_POD_UID};

pub const REDACTED_VALUE: &[u8] = b"REDACTED";
pub const REDACTION_WARNING: &str =
    "Secret cloning is disabled for this pod. Values have been redacted.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DependencyKind {
    ConfigMap,
    Secret,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DependencyRef {
    pub kind: DependencyKind,
    pub name: String,
}

impl DependencyRef {
    fn config_map(name: &str) -> Self {
        Self {
            kind: DependencyKind::ConfigMap,
            name: name.to_string(),
        }
    }

    fn secret(name: &str) -> Self {
        Self {
            kind: DependencyKind::Secret,
            name: name.to_string(),
        }
    }

    /// Key under which the clone map records this dependency, and through
    /// which the replica builder rewrites references.
    pub fn clone_key(&self) -> String {
        match self.kind {
            DependencyKind::ConfigMap => format!("cm/{}", self.name),
            DependencyKind::Secret => format!("secret/{}", self.name),
        }
    }
}

/// Name a dependency takes in the forensic namespace. Deterministic, so a
/// retried reconciliation converges on the same object.
pub fn cloned_name(source_namespace: &str, name: &str) -> String {
    format!("{source_namespace}-{name}")
}

fn container_refs(container: &Container, refs: &mut Vec<DependencyRef>) {
    for env_from in container.env_from.iter().flatten() {
        if let Some(cm) = env_from
            .config_map_ref
            .as_ref()
            .map(|r| r.name.as_str())
        {
            refs.push(DependencyRef::config_map(cm));
        }
        if let Some(secret) = env_from.secret_ref.as_ref().map(|r| r.name.as_str()) {
            refs.push(DependencyRef::secret(secret));
        }
    }
    for env in container.env.iter().flatten() {
        let Some(source) = env.value_from.as_ref() else {
            continue;
        };
        if let Some(cm) = source
            .config_map_key_ref
            .as_ref()
            .map(|r| r.name.as_str())
        {
            refs.push(DependencyRef::config_map(cm));
        }
        if let Some(secret) = source
            .secret_key_ref
            .as_ref()
            .map(|r| r.name.as_str())
        {
            refs.push(DependencyRef::secret(secret));
        }
    }
}

/// Walks every config/secret reference reachable from the pod spec: volumes
/// (including projected sources) and env of both init and main containers.
/// The result is deduplicated, first occurrence wins.
pub fn collect_references(pod: &Pod) -> Vec<DependencyRef> {
    let mut refs = Vec::new();
    let Some(spec) = pod.spec.as_ref() else {
        return refs;
    };

    for volume in spec.volumes.iter().flatten() {
        if let Some(cm) = volume.config_map.as_ref().map(|v| v.name.as_str()) {
            refs.push(DependencyRef::config_map(cm));
        }
        if let Some(secret) = volume.secret.as_ref().and_then(|v| v.secret_name.as_deref()) {
            refs.push(DependencyRef::secret(secret));
        }
        for source in volume
            .projected
            .iter()
            .flat_map(|p| p.sources.iter().flatten())
        {
            if let Some(cm) = source.config_map.as_ref().map(|s| s.name.as_str()) {
                refs.push(DependencyRef::config_map(cm));
            }
            if let Some(secret) = source.secret.as_ref().map(|s| s.name.as_str()) {
                refs.push(DependencyRef::secret(secret));
            }
        }
    }

    for container in spec.containers.iter().chain(spec.init_containers.iter().flatten()) {
        container_refs(container, &mut refs);
    }

    let mut seen = std::collections::BTreeSet::new();
    refs.retain(|r| seen.insert(r.clone()));
    refs
}

/// Whether this pod's secrets must be redacted rather than copied.
pub fn secrets_redacted(config: &Config, pod: &Pod) -> bool {
    let opted_out = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_NO_SECRET_CLONE))
        .map(|v| v == "true")
        .unwrap_or(false);
    !config.enable_secret_cloning || opted_out
}

fn stamp_metadata(
    meta: &mut kube::api::ObjectMeta,
    src_labels: Option<BTreeMap<String, String>>,
    config: &Config,
    new_name: String,
    uid: &str,
) {
    meta.name = Some(new_name);
    meta.namespace = Some(config.target_namespace.clone());
    let mut labels = src_labels.unwrap_or_default();
    labels.insert(LABEL_SOURCE_POD_UID.to_string(), uid.to_string());
    meta.labels = Some(labels);
}

/// Builds the forensic-namespace copy of a ConfigMap, data carried verbatim.
pub fn build_cloned_configmap(
    config: &Config,
    source_namespace: &str,
    uid: &str,
    src: &ConfigMap,
) -> ConfigMap {
    let name = src.metadata.name.as_deref().unwrap_or_default();
    let mut dst = ConfigMap {
        data: src.data.clone(),
        binary_data: src.binary_data.clone(),
        ..Default::default()
    };
    stamp_metadata(
        &mut dst.metadata,
        src.metadata.labels.clone(),
        config,
        cloned_name(source_namespace, name),
        uid,
    );
    dst
}

/// Builds the forensic-namespace copy of a Secret. When `redact` is set every
/// value becomes the literal `REDACTED` byte-string; the key set and secret
/// type survive, and a `WARNING` key records what happened.
pub fn build_cloned_secret(
    config: &Config,
    source_namespace: &str,
    uid: &str,
    src: &Secret,
    redact: bool,
) -> Secret {
    let name = src.metadata.name.as_deref().unwrap_or_default();
    let mut dst = Secret {
        type_: src.type_.clone(),
        ..Default::default()
    };

    if redact {
        let data: BTreeMap<String, ByteString> = src
            .data
            .iter()
            .flatten()
            .map(|(k, _)| (k.clone(), ByteString(REDACTED_VALUE.to_vec())))
            .collect();
        let mut string_data: BTreeMap<String, String> = src
            .string_data
            .iter()
            .flatten()
            .map(|(k, _)| (k.clone(), "REDACTED".to_string()))
            .collect();
        string_data.insert("WARNING".to_string(), REDACTION_WARNING.to_string());
        dst.data = Some(data);
        dst.string_data = Some(string_data);
    } else {
        dst.data = src.data.clone();
        dst.string_data = src.string_data.clone();
    }

    stamp_metadata(
        &mut dst.metadata,
        src.metadata.labels.clone(),
        config,
        cloned_name(source_namespace, name),
        uid,
    );
    dst
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { reason, .. }) if reason == "NotFound")
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { reason, .. }) if reason == "AlreadyExists")
}

/// Clones every referenced ConfigMap and Secret into the forensic namespace.
///
/// Returns the rename map (`cm/{name}` / `secret/{name}` → clone name) the
/// replica builder consumes. A missing source object is the user's
/// misconfiguration, not ours: warn and keep going. Already-existing clones
/// from an earlier attempt are fine.
pub async fn clone_dependencies(
    client: Client,
    config: &Config,
    pod: &Pod,
) -> Result<BTreeMap<String, String>> {
    let source_namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let uid = pod.metadata.uid.clone().unwrap_or_default();
    let redact = secrets_redacted(config, pod);

    let src_cms: Api<ConfigMap> = Api::namespaced(client.clone(), source_namespace);
    let src_secrets: Api<Secret> = Api::namespaced(client.clone(), source_namespace);
    let dst_cms: Api<ConfigMap> = Api::namespaced(client.clone(), &config.target_namespace);
    let dst_secrets: Api<Secret> = Api::namespaced(client, &config.target_namespace);

    let mut clones = BTreeMap::new();
    for dep in collect_references(pod) {
        let new_name = cloned_name(source_namespace, &dep.name);
        match dep.kind {
            DependencyKind::ConfigMap => {
                let src = match src_cms.get(&dep.name).await {
                    Ok(src) => src,
                    Err(err) if is_not_found(&err) => {
                        warn!(
                            name = %dep.name,
                            namespace = %source_namespace,
                            "referenced ConfigMap not found, skipping"
                        );
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                let dst = build_cloned_configmap(config, source_namespace, &uid, &src);
                match dst_cms.create(&PostParams::default(), &dst).await {
                    Ok(_) => {}
                    Err(err) if is_already_exists(&err) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            DependencyKind::Secret => {
                let src = match src_secrets.get(&dep.name).await {
                    Ok(src) => src,
                    Err(err) if is_not_found(&err) => {
                        warn!(
                            name = %dep.name,
                            namespace = %source_namespace,
                            "referenced Secret not found, skipping"
                        );
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                let dst = build_cloned_secret(config, source_namespace, &uid, &src, redact);
                match dst_secrets.create(&PostParams::default(), &dst).await {
                    Ok(_) => {}
                    Err(err) if is_already_exists(&err) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        clones.insert(dep.clone_key(), new_name);
    }
    Ok(clones)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ConfigMapEnvSource, ConfigMapKeySelector, ConfigMapProjection, ConfigMapVolumeSource,
        EnvFromSource, EnvVar, EnvVarSource, PodSpec, ProjectedVolumeSource, SecretKeySelector,
        SecretProjection, SecretVolumeSource, Volume, VolumeProjection,
    };

    fn pod_with_spec(spec: PodSpec) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("prod".to_string());
        pod.metadata.uid = Some("uid-1".to_string());
        pod.spec = Some(spec);
        pod
    }

    fn full_reference_pod() -> Pod {
        pod_with_spec(PodSpec {
            volumes: Some(vec![
                Volume {
                    name: "cfg".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: "app-config".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "creds".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some("db-creds".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "proj".to_string(),
                    projected: Some(ProjectedVolumeSource {
                        sources: Some(vec![VolumeProjection {
                            config_map: Some(ConfigMapProjection {
                                name: "proj-config".to_string(),
                                ..Default::default()
                            }),
                            secret: Some(SecretProjection {
                                name: "proj-secret".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            containers: vec![Container {
                name: "app".to_string(),
                env_from: Some(vec![EnvFromSource {
                    config_map_ref: Some(ConfigMapEnvSource {
                        name: "app-config".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                env: Some(vec![EnvVar {
                    name: "DB_PASS".to_string(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: "db-creds".to_string(),
                            key: "password".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            init_containers: Some(vec![Container {
                name: "init-db".to_string(),
                env: Some(vec![EnvVar {
                    name: "SCHEMA".to_string(),
                    value_from: Some(EnvVarSource {
                        config_map_key_ref: Some(ConfigMapKeySelector {
                            name: "init-config".to_string(),
                            key: "schema".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        })
    }

    #[test]
    fn collects_and_dedups_all_reference_sites() {
        let refs = collect_references(&full_reference_pod());
        // app-config and db-creds are each referenced twice but appear once.
        let keys: Vec<String> = refs.iter().map(|r| r.clone_key()).collect();
        assert_eq!(
            keys,
            vec![
                "cm/app-config",
                "secret/db-creds",
                "cm/proj-config",
                "secret/proj-secret",
                "cm/init-config",
            ]
        );
    }

    #[test]
    fn cloned_name_is_namespace_prefixed() {
        assert_eq!(cloned_name("prod", "db-creds"), "prod-db-creds");
    }

    #[test]
    fn opt_out_annotation_forces_redaction() {
        let config = Config::default();
        assert!(config.enable_secret_cloning);

        let mut pod = Pod::default();
        assert!(!secrets_redacted(&config, &pod));

        pod.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_NO_SECRET_CLONE.to_string(),
            "true".to_string(),
        )]));
        assert!(secrets_redacted(&config, &pod));

        let disabled = Config {
            enable_secret_cloning: false,
            ..Config::default()
        };
        assert!(secrets_redacted(&disabled, &Pod::default()));
    }

    #[test]
    fn redacted_secret_keeps_keys_and_type() {
        let config = Config::default();
        let mut src = Secret::default();
        src.metadata.name = Some("db-creds".to_string());
        src.type_ = Some("Opaque".to_string());
        src.data = Some(BTreeMap::from([
            ("username".to_string(), ByteString(b"admin".to_vec())),
            ("password".to_string(), ByteString(b"hunter2".to_vec())),
        ]));

        let dst = build_cloned_secret(&config, "prod", "uid-1", &src, true);
        assert_eq!(dst.metadata.name.as_deref(), Some("prod-db-creds"));
        assert_eq!(dst.type_.as_deref(), Some("Opaque"));

        let data = dst.data.as_ref().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["username"].0, REDACTED_VALUE);
        assert_eq!(data["password"].0, REDACTED_VALUE);

        let string_data = dst.string_data.as_ref().unwrap();
        assert_eq!(string_data["WARNING"], REDACTION_WARNING);
        assert_eq!(
            dst.metadata.labels.as_ref().unwrap()[LABEL_SOURCE_POD_UID],
            "uid-1"
        );
    }

    #[test]
    fn verbatim_secret_clone_preserves_values() {
        let config = Config::default();
        let mut src = Secret::default();
        src.metadata.name = Some("db-creds".to_string());
        src.data = Some(BTreeMap::from([(
            "password".to_string(),
            ByteString(b"hunter2".to_vec()),
        )]));

        let dst = build_cloned_secret(&config, "prod", "uid-1", &src, false);
        assert_eq!(dst.data.as_ref().unwrap()["password"].0, b"hunter2");
        assert!(dst.string_data.is_none());
    }

    #[test]
    fn configmap_clone_copies_data_and_preserves_labels() {
        let config = Config::default();
        let mut src = ConfigMap::default();
        src.metadata.name = Some("app-config".to_string());
        src.metadata.labels = Some(BTreeMap::from([(
            "team".to_string(),
            "payments".to_string(),
        )]));
        src.data = Some(BTreeMap::from([(
            "log-level".to_string(),
            "debug".to_string(),
        )]));
        src.binary_data = Some(BTreeMap::from([(
            "blob".to_string(),
            ByteString(vec![0, 1, 2]),
        )]));

        let dst = build_cloned_configmap(&config, "prod", "uid-1", &src);
        assert_eq!(dst.metadata.name.as_deref(), Some("prod-app-config"));
        assert_eq!(dst.metadata.namespace.as_deref(), Some("debug-forensics"));
        assert_eq!(dst.data, src.data);
        assert_eq!(dst.binary_data, src.binary_data);
        let labels = dst.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["team"], "payments");
        assert_eq!(labels[LABEL_SOURCE_POD_UID], "uid-1");
    }
}
