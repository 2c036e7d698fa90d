//! Bounded capture of a crashed container's log.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, LogParams, PostParams};
use kube::Client;
use futures::AsyncReadExt;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::labels::{LABEL_SOURCE_POD_UID, LOG_CONFIGMAP_KEY};

/// Appends the truncation banner when exactly `max_bytes` were consumed.
/// The banner is part of the stored log, so the integrity digest covers it.
pub fn finish_log(text: String, read: usize, max_bytes: usize) -> (String, bool) {
    if read == max_bytes {
        let banner = format!("\n... [TRUNCATED {} KB] ...", max_bytes / 1024);
        (text + &banner, true)
    } else {
        (text, false)
    }
}

/// Streams the container's log, reading at most `max_bytes`.
///
/// Returns the captured text and whether it was truncated. Callers treat
/// failure as soft and substitute a placeholder.
pub async fn fetch_container_logs(
    client: Client,
    config: &Config,
    pod: &Pod,
    container: &str,
) -> Result<(String, bool)> {
    if container.is_empty() {
        return Err(Error::NoContainerName);
    }
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client, namespace);

    let params = LogParams {
        container: Some(container.to_string()),
        // Server-side cap as well, so a chatty container cannot force the
        // operator to drain megabytes it will discard.
        limit_bytes: Some(config.max_log_size_bytes as i64),
        ..LogParams::default()
    };
    let stream = pods.log_stream(name, &params).await?;
    tokio::pin!(stream);

    let max = config.max_log_size_bytes;
    let mut buf = vec![0u8; max];
    let mut read = 0;
    while read < max {
        let n = stream.read(&mut buf[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }
    buf.truncate(read);

    let text = String::from_utf8_lossy(&buf).into_owned();
    Ok(finish_log(text, read, max))
}

/// Builds the ConfigMap that carries the captured log into the forensic
/// namespace. Naming is left entirely to `generateName`; the server-assigned
/// name is what the replica mounts.
pub fn build_log_configmap(config: &Config, pod: &Pod, logs: &str) -> ConfigMap {
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let uid = pod.metadata.uid.clone().unwrap_or_default();

    let mut cm = ConfigMap::default();
    cm.metadata.generate_name = Some(format!("{pod_name}-logs-"));
    cm.metadata.namespace = Some(config.target_namespace.clone());
    cm.metadata.labels = Some(BTreeMap::from([(
        LABEL_SOURCE_POD_UID.to_string(),
        uid,
    )]));
    cm.data = Some(BTreeMap::from([(
        LOG_CONFIGMAP_KEY.to_string(),
        logs.to_string(),
    )]));
    cm
}

/// Creates the log ConfigMap and returns the server-assigned name.
pub async fn create_log_configmap(
    client: Client,
    config: &Config,
    pod: &Pod,
    logs: &str,
) -> Result<String> {
    let api: Api<ConfigMap> = Api::namespaced(client, &config.target_namespace);
    let created = api
        .create(&PostParams::default(), &build_log_configmap(config, pod, logs))
        .await?;
    Ok(created.metadata.name.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_banner_only_at_cap() {
        let (text, truncated) = finish_log("hello".to_string(), 5, 524_288);
        assert_eq!(text, "hello");
        assert!(!truncated);

        let body = "x".repeat(524_288);
        let (text, truncated) = finish_log(body.clone(), 524_288, 524_288);
        assert!(truncated);
        assert!(text.starts_with(&body));
        assert!(text.ends_with("\n... [TRUNCATED 512 KB] ..."));
    }

    #[test]
    fn log_configmap_uses_generate_name_only() {
        let config = Config::default();
        let mut pod = Pod::default();
        pod.metadata.name = Some("api-abc".to_string());
        pod.metadata.uid = Some("uid-1".to_string());

        let cm = build_log_configmap(&config, &pod, "boom");
        assert_eq!(cm.metadata.name, None);
        assert_eq!(cm.metadata.generate_name.as_deref(), Some("api-abc-logs-"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("debug-forensics"));
        assert_eq!(
            cm.metadata.labels.as_ref().unwrap()[LABEL_SOURCE_POD_UID],
            "uid-1"
        );
        assert_eq!(cm.data.as_ref().unwrap()[LOG_CONFIGMAP_KEY], "boom");
    }
}
