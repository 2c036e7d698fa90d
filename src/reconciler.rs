//! The reconciliation engine: crash gating, signature dedup, and the ordered
//! materialization of a forensic replica.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::checkpoint::trigger_checkpoint;
use crate::collector::{build_collector_job, CollectorJob};
use crate::config::Config;
use crate::crash::{classify, Crash};
use crate::deps::clone_dependencies;
use crate::error::{Error, Result};
use crate::janitor;
use crate::labels::LABEL_CRASH_SIGNATURE;
use crate::logs::{create_log_configmap, fetch_container_logs};
use crate::metrics::Metrics;
use crate::namespace::{ensure_namespace, ensure_network_policy};
use crate::replica::{build_forensic_pod, ReplicaInputs};
use crate::signature::{crash_signature, sha256_hex};
use crate::snapshot::snapshot_claims;
use crate::storage::{log_object_key, BlobStore};

/// Where the collector job uploads checkpoint archives. Present only when
/// both a bucket and an operator image are configured.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub image: String,
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
}

/// Shared state handed to every reconciliation.
pub struct Context {
    pub client: Client,
    pub config: Config,
    pub store: Arc<dyn BlobStore>,
    pub recorder: Recorder,
    pub metrics: Metrics,
    pub collector: Option<CollectorSettings>,
}

async fn publish(ctx: &Context, pod: &Pod, type_: EventType, reason: &str, note: String) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: "Forensics".to_string(),
        secondary: None,
    };
    if let Err(err) = ctx.recorder.publish(&event, &pod.object_ref(&())).await {
        warn!(%err, reason, "failed to publish event");
    }
}

fn step_failed(ctx: &Context, namespace: &str, step: &str) {
    ctx.metrics
        .pod_creation_errors_total
        .with_label_values(&[namespace, step])
        .inc();
}

/// True when a replica for this signature was created inside the rate-limit
/// window. SUPPRESSED is never persisted; it is recomputed by listing.
async fn recently_materialized(ctx: &Context, signature: &str) -> Result<bool> {
    let replicas: Api<Pod> =
        Api::namespaced(ctx.client.clone(), &ctx.config.target_namespace);
    let selector = format!("{LABEL_CRASH_SIGNATURE}={signature}");
    let list = replicas
        .list(&ListParams::default().labels(&selector))
        .await?;

    let now = Utc::now();
    let window = chrono::Duration::from_std(ctx.config.rate_limit_window)
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    let recent = list.iter().any(|replica| {
        replica
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|created| now - created.0 < window)
            .unwrap_or(false)
    });
    Ok(recent)
}

/// Launches the node-pinned collector job that streams the checkpoint archive
/// off the node. Best-effort.
async fn launch_collector(ctx: &Context, pod: &Pod, replica: &Pod, checkpoint_path: &str, key: String) {
    let Some(settings) = ctx.collector.as_ref() else {
        return;
    };
    let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
        return;
    };

    let owner = Some(OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name: replica.name_any(),
        uid: replica.metadata.uid.clone().unwrap_or_default(),
        ..Default::default()
    });
    let job = build_collector_job(&CollectorJob {
        namespace: ctx.config.target_namespace.clone(),
        node_name,
        checkpoint_path: checkpoint_path.to_string(),
        bucket: settings.bucket.clone(),
        region: settings.region.clone(),
        endpoint: settings.endpoint.clone(),
        key,
        image: settings.image.clone(),
        owner,
    });

    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ctx.config.target_namespace);
    if let Err(err) = jobs.create(&PostParams::default(), &job).await {
        warn!(%err, "failed to launch checkpoint collector job");
    }
}

pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let name = pod.name_any();

    // Gating: allow-list, ignore-list, our own namespace, deletions.
    if !ctx.config.watches_namespace(&namespace) {
        return Ok(Action::await_change());
    }
    if pod.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let Some(Crash {
        container,
        exit_code,
        reason,
    }) = classify(&pod)
    else {
        return Ok(Action::await_change());
    };

    info!(
        pod = %name,
        %namespace,
        %container,
        exit_code,
        %reason,
        "detected crashed pod"
    );
    ctx.metrics
        .crashes_total
        .with_label_values(&[&namespace, &reason])
        .inc();

    // Dedup and rate limiting by crash signature.
    let signature = crash_signature(&pod, &container, exit_code);
    match recently_materialized(&ctx, &signature).await {
        Ok(true) => {
            debug!(pod = %name, %signature, "skipping forensic creation (rate limited)");
            return Ok(Action::await_change());
        }
        Ok(false) => {}
        Err(err) => {
            step_failed(&ctx, &namespace, "Deduplication");
            return Err(err);
        }
    }

    publish(
        &ctx,
        &pod,
        EventType::Warning,
        "ForensicAnalysisStarted",
        format!(
            "Crash detected in container {container} (ExitCode: {exit_code}). Creating forensic pod."
        ),
    )
    .await;

    // Hard: the isolated namespace and its egress lockdown must exist before
    // anything is cloned into it.
    if let Err(err) = ensure_namespace(ctx.client.clone(), &ctx.config).await {
        step_failed(&ctx, &namespace, "EnsureNamespace");
        return Err(err);
    }
    if let Err(err) = ensure_network_policy(ctx.client.clone(), &ctx.config).await {
        step_failed(&ctx, &namespace, "EnsureNetworkPolicy");
        return Err(err);
    }

    // Soft: a failed log fetch must not cost us the rest of the capture.
    let logs = match fetch_container_logs(ctx.client.clone(), &ctx.config, &pod, &container).await
    {
        Ok((logs, truncated)) => {
            if truncated {
                debug!(pod = %name, "captured log hit the size cap");
            }
            logs
        }
        Err(err) => {
            warn!(pod = %name, %err, "failed to fetch logs (continuing without logs)");
            publish(
                &ctx,
                &pod,
                EventType::Warning,
                "ForensicLogCaptureFailed",
                format!("Failed to fetch logs: {err}"),
            )
            .await;
            format!("Error fetching logs: {err}")
        }
    };

    // Soft: off-cluster export is chain-of-custody sugar, not a requirement.
    let captured_at = Utc::now();
    let mut blob_url = String::new();
    if !logs.is_empty() {
        let key = log_object_key(&namespace, &name, captured_at);
        match ctx.store.upload(&key, logs.as_bytes()).await {
            Ok(url) if !url.is_empty() => {
                publish(
                    &ctx,
                    &pod,
                    EventType::Normal,
                    "ForensicExportSuccess",
                    format!("Uploaded logs to {url}"),
                )
                .await;
                blob_url = url;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(pod = %name, %err, "failed to upload logs");
                publish(
                    &ctx,
                    &pod,
                    EventType::Warning,
                    "ForensicExportFailed",
                    format!("Failed to upload logs: {err}"),
                )
                .await;
            }
        }
    }

    // Hard: the replica's references are rewritten through this map, so the
    // clones must exist first.
    let clones = match clone_dependencies(ctx.client.clone(), &ctx.config, &pod).await {
        Ok(clones) => clones,
        Err(err) => {
            step_failed(&ctx, &namespace, "CloneDependencies");
            return Err(err);
        }
    };

    // Hard: the replica mounts this object.
    let log_configmap =
        match create_log_configmap(ctx.client.clone(), &ctx.config, &pod, &logs).await {
            Ok(name) => name,
            Err(err) => {
                step_failed(&ctx, &namespace, "CreateLogConfigMap");
                return Err(err);
            }
        };
    let log_sha256 = sha256_hex(logs.as_bytes());

    // Soft: clusters without the snapshot CRD still get everything else.
    let snapshots = match snapshot_claims(ctx.client.clone(), &ctx.config, &pod).await {
        Ok(snapshots) => {
            if !snapshots.is_empty() {
                publish(
                    &ctx,
                    &pod,
                    EventType::Normal,
                    "ForensicSnapshotsCreated",
                    format!("Created volume snapshots for {} PVCs", snapshots.len()),
                )
                .await;
            }
            snapshots
        }
        Err(err) => {
            warn!(pod = %name, %err, "failed to snapshot PVCs");
            publish(
                &ctx,
                &pod,
                EventType::Warning,
                "ForensicSnapshotFailed",
                format!("Failed to snapshot PVCs: {err}"),
            )
            .await;
            Default::default()
        }
    };

    // Soft: checkpointing is gated on config and needs a known container.
    let mut checkpoint_location = String::new();
    if ctx.config.enable_checkpointing && !container.is_empty() {
        match trigger_checkpoint(ctx.client.clone(), &ctx.config, &pod, &container).await {
            Ok(location) => {
                publish(
                    &ctx,
                    &pod,
                    EventType::Normal,
                    "ForensicCheckpointCreated",
                    format!("Container checkpoint created at {location}"),
                )
                .await;
                checkpoint_location = location;
            }
            Err(err) => {
                warn!(pod = %name, %err, "failed to trigger checkpoint");
                publish(
                    &ctx,
                    &pod,
                    EventType::Warning,
                    "ForensicCheckpointFailed",
                    format!("Failed to trigger checkpoint: {err}"),
                )
                .await;
            }
        }
    }

    // Hard: the replica itself.
    let inputs = ReplicaInputs {
        source: &pod,
        clones: &clones,
        log_configmap: &log_configmap,
        signature: &signature,
        crashed_container: &container,
        exit_code,
        log_sha256: &log_sha256,
        snapshots: &snapshots,
        checkpoint: (!checkpoint_location.is_empty()).then_some(checkpoint_location.as_str()),
        blob_url: (!blob_url.is_empty()).then_some(blob_url.as_str()),
        ttl: ctx.config.forensic_ttl,
        now: Utc::now(),
    };
    let replica = build_forensic_pod(&ctx.config.target_namespace, &inputs);
    let replicas: Api<Pod> = Api::namespaced(ctx.client.clone(), &ctx.config.target_namespace);
    let created = match replicas.create(&PostParams::default(), &replica).await {
        Ok(created) => created,
        Err(err) => {
            step_failed(&ctx, &namespace, "CreateForensicPod");
            return Err(err.into());
        }
    };

    info!(
        pod = %name,
        replica = %created.name_any(),
        log_sha256 = %log_sha256,
        "created forensic pod"
    );
    publish(
        &ctx,
        &pod,
        EventType::Normal,
        "ForensicPodCreated",
        format!(
            "Created forensic pod {} (LogHash: {log_sha256})",
            created.name_any()
        ),
    )
    .await;
    ctx.metrics
        .pods_created_total
        .with_label_values(&[&namespace])
        .inc();

    if !checkpoint_location.is_empty() {
        let key = format!(
            "{namespace}/{name}/{}/checkpoint.tar",
            captured_at.format("%Y/%m/%d/%H%M%S")
        );
        launch_collector(&ctx, &pod, &created, &checkpoint_location, key).await;
    }

    Ok(Action::await_change())
}

pub fn error_policy(_pod: Arc<Pod>, err: &Error, _ctx: Arc<Context>) -> Action {
    warn!(%err, "reconcile failed, requeueing");
    Action::requeue(Duration::from_secs(10))
}

/// Runs the pod controller and the TTL janitor until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let pods: Api<Pod> = Api::all(ctx.client.clone());

    tokio::spawn(janitor::run(ctx.client.clone(), ctx.config.clone()));

    Controller::new(pods, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "reconciled"),
                Err(err) => debug!(%err, "reconcile error"),
            }
        })
        .await;
}
