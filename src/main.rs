use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::{ArgAction, Args, Parser, Subcommand};
use kube::runtime::events::{Recorder, Reporter};
use kube::Client;
use tracing::{error, info, warn};

use kube_forensics_operator::config::{parse_namespace_list, Config};
use kube_forensics_operator::metrics::Metrics;
use kube_forensics_operator::reconciler::{self, CollectorSettings, Context};
use kube_forensics_operator::storage::{BlobStore, NoOpStore, S3CompatibleStore};

#[derive(Parser)]
#[command(
    name = "kube-forensics-operator",
    about = "Materializes inspectable forensic replicas of crashed pods"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    operator: OperatorArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a checkpoint archive to the blob store and delete the local
    /// file. Run by the node-pinned collector job, not by hand.
    Collector(CollectorArgs),
}

#[derive(Args)]
struct OperatorArgs {
    /// Namespace where forensic pods are created.
    #[arg(long, default_value = "debug-forensics")]
    target_namespace: String,

    /// Time to live for forensic pods (e.g. 24h, 30m).
    #[arg(long, default_value = "24h")]
    forensic_ttl: humantime::Duration,

    /// Maximum log size to capture, in bytes.
    #[arg(long, default_value_t = 500 * 1024)]
    max_log_size: usize,

    /// Comma-separated list of namespaces to ignore.
    #[arg(long, default_value = "kube-system,kube-public")]
    ignore_namespaces: String,

    /// Comma-separated list of namespaces to watch. Empty watches all
    /// (except ignored).
    #[arg(long, default_value = "")]
    watch_namespaces: String,

    /// Clone secrets into the forensic namespace verbatim. Disable to store
    /// redacted copies instead.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_secret_cloning: bool,

    /// Request kubelet container checkpoints (requires the
    /// ContainerCheckpoint feature gate).
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    enable_checkpointing: bool,

    /// Window for deduplicating crashes with the same signature.
    #[arg(long, default_value = "1h")]
    rate_limit_window: humantime::Duration,

    /// Deadline for the node-proxy checkpoint request.
    #[arg(long, default_value = "60s")]
    checkpoint_timeout: humantime::Duration,

    /// Bucket for exporting forensic artifacts. Empty disables export.
    #[arg(long, default_value = "")]
    blob_bucket: String,

    /// Region label recorded with exported artifacts.
    #[arg(long, default_value = "us-east-1")]
    blob_region: String,

    /// Base URL of the S3-compatible endpoint artifacts are uploaded to.
    #[arg(long, default_value = "")]
    blob_endpoint: String,

    /// Image of this operator, used by the checkpoint collector job. Empty
    /// disables the collector.
    #[arg(long, default_value = "")]
    operator_image: String,

    /// Address serving /metrics and /healthz.
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,
}

#[derive(Args)]
struct CollectorArgs {
    /// Path of the file to upload.
    #[arg(long)]
    file: PathBuf,

    #[arg(long)]
    blob_bucket: String,

    #[arg(long, default_value = "us-east-1")]
    blob_region: String,

    #[arg(long)]
    blob_endpoint: String,

    /// Object key to upload under.
    #[arg(long)]
    blob_key: String,
}

async fn metrics_handler(State(metrics): State<Metrics>) -> (StatusCode, String) {
    match metrics.encode_text() {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn serve_observability(addr: String, metrics: Metrics) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .with_state(metrics);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, %err, "failed to bind observability server");
            return;
        }
    };
    if let Err(err) = axum::serve(listener, app).await {
        error!(%err, "observability server terminated");
    }
}

async fn run_operator(args: OperatorArgs) -> anyhow::Result<()> {
    let config = Config {
        target_namespace: args.target_namespace,
        forensic_ttl: args.forensic_ttl.into(),
        max_log_size_bytes: args.max_log_size,
        ignore_namespaces: parse_namespace_list(&args.ignore_namespaces),
        watch_namespaces: parse_namespace_list(&args.watch_namespaces),
        enable_secret_cloning: args.enable_secret_cloning,
        enable_checkpointing: args.enable_checkpointing,
        rate_limit_window: args.rate_limit_window.into(),
        checkpoint_timeout: args.checkpoint_timeout.into(),
    };

    let store: Arc<dyn BlobStore> = if args.blob_bucket.is_empty() {
        Arc::new(NoOpStore)
    } else {
        if args.blob_endpoint.is_empty() {
            anyhow::bail!("--blob-endpoint is required when --blob-bucket is set");
        }
        info!(bucket = %args.blob_bucket, endpoint = %args.blob_endpoint, "initializing blob store");
        Arc::new(S3CompatibleStore::new(
            &args.blob_endpoint,
            &args.blob_bucket,
            &args.blob_region,
        )?)
    };

    let collector = (!args.blob_bucket.is_empty() && !args.operator_image.is_empty()).then(|| {
        CollectorSettings {
            image: args.operator_image.clone(),
            bucket: args.blob_bucket.clone(),
            region: args.blob_region.clone(),
            endpoint: args.blob_endpoint.clone(),
        }
    });
    if collector.is_none() && config.enable_checkpointing {
        warn!("checkpointing is enabled but no collector is configured; checkpoint archives stay on the node");
    }

    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let metrics = Metrics::new().context("failed to register metrics")?;
    tokio::spawn(serve_observability(
        args.metrics_bind_address,
        metrics.clone(),
    ));

    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: "kube-forensics-operator".to_string(),
            instance: None,
        },
    );

    info!(
        target_namespace = %config.target_namespace,
        ttl = %humantime::format_duration(config.forensic_ttl),
        "starting forensics operator"
    );
    reconciler::run(Arc::new(Context {
        client,
        config,
        store,
        recorder,
        metrics,
        collector,
    }))
    .await;
    info!("forensics operator terminated");
    Ok(())
}

async fn run_collector(args: CollectorArgs) -> anyhow::Result<()> {
    let store = S3CompatibleStore::new(&args.blob_endpoint, &args.blob_bucket, &args.blob_region)?;
    info!(file = %args.file.display(), key = %args.blob_key, "uploading checkpoint archive");

    let url = store
        .upload_file(&args.blob_key, &args.file)
        .await
        .context("upload failed")?;
    info!(%url, "upload complete");

    if let Err(err) = tokio::fs::remove_file(&args.file).await {
        warn!(file = %args.file.display(), %err, "failed to delete local file");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Collector(args)) => run_collector(args).await,
        None => run_operator(cli.operator).await,
    }
}
