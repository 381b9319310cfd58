use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use pg_publisher::checkpoint::{CheckpointStore, FileCheckpointStore};
use pg_publisher::config::{Args, Config, MetricsConfig};
use pg_publisher::leader::{ElectionTiming, KubeLeaseLock, LeaderCoordinator};
use pg_publisher::metrics::{RecorderMetrics, TICK_LATENCY, TICK_LATENCY_BUCKETS};
use pg_publisher::postgres::PostgresStore;
use pg_publisher::sink::{build_sink, RowSink};
use pg_publisher::{Error, Publisher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-publisher");

    let config = match args.into_config() {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!(
        id = %config.publisher.id,
        table = %config.publisher.table,
        column = %config.publisher.column,
        page_size = config.publisher.page_size,
        default_version = config.publisher.default_watermark,
        kafka_brokers = ?config.kafka.brokers,
        kafka_topic = %config.kafka.topic,
        leader_election = config.leader.is_some(),
        "Configuration summary"
    );

    install_metrics_exporter(&config.metrics)?;

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(
        PostgresStore::connect(
            &config.postgres.dsn,
            Duration::from_secs(config.postgres.connect_timeout_secs),
            &config.postgres.checkpoint_table,
        )
        .await
        .context("Failed to connect to PostgreSQL")?,
    );

    let checkpoints: Arc<dyn CheckpointStore> = match &config.publisher.checkpoint_file {
        Some(path) => {
            info!(path = ?path, "Using file checkpoint store");
            Arc::new(FileCheckpointStore::new(path))
        }
        None => {
            store
                .ensure_checkpoint_table()
                .await
                .context("Failed to prepare checkpoint table")?;
            store.clone()
        }
    };

    let sink: Arc<dyn RowSink> =
        Arc::from(build_sink(&config.kafka).context("Couldn't create changes producer")?);

    let run = CancellationToken::new();
    spawn_signal_handler(run.clone());

    let leader = match &config.leader {
        Some(leader_config) => {
            info!(
                lockname = %leader_config.lock_name,
                namespace = %leader_config.namespace,
                "Leader election enabled"
            );
            let client = kube::Client::try_default()
                .await
                .context("Couldn't create Kubernetes client")?;
            let lock = Arc::new(KubeLeaseLock::new(
                client,
                &leader_config.namespace,
                &leader_config.lock_name,
            ));
            let mut handle = LeaderCoordinator::new(
                lock,
                leader_config.identity.clone(),
                ElectionTiming::from(leader_config),
                run.clone(),
            )
            .spawn();

            match handle.wait_promoted().await {
                Ok(()) => {}
                Err(Error::Shutdown) => {
                    info!("Shutdown before acquiring leadership");
                    handle.release().await;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            Some(handle)
        }
        None => None,
    };

    let mut publisher = Publisher::new(
        config.publisher.clone(),
        store,
        checkpoints,
        sink.clone(),
        Arc::new(RecorderMetrics::new()),
    )?;
    let result = publisher.run(run.clone()).await;

    // The lease is only given up once the final flush is done, even if the
    // publisher failed.
    run.cancel();
    if let Some(handle) = leader {
        handle.release().await;
    }
    if let Err(e) = sink.close().await {
        error!("Failed to flush producer: {}", e);
    }

    result.context("Publisher failed")
}

fn spawn_signal_handler(run: CancellationToken) {
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        debug!(signal = %signal, "Received signal");
        run.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        },
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            wait_for_ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "SIGINT",
        Err(e) => {
            error!("Failed to install SIGINT handler: {}", e);
            std::future::pending().await
        }
    }
}

fn install_metrics_exporter(config: &MetricsConfig) -> anyhow::Result<()> {
    let addr = config.listen_addr();
    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Full(TICK_LATENCY.to_string()), TICK_LATENCY_BUCKETS)
        .context("Invalid tick latency buckets")?
        .install()
        .context("Failed to install Prometheus exporter")
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_publisher=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_publisher=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
