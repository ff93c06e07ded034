mod alerts;
mod blob;
mod config;
mod consumer;
mod envelope;
mod error;
mod ingest;
mod kafka;
mod model;
mod pipeline;
mod store;
mod telemetry;
mod usage;

use crate::alerts::{AlertEngine, WebhookNotifier};
use crate::blob::BlobRouter;
use crate::config::Config;
use crate::consumer::{IngestSettings, IngestionLoop};
use crate::kafka::KafkaSource;
use crate::pipeline::{build_pool, IngestStats};
use crate::store::PgStore;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_worker=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telemetry-worker"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store = Arc::new(PgStore::new(pool));
    let stats = Arc::new(IngestStats::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let alert_handle = if config.alerts_enabled {
        let notifier = if config.webhooks_enabled {
            Some(WebhookNotifier::new(
                config.webhook_timeout(),
                config.retry_delay(),
            )?)
        } else {
            None
        };
        let engine = AlertEngine::new(store.clone(), notifier, config.alert_poll_interval());
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = engine.run(rx).await {
                tracing::error!(error = %err, "alert engine exited");
            }
        }))
    } else {
        tracing::info!("alert engine disabled");
        None
    };

    let blobs = BlobRouter::from_config(&config).await;
    let source = KafkaSource::connect(&config).await?;
    tracing::info!(
        brokers = ?config.kafka_brokers,
        topic = %config.kafka_topic,
        group = %config.kafka_group_id,
        partitions = ?config.kafka_partitions,
        storage = %config.storage_type,
        "telemetry worker connected"
    );
    let ingestion = IngestionLoop::new(
        source,
        blobs,
        store,
        config.bulk_insert_batch_size,
        IngestSettings::from_config(&config),
        stats.clone(),
    );
    let mut ingest_handle = tokio::spawn(ingestion.run(shutdown_rx));

    tokio::select! {
        res = &mut ingest_handle => {
            match res {
                Ok(Ok(())) => tracing::warn!("ingestion loop stopped unexpectedly"),
                Ok(Err(err)) => tracing::error!(error = %err, "ingestion loop failed"),
                Err(err) => tracing::error!(error = %err, "ingestion task panicked"),
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if !ingest_handle.is_finished() {
        if let Err(err) = ingest_handle.await {
            tracing::error!(error = %err, "ingestion task panicked");
        }
    }
    if let Some(handle) = alert_handle {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "alert task panicked");
        }
    }
    stats.log_summary("telemetry worker stopped");

    Ok(())
}
