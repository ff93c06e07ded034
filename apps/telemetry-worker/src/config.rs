use crate::envelope::StorageKind;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/telemetry-worker/config.json";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("WORKER_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

/// Deployment file written by the installer. Its values only fill in
/// settings the environment leaves unset.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    kafka_brokers: Option<String>,
    #[serde(default)]
    kafka_topic: Option<String>,
    #[serde(default)]
    kafka_group_id: Option<String>,
    #[serde(default)]
    storage_type: Option<String>,
    #[serde(default)]
    minio_endpoint: Option<String>,
    #[serde(default)]
    minio_port: Option<u16>,
    #[serde(default)]
    minio_bucket: Option<String>,
    #[serde(default)]
    storage_local_path: Option<String>,
    #[serde(default)]
    billing_usage_enabled: Option<bool>,
    #[serde(default)]
    alerts_enabled: Option<bool>,
    #[serde(default)]
    webhooks_enabled: Option<bool>,
    #[serde(default)]
    alert_poll_seconds: Option<u64>,
}

impl SetupConfigOverrides {
    fn get(&self, key: &str) -> Option<String> {
        let text = |value: &Option<String>| value.clone();
        match key {
            "DATABASE_URL" => text(&self.database_url),
            "KAFKA_BROKERS" => text(&self.kafka_brokers),
            "KAFKA_TOPIC" => text(&self.kafka_topic),
            "KAFKA_GROUP_ID" => text(&self.kafka_group_id),
            "STORAGE_TYPE" => text(&self.storage_type),
            "MINIO_ENDPOINT" => text(&self.minio_endpoint),
            "MINIO_PORT" => self.minio_port.map(|v| v.to_string()),
            "MINIO_BUCKET" => text(&self.minio_bucket),
            "STORAGE_LOCAL_PATH" => text(&self.storage_local_path),
            "BILLING_USAGE_ENABLED" => self.billing_usage_enabled.map(|v| v.to_string()),
            "ALERTS_ENABLED" => self.alerts_enabled.map(|v| v.to_string()),
            "WEBHOOKS_ENABLED" => self.webhooks_enabled.map(|v| v.to_string()),
            "ALERT_POLL_SECONDS" => self.alert_poll_seconds.map(|v| v.to_string()),
            _ => None,
        }
    }
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telemetry-worker failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telemetry-worker failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

/// Partitions this instance reads. The broker client never joins a group
/// rebalance, so every instance declares its own share.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PartitionAssignment {
    #[default]
    Unassigned,
    /// Single-instance deployment reading every partition.
    All,
    Only(Vec<i32>),
}

impl PartitionAssignment {
    fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("all") {
            return Self::All;
        }
        let partitions: Vec<i32> = raw
            .split(',')
            .filter_map(|p| p.trim().parse::<i32>().ok())
            .collect();
        if partitions.is_empty() {
            Self::Unassigned
        } else {
            Self::Only(partitions)
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub kafka_brokers: Vec<String>,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub kafka_client_id: String,
    pub kafka_partitions: PartitionAssignment,
    pub kafka_batch_size: usize,
    pub kafka_auto_commit: bool,
    pub kafka_poll_timeout_ms: u64,
    pub kafka_session_timeout_ms: u64,
    pub idle_backoff_ms: u64,
    pub bulk_insert_batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub storage_type: StorageKind,
    pub minio_endpoint: String,
    pub minio_port: u16,
    pub minio_use_ssl: bool,
    pub minio_access_key: String,
    pub minio_secret_key: String,
    pub minio_bucket: String,
    pub s3_region: String,
    pub storage_local_path: PathBuf,
    pub delete_file_after_processing: bool,
    pub billing_usage_enabled: bool,
    pub alerts_enabled: bool,
    pub webhooks_enabled: bool,
    pub alert_poll_seconds: u64,
    pub webhook_timeout_secs: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides().unwrap_or_default();
        Self::from_lookup(|key| {
            env::var(key)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .or_else(|| setup_overrides.get(key))
        })
    }

    /// Builds the config from any key lookup. Missing or unparsable values
    /// fall back to defaults; only the database URL is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let string_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str, default: bool| get(key).and_then(|v| parse_bool(&v)).unwrap_or(default);
        let u64_or = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };

        let database_url = get("WORKER_DATABASE_URL")
            .or_else(|| get("DATABASE_URL"))
            .context("WORKER_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);
        let db_pool_size = get("DATABASE_POOL_SIZE")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(20);

        let kafka_brokers: Vec<String> = string_or("KAFKA_BROKERS", "localhost:9092")
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .collect();
        let kafka_partitions = get("KAFKA_PARTITIONS")
            .map(|raw| PartitionAssignment::parse(&raw))
            .unwrap_or_default();
        let kafka_client_id = get("KAFKA_CLIENT_ID")
            .unwrap_or_else(|| format!("telemetry-worker-{}", std::process::id()));

        let storage_type = match get("STORAGE_TYPE") {
            Some(raw) => match StorageKind::parse(&raw) {
                Some(kind) => kind,
                None => {
                    tracing::warn!(storage_type = %raw, "unknown STORAGE_TYPE; using minio");
                    StorageKind::Minio
                }
            },
            None => StorageKind::Minio,
        };
        let minio_port = get("MINIO_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(9000);

        Ok(Self {
            database_url,
            db_pool_size,
            kafka_brokers,
            kafka_topic: string_or("KAFKA_TOPIC", "telemetry.raw"),
            kafka_group_id: string_or("KAFKA_GROUP_ID", "telemetry-workers"),
            kafka_client_id,
            kafka_partitions,
            kafka_batch_size: (u64_or("KAFKA_BATCH_SIZE", 100) as usize).max(1),
            kafka_auto_commit: flag("KAFKA_AUTO_COMMIT", false),
            kafka_poll_timeout_ms: u64_or("KAFKA_POLL_TIMEOUT_MS", 1000),
            kafka_session_timeout_ms: u64_or("KAFKA_SESSION_TIMEOUT_MS", 30_000),
            idle_backoff_ms: u64_or("IDLE_BACKOFF_MS", 100),
            bulk_insert_batch_size: (u64_or("BULK_INSERT_BATCH_SIZE", 1000) as usize).max(1),
            max_retries: get("MAX_RETRIES")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(3),
            retry_delay_secs: u64_or("RETRY_DELAY", 5),
            storage_type,
            minio_endpoint: string_or("MINIO_ENDPOINT", "localhost"),
            minio_port,
            minio_use_ssl: flag("MINIO_USE_SSL", false),
            minio_access_key: string_or("MINIO_ACCESS_KEY", "minioadmin"),
            minio_secret_key: string_or("MINIO_SECRET_KEY", "minioadmin"),
            minio_bucket: string_or("MINIO_BUCKET", "telemetry-raw"),
            s3_region: string_or("S3_REGION", "us-east-1"),
            storage_local_path: PathBuf::from(string_or("STORAGE_LOCAL_PATH", "/app/storage")),
            delete_file_after_processing: flag("DELETE_FILE_AFTER_PROCESSING", true),
            billing_usage_enabled: flag("BILLING_USAGE_ENABLED", false),
            alerts_enabled: flag("ALERTS_ENABLED", false),
            webhooks_enabled: flag("WEBHOOKS_ENABLED", false),
            alert_poll_seconds: u64_or("ALERT_POLL_SECONDS", 60).max(1),
            webhook_timeout_secs: u64_or("WEBHOOK_TIMEOUT_SECS", 10).max(1),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_poll_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_session_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn alert_poll_interval(&self) -> Duration {
        Duration::from_secs(self.alert_poll_seconds)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
