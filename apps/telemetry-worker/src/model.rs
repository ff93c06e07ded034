use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Multi-tenant ownership boundary. `0` is the wildcard for organization and
/// workspace and the system tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScopeKey {
    pub tenant_id: i32,
    pub organization_id: i32,
    pub workspace_id: i32,
}

impl ScopeKey {
    pub fn new(tenant_id: i32, organization_id: i32, workspace_id: i32) -> Self {
        Self {
            tenant_id,
            organization_id,
            workspace_id,
        }
    }

    /// A scope telemetry may be attributed to: all three components set.
    pub fn is_complete(&self) -> bool {
        self.tenant_id > 0 && self.organization_id > 0 && self.workspace_id > 0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.tenant_id, self.organization_id, self.workspace_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityStatus {
    #[default]
    Active,
    Inactive,
    Blocked,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Inactive => "inactive",
            EntityStatus::Blocked => "blocked",
        }
    }

    /// Lenient mapping of the localized spellings devices send. Anything
    /// unrecognized counts as active.
    pub fn normalize(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return EntityStatus::Active;
        };
        match raw.trim().to_lowercase().as_str() {
            "inativo" | "inactive" => EntityStatus::Inactive,
            "bloqueado" | "blocked" => EntityStatus::Blocked,
            _ => EntityStatus::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Equipment {
    pub id: i32,
    pub uuid: String,
    pub name: String,
    pub status: EntityStatus,
    pub collection_interval_seconds: i32,
    pub siren_active: bool,
    pub siren_time_seconds: i32,
    pub scope: ScopeKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEquipment {
    pub uuid: String,
    pub name: String,
    pub status: EntityStatus,
    pub collection_interval_seconds: i32,
    pub siren_active: bool,
    pub siren_time_seconds: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    pub id: i32,
    pub uuid: String,
    pub name: String,
    pub sensor_type: String,
    pub unit: Option<String>,
    pub status: EntityStatus,
    pub equipment_id: i32,
    pub scope: ScopeKey,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub hardware_id: Option<String>,
    pub via_hub: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSensor {
    pub uuid: String,
    pub name: String,
    pub sensor_type: String,
    pub unit: Option<String>,
    pub status: EntityStatus,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub hardware_id: Option<String>,
    pub via_hub: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub sensor_id: i32,
    pub equipment_id: i32,
    pub scope: ScopeKey,
    pub value: Option<f64>,
    pub status: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<Map<String, JsonValue>>,
}

/// Daily counters, used both as an increment and as a read-back total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageCounts {
    pub items: i64,
    pub sensors: i64,
    pub bytes: i64,
}

impl UsageCounts {
    pub fn new(items: i64, sensors: i64, bytes: i64) -> Self {
        Self {
            items,
            sensors,
            bytes,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.items == 0 && self.sensors == 0 && self.bytes == 0
    }
}

/// Per-tenant quota configuration as joined from plans and tenant limits.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TenantQuota {
    pub tenant_id: i32,
    pub tenant_delay_seconds: Option<i64>,
    pub plan_delay_seconds: Option<i64>,
    pub items_per_day: Option<i64>,
    pub sensors_per_day: Option<i64>,
    pub bytes_per_day: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub id: i32,
    pub tenant_id: i32,
    pub organization_id: i32,
    pub workspace_ids: Vec<i32>,
    pub threshold_percent: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub scope: ScopeKey,
    pub alert_type: String,
    pub day: NaiveDate,
    pub message: String,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Webhook {
    pub id: i32,
    pub tenant_id: i32,
    pub organization_id: i32,
    pub workspace_ids: Vec<i32>,
    pub event_types: Vec<String>,
    pub url: Option<String>,
    pub secret: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertDelivery {
    pub id: i32,
    pub alert_id: i32,
    pub webhook_id: i32,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Result of one delivery attempt, applied to the delivery row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// A broker message that could not be handled, parked for manual replay.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub message_key: Option<String>,
    pub claim_check: Option<String>,
    pub error: String,
    pub payload: String,
}
