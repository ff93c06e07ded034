//! Storage contracts the ingest and alert paths are written against.
//!
//! `PgStore` is the production implementation; tests drive the same code
//! through `memory::MemoryStore`.

use crate::error::StoreError;
use crate::model::{
    AlertDelivery, AlertRule, DeadLetter, DeliveryOutcome, Equipment, NewAlert, NewEquipment,
    NewSensor, ScopeKey, Sensor, TelemetryRecord, TenantQuota, UsageCounts, Webhook,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

#[cfg(test)]
pub mod memory;
pub mod pg;

pub use pg::PgStore;

#[async_trait]
pub trait IngestStore: Send + Sync {
    /// Looks equipment up by uuid across every scope so the caller can tell a
    /// miss from a hit owned by someone else.
    async fn find_equipment(&self, uuid: &str) -> Result<Option<Equipment>, StoreError>;

    /// Inserts the equipment, or returns the existing row for the same
    /// `(uuid, scope)` when a concurrent writer got there first.
    async fn create_equipment(
        &self,
        scope: ScopeKey,
        new: &NewEquipment,
    ) -> Result<Equipment, StoreError>;

    async fn find_sensor(&self, uuid: &str) -> Result<Option<Sensor>, StoreError>;

    /// Inserts the sensor under the equipment's scope, or returns the existing
    /// row for the same uuid.
    async fn create_sensor(
        &self,
        equipment: &Equipment,
        new: &NewSensor,
    ) -> Result<Sensor, StoreError>;

    /// Writes one equipment group's records in a single transaction, split
    /// into statements of at most `chunk_size` rows.
    async fn insert_telemetry(
        &self,
        records: &[TelemetryRecord],
        chunk_size: usize,
    ) -> Result<u64, StoreError>;

    /// Additive upsert of the tenant-wide and the scoped daily counters.
    async fn add_usage(
        &self,
        scope: ScopeKey,
        day: NaiveDate,
        delta: UsageCounts,
    ) -> Result<(), StoreError>;

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Active tenants plus tenant `0`, with tenant limits layered over plans.
    async fn tenant_quotas(&self) -> Result<Vec<TenantQuota>, StoreError>;

    async fn last_checked(&self, tenant_id: i32) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn touch_last_checked(
        &self,
        tenant_id: i32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// The tenant's own enabled rules plus the global (`tenant_id = 0`) ones.
    async fn enabled_rules(&self, tenant_id: i32) -> Result<Vec<AlertRule>, StoreError>;

    async fn usage_for(
        &self,
        tenant_id: i32,
        organization_id: i32,
        workspace_ids: &[i32],
        day: NaiveDate,
    ) -> Result<UsageCounts, StoreError>;

    /// `None` when an alert with the same scope, type and day already exists.
    async fn create_alert(&self, alert: &NewAlert) -> Result<Option<i32>, StoreError>;

    async fn enabled_webhooks(&self, tenant_id: i32) -> Result<Vec<Webhook>, StoreError>;

    async fn create_delivery(
        &self,
        alert_id: i32,
        webhook_id: i32,
    ) -> Result<AlertDelivery, StoreError>;

    async fn finish_delivery(
        &self,
        delivery_id: i32,
        outcome: &DeliveryOutcome,
    ) -> Result<(), StoreError>;
}

/// Tenant-wide usage lives in its own table; anything narrower is summed
/// from the scoped table.
pub fn is_tenant_wide(organization_id: i32, workspace_ids: &[i32]) -> bool {
    organization_id == 0 && (workspace_ids.is_empty() || workspace_ids.contains(&0))
}
