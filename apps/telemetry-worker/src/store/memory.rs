use super::{is_tenant_wide, AlertStore, IngestStore};
use crate::error::StoreError;
use crate::model::{
    AlertDelivery, AlertRule, DeadLetter, DeliveryOutcome, DeliveryStatus, Equipment, NewAlert,
    NewEquipment, NewSensor, ScopeKey, Sensor, TelemetryRecord, TenantQuota, UsageCounts, Webhook,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub struct MemoryState {
    pub equipments: Vec<Equipment>,
    pub sensors: Vec<Sensor>,
    pub telemetry: Vec<TelemetryRecord>,
    pub usage_daily: HashMap<(i32, NaiveDate), UsageCounts>,
    pub usage_scoped: HashMap<(ScopeKey, NaiveDate), UsageCounts>,
    pub dead_letters: Vec<DeadLetter>,
    pub quotas: Vec<TenantQuota>,
    pub alert_state: HashMap<i32, DateTime<Utc>>,
    pub rules: Vec<AlertRule>,
    pub alerts: Vec<(i32, NewAlert)>,
    pub webhooks: Vec<Webhook>,
    pub deliveries: Vec<AlertDelivery>,

    /// Telemetry inserts for these equipment ids fail.
    pub fail_telemetry_for: HashSet<i32>,
    pub fail_usage_reads_for: HashSet<i32>,
    pub fail_dead_letters: bool,
    pub fail_usage_writes: bool,
    /// Webhook ids whose delivery rows cannot be created.
    pub fail_deliveries_for: HashSet<i32>,
}

/// `IngestStore` + `AlertStore` over plain collections, with switches to
/// inject storage failures.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }
}

fn injected(what: &str) -> StoreError {
    StoreError::Injected(what.to_string())
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn find_equipment(&self, uuid: &str) -> Result<Option<Equipment>, StoreError> {
        Ok(self
            .state()
            .equipments
            .iter()
            .find(|e| e.uuid == uuid)
            .cloned())
    }

    async fn create_equipment(
        &self,
        scope: ScopeKey,
        new: &NewEquipment,
    ) -> Result<Equipment, StoreError> {
        let mut state = self.state();
        if let Some(existing) = state
            .equipments
            .iter()
            .find(|e| e.uuid == new.uuid && e.scope == scope)
        {
            return Ok(existing.clone());
        }
        let equipment = Equipment {
            id: state.equipments.len() as i32 + 1,
            uuid: new.uuid.clone(),
            name: new.name.clone(),
            status: new.status,
            collection_interval_seconds: new.collection_interval_seconds,
            siren_active: new.siren_active,
            siren_time_seconds: new.siren_time_seconds,
            scope,
        };
        state.equipments.push(equipment.clone());
        Ok(equipment)
    }

    async fn find_sensor(&self, uuid: &str) -> Result<Option<Sensor>, StoreError> {
        Ok(self.state().sensors.iter().find(|s| s.uuid == uuid).cloned())
    }

    async fn create_sensor(
        &self,
        equipment: &Equipment,
        new: &NewSensor,
    ) -> Result<Sensor, StoreError> {
        let mut state = self.state();
        if let Some(existing) = state.sensors.iter().find(|s| s.uuid == new.uuid) {
            return Ok(existing.clone());
        }
        let sensor = Sensor {
            id: state.sensors.len() as i32 + 1,
            uuid: new.uuid.clone(),
            name: new.name.clone(),
            sensor_type: new.sensor_type.clone(),
            unit: new.unit.clone(),
            status: new.status,
            equipment_id: equipment.id,
            scope: equipment.scope,
            manufacturer: new.manufacturer.clone(),
            model: new.model.clone(),
            firmware: new.firmware.clone(),
            hardware_id: new.hardware_id.clone(),
            via_hub: new.via_hub,
        };
        state.sensors.push(sensor.clone());
        Ok(sensor)
    }

    async fn insert_telemetry(
        &self,
        records: &[TelemetryRecord],
        _chunk_size: usize,
    ) -> Result<u64, StoreError> {
        let mut state = self.state();
        if records
            .iter()
            .any(|r| state.fail_telemetry_for.contains(&r.equipment_id))
        {
            return Err(injected("telemetry insert"));
        }
        state.telemetry.extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn add_usage(
        &self,
        scope: ScopeKey,
        day: NaiveDate,
        delta: UsageCounts,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.fail_usage_writes {
            return Err(injected("usage upsert"));
        }
        let daily = state.usage_daily.entry((scope.tenant_id, day)).or_default();
        daily.items += delta.items;
        daily.sensors += delta.sensors;
        daily.bytes += delta.bytes;
        let scoped = state.usage_scoped.entry((scope, day)).or_default();
        scoped.items += delta.items;
        scoped.sensors += delta.sensors;
        scoped.bytes += delta.bytes;
        Ok(())
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.fail_dead_letters {
            return Err(injected("dead letter"));
        }
        state.dead_letters.push(letter.clone());
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn tenant_quotas(&self) -> Result<Vec<TenantQuota>, StoreError> {
        Ok(self.state().quotas.clone())
    }

    async fn last_checked(&self, tenant_id: i32) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.state().alert_state.get(&tenant_id).copied())
    }

    async fn touch_last_checked(
        &self,
        tenant_id: i32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state().alert_state.insert(tenant_id, at);
        Ok(())
    }

    async fn enabled_rules(&self, tenant_id: i32) -> Result<Vec<AlertRule>, StoreError> {
        Ok(self
            .state()
            .rules
            .iter()
            .filter(|r| r.enabled && (r.tenant_id == 0 || r.tenant_id == tenant_id))
            .cloned()
            .collect())
    }

    async fn usage_for(
        &self,
        tenant_id: i32,
        organization_id: i32,
        workspace_ids: &[i32],
        day: NaiveDate,
    ) -> Result<UsageCounts, StoreError> {
        let state = self.state();
        if state.fail_usage_reads_for.contains(&tenant_id) {
            return Err(injected("usage read"));
        }
        if is_tenant_wide(organization_id, workspace_ids) {
            return Ok(state
                .usage_daily
                .get(&(tenant_id, day))
                .copied()
                .unwrap_or_default());
        }
        let any_workspace = workspace_ids.is_empty() || workspace_ids.contains(&0);
        let mut total = UsageCounts::default();
        for ((scope, row_day), counts) in &state.usage_scoped {
            if *row_day != day || scope.tenant_id != tenant_id {
                continue;
            }
            if organization_id != 0 && scope.organization_id != organization_id {
                continue;
            }
            if !any_workspace && !workspace_ids.contains(&scope.workspace_id) {
                continue;
            }
            total.items += counts.items;
            total.sensors += counts.sensors;
            total.bytes += counts.bytes;
        }
        Ok(total)
    }

    async fn create_alert(&self, alert: &NewAlert) -> Result<Option<i32>, StoreError> {
        let mut state = self.state();
        let duplicate = state.alerts.iter().any(|(_, existing)| {
            existing.scope == alert.scope
                && existing.alert_type == alert.alert_type
                && existing.day == alert.day
        });
        if duplicate {
            return Ok(None);
        }
        let id = state.alerts.len() as i32 + 1;
        state.alerts.push((id, alert.clone()));
        Ok(Some(id))
    }

    async fn enabled_webhooks(&self, tenant_id: i32) -> Result<Vec<Webhook>, StoreError> {
        Ok(self
            .state()
            .webhooks
            .iter()
            .filter(|w| w.enabled && (w.tenant_id == 0 || w.tenant_id == tenant_id))
            .cloned()
            .collect())
    }

    async fn create_delivery(
        &self,
        alert_id: i32,
        webhook_id: i32,
    ) -> Result<AlertDelivery, StoreError> {
        let mut state = self.state();
        if state.fail_deliveries_for.contains(&webhook_id) {
            return Err(injected("delivery insert"));
        }
        let delivery = AlertDelivery {
            id: state.deliveries.len() as i32 + 1,
            alert_id,
            webhook_id,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
        };
        state.deliveries.push(delivery.clone());
        Ok(delivery)
    }

    async fn finish_delivery(
        &self,
        delivery_id: i32,
        outcome: &DeliveryOutcome,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        if let Some(delivery) = state.deliveries.iter_mut().find(|d| d.id == delivery_id) {
            delivery.status = outcome.status;
            delivery.attempts += 1;
            delivery.last_error = outcome.last_error.clone();
            delivery.next_retry_at = outcome.next_retry_at;
        }
        Ok(())
    }
}
