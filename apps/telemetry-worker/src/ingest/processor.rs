use super::resolver::EntityResolver;
use crate::error::ProcessError;
use crate::model::{Equipment, ScopeKey, Sensor, TelemetryRecord};
use crate::store::IngestStore;
use crate::telemetry::RawTelemetryItem;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// A failure confined to one item or one equipment group.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub equip_uuid: Option<String>,
    pub sensor_uuid: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Items whose readings were all resolved.
    pub processed: usize,
    /// Telemetry rows written.
    pub inserted: u64,
    pub errors: Vec<ItemFailure>,
    /// Equipment groups whose telemetry write failed.
    pub failed_groups: usize,
}

impl BatchOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

struct EquipmentGroup {
    equip_uuid: String,
    items: Vec<RawTelemetryItem>,
}

#[derive(Clone)]
pub struct TelemetryProcessor {
    resolver: EntityResolver,
    store: Arc<dyn IngestStore>,
    insert_chunk_size: usize,
}

impl TelemetryProcessor {
    pub fn new(store: Arc<dyn IngestStore>, insert_chunk_size: usize) -> Self {
        Self {
            resolver: EntityResolver::new(store.clone()),
            store,
            insert_chunk_size: insert_chunk_size.max(1),
        }
    }

    /// Resolves entities and writes telemetry for one envelope's worth of
    /// items. Scope and storage errors during resolution abort the call;
    /// item and group failures are reported in the outcome.
    pub async fn process_batch(
        &self,
        scope: ScopeKey,
        items: Vec<JsonValue>,
    ) -> Result<BatchOutcome, ProcessError> {
        if !scope.is_complete() {
            return Err(ProcessError::InvalidScope {
                tenant_id: scope.tenant_id,
                organization_id: scope.organization_id,
                workspace_id: scope.workspace_id,
            });
        }

        let mut outcome = BatchOutcome::default();
        let groups = group_items(items, &mut outcome.errors);
        let now = Utc::now();

        for group in groups {
            let mut records = Vec::new();
            let equipment = match self
                .resolver
                .resolve_equipment(scope, &group.items[0].new_equipment(&group.equip_uuid))
                .await
            {
                Ok(equipment) => equipment,
                Err(err @ ProcessError::ScopeViolation { .. }) => {
                    tracing::warn!(equip_uuid = %group.equip_uuid, error = %err, "rejected equipment group");
                    for _ in &group.items {
                        outcome.errors.push(ItemFailure {
                            equip_uuid: Some(group.equip_uuid.clone()),
                            sensor_uuid: None,
                            reason: err.to_string(),
                        });
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            let mut sensors: HashMap<String, Sensor> = HashMap::new();
            for item in &group.items {
                match self
                    .item_records(&equipment, item, &mut sensors, now)
                    .await
                {
                    Ok(item_records) => {
                        records.extend(item_records);
                        outcome.processed += 1;
                    }
                    Err((sensor_uuid, err @ ProcessError::ScopeViolation { .. })) => {
                        tracing::warn!(
                            equip_uuid = %group.equip_uuid,
                            sensor_uuid = %sensor_uuid,
                            error = %err,
                            "rejected telemetry item"
                        );
                        outcome.errors.push(ItemFailure {
                            equip_uuid: Some(group.equip_uuid.clone()),
                            sensor_uuid: Some(sensor_uuid),
                            reason: err.to_string(),
                        });
                    }
                    Err((_, err)) => return Err(err),
                }
            }

            if records.is_empty() {
                continue;
            }
            match self
                .store
                .insert_telemetry(&records, self.insert_chunk_size)
                .await
            {
                Ok(inserted) => {
                    outcome.inserted += inserted;
                    tracing::debug!(
                        equip_uuid = %group.equip_uuid,
                        inserted,
                        "inserted telemetry group"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        equip_uuid = %group.equip_uuid,
                        rows = records.len(),
                        error = %err,
                        "failed to insert telemetry group"
                    );
                    outcome.failed_groups += 1;
                    outcome.errors.push(ItemFailure {
                        equip_uuid: Some(group.equip_uuid.clone()),
                        sensor_uuid: None,
                        reason: format!("telemetry insert failed: {err}"),
                    });
                }
            }
        }

        Ok(outcome)
    }

    /// All readings of one item, or the first sensor that failed to resolve.
    async fn item_records(
        &self,
        equipment: &Equipment,
        item: &RawTelemetryItem,
        sensors: &mut HashMap<String, Sensor>,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, (String, ProcessError)> {
        let mut records = Vec::new();
        for reading in item.readings() {
            let Some(sensor_uuid) = reading
                .sensor_uuid
                .as_deref()
                .map(str::trim)
                .filter(|uuid| !uuid.is_empty())
            else {
                tracing::debug!(equip_uuid = %equipment.uuid, "skipping reading without sensor_uuid");
                continue;
            };

            let sensor_id = match sensors.get(sensor_uuid) {
                Some(sensor) => sensor.id,
                None => {
                    let sensor = self
                        .resolver
                        .resolve_sensor(equipment, &reading.new_sensor(sensor_uuid))
                        .await
                        .map_err(|err| (sensor_uuid.to_string(), err))?;
                    let id = sensor.id;
                    sensors.insert(sensor_uuid.to_string(), sensor);
                    id
                }
            };
            records.push(reading.to_record(sensor_id, equipment, now));
        }
        Ok(records)
    }
}

/// Groups items by `equip_uuid` in first-seen order. Items that cannot be
/// read or carry no equipment uuid are reported and dropped.
fn group_items(items: Vec<JsonValue>, errors: &mut Vec<ItemFailure>) -> Vec<EquipmentGroup> {
    let mut groups: Vec<EquipmentGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for value in items {
        let item = match RawTelemetryItem::from_json(value) {
            Ok(item) => item,
            Err(err) => {
                errors.push(ItemFailure {
                    equip_uuid: None,
                    sensor_uuid: None,
                    reason: format!("unreadable item: {err}"),
                });
                continue;
            }
        };
        let Some(equip_uuid) = item
            .equip_uuid
            .as_deref()
            .map(str::trim)
            .filter(|uuid| !uuid.is_empty())
            .map(str::to_string)
        else {
            errors.push(ItemFailure {
                equip_uuid: None,
                sensor_uuid: None,
                reason: "item has no equip_uuid".to_string(),
            });
            continue;
        };

        match index.get(&equip_uuid) {
            Some(&slot) => groups[slot].items.push(item),
            None => {
                index.insert(equip_uuid.clone(), groups.len());
                groups.push(EquipmentGroup {
                    equip_uuid,
                    items: vec![item],
                });
            }
        }
    }

    groups
}
