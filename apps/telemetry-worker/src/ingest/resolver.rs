use crate::error::ProcessError;
use crate::model::{Equipment, NewEquipment, NewSensor, ScopeKey, Sensor};
use crate::store::IngestStore;
use std::sync::Arc;

/// Find-or-create for equipment and sensors. Lookup and creation are separate
/// steps; every path that hands an entity back goes through the scope check.
#[derive(Clone)]
pub struct EntityResolver {
    store: Arc<dyn IngestStore>,
}

impl EntityResolver {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    pub async fn lookup_equipment(&self, uuid: &str) -> Result<Option<Equipment>, ProcessError> {
        Ok(self.store.find_equipment(uuid).await?)
    }

    pub async fn create_equipment(
        &self,
        scope: ScopeKey,
        new: &NewEquipment,
    ) -> Result<Equipment, ProcessError> {
        let equipment = self.store.create_equipment(scope, new).await?;
        tracing::info!(
            equip_uuid = %equipment.uuid,
            equipment_id = equipment.id,
            name = %equipment.name,
            scope = %scope,
            "created equipment"
        );
        Ok(equipment)
    }

    pub async fn resolve_equipment(
        &self,
        scope: ScopeKey,
        new: &NewEquipment,
    ) -> Result<Equipment, ProcessError> {
        let equipment = match self.lookup_equipment(&new.uuid).await? {
            Some(found) => found,
            None => self.create_equipment(scope, new).await?,
        };
        ensure_equipment_scope(&equipment, scope)?;
        Ok(equipment)
    }

    pub async fn lookup_sensor(&self, uuid: &str) -> Result<Option<Sensor>, ProcessError> {
        Ok(self.store.find_sensor(uuid).await?)
    }

    pub async fn create_sensor(
        &self,
        equipment: &Equipment,
        new: &NewSensor,
    ) -> Result<Sensor, ProcessError> {
        let sensor = self.store.create_sensor(equipment, new).await?;
        tracing::info!(
            sensor_uuid = %sensor.uuid,
            sensor_id = sensor.id,
            equip_uuid = %equipment.uuid,
            sensor_type = %sensor.sensor_type,
            "created sensor"
        );
        Ok(sensor)
    }

    pub async fn resolve_sensor(
        &self,
        equipment: &Equipment,
        new: &NewSensor,
    ) -> Result<Sensor, ProcessError> {
        let sensor = match self.lookup_sensor(&new.uuid).await? {
            Some(found) => found,
            None => self.create_sensor(equipment, new).await?,
        };
        ensure_sensor_owner(&sensor, equipment)?;
        Ok(sensor)
    }
}

pub fn ensure_equipment_scope(equipment: &Equipment, scope: ScopeKey) -> Result<(), ProcessError> {
    if equipment.scope != scope {
        tracing::warn!(
            equip_uuid = %equipment.uuid,
            stored_scope = %equipment.scope,
            requested_scope = %scope,
            "equipment scope mismatch"
        );
        return Err(ProcessError::ScopeViolation {
            entity: "equipment",
            uuid: equipment.uuid.clone(),
        });
    }
    Ok(())
}

pub fn ensure_sensor_owner(sensor: &Sensor, equipment: &Equipment) -> Result<(), ProcessError> {
    if sensor.equipment_id != equipment.id || sensor.scope != equipment.scope {
        tracing::warn!(
            sensor_uuid = %sensor.uuid,
            owner_equipment_id = sensor.equipment_id,
            requested_equipment_id = equipment.id,
            "sensor owner mismatch"
        );
        return Err(ProcessError::ScopeViolation {
            entity: "sensor",
            uuid: sensor.uuid.clone(),
        });
    }
    Ok(())
}
