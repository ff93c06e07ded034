use crate::model::{EntityStatus, Equipment, NewEquipment, NewSensor, TelemetryRecord};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value as JsonValue};

const DEFAULT_COLLECTION_INTERVAL_SECONDS: i32 = 60;
const DEFAULT_SIREN_TIME_SECONDS: i32 = 120;
const DEFAULT_SENSOR_TYPE: &str = "unknown";

/// One equipment entry as uploaded by the field integration, before any
/// normalization. Field names are the device wire format.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTelemetryItem {
    #[serde(default, deserialize_with = "loose_string")]
    pub equip_uuid: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub equip_nome: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub equip_status: Option<String>,
    #[serde(default)]
    pub equip_intervalo_coleta: Option<JsonValue>,
    #[serde(default)]
    pub equip_sirene_ativa: Option<JsonValue>,
    #[serde(default)]
    pub equip_sirete_tempo: Option<JsonValue>,
    #[serde(default)]
    pub sensor: Option<OneOrMany<RawSensorReading>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSensorReading {
    #[serde(default, deserialize_with = "loose_string")]
    pub sensor_uuid: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub sensor_nome: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub sensor_tipo: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub tipo: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub sensor_unidade: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub sensor_status: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub sensor_fabricante: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub sensor_modelo: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub sensor_firmware: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub sensor_id_hardware: Option<String>,
    #[serde(default)]
    pub sensor_via_hub: Option<JsonValue>,
    #[serde(default)]
    pub valor: Option<JsonValue>,
    #[serde(default, deserialize_with = "loose_string")]
    pub status: Option<String>,
    #[serde(default)]
    pub sensor_telemetria: Option<JsonValue>,
    #[serde(default)]
    pub sensor_datahora_coleta: Option<RawTimestamp>,
    #[serde(default)]
    pub timestamp: Option<RawTimestamp>,
    #[serde(default)]
    pub sensor_bateria_pct: Option<JsonValue>,
    #[serde(default)]
    pub sensor_sinal_rssi: Option<JsonValue>,
    #[serde(default)]
    pub sensor_sinal_lqi: Option<JsonValue>,
    #[serde(default)]
    pub sensor_voltagem_bateria: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Str(String),
    Int(i64),
    Other(JsonValue),
}

impl RawTimestamp {
    /// Malformed timestamps fall back to `now`; they never fail a reading.
    fn to_datetime(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RawTimestamp::Str(raw) => parse_timestamp(raw).unwrap_or(now),
            RawTimestamp::Int(ms) => Utc.timestamp_millis_opt(*ms).single().unwrap_or(now),
            RawTimestamp::Other(_) => now,
        }
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    // Offset-less ISO strings are taken as UTC.
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

impl RawTelemetryItem {
    pub fn from_json(value: JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn readings(&self) -> Vec<RawSensorReading> {
        self.sensor
            .clone()
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
    }

    /// Attributes used when the equipment does not exist yet.
    pub fn new_equipment(&self, uuid: &str) -> NewEquipment {
        NewEquipment {
            uuid: uuid.to_string(),
            name: self
                .equip_nome
                .clone()
                .unwrap_or_else(|| format!("Equipment {}", short_id(uuid))),
            status: EntityStatus::normalize(self.equip_status.as_deref()),
            collection_interval_seconds: self
                .equip_intervalo_coleta
                .as_ref()
                .and_then(loose_i32)
                .unwrap_or(DEFAULT_COLLECTION_INTERVAL_SECONDS),
            siren_active: self
                .equip_sirene_ativa
                .as_ref()
                .map(loose_flag)
                .unwrap_or(false),
            siren_time_seconds: self
                .equip_sirete_tempo
                .as_ref()
                .and_then(loose_i32)
                .unwrap_or(DEFAULT_SIREN_TIME_SECONDS),
        }
    }
}

impl RawSensorReading {
    pub fn new_sensor(&self, uuid: &str) -> NewSensor {
        NewSensor {
            uuid: uuid.to_string(),
            name: self
                .sensor_nome
                .clone()
                .unwrap_or_else(|| format!("Sensor {}", short_id(uuid))),
            sensor_type: self
                .sensor_tipo
                .clone()
                .or_else(|| self.tipo.clone())
                .unwrap_or_else(|| DEFAULT_SENSOR_TYPE.to_string()),
            unit: self.sensor_unidade.clone(),
            status: EntityStatus::normalize(self.sensor_status.as_deref()),
            manufacturer: self.sensor_fabricante.clone(),
            model: self.sensor_modelo.clone(),
            firmware: self.sensor_firmware.clone(),
            hardware_id: self.sensor_id_hardware.clone(),
            via_hub: self
                .sensor_via_hub
                .as_ref()
                .map(loose_flag)
                .unwrap_or(false),
        }
    }

    /// Numeric `valor` wins; otherwise `sensor_telemetria` is coerced to a
    /// number, and kept as the textual status when that fails.
    pub fn value_and_status(&self) -> (Option<f64>, Option<String>) {
        let mut status = self.status.clone();
        let mut value = self.valor.as_ref().and_then(loose_f64);

        if value.is_none() {
            match self.sensor_telemetria.as_ref() {
                Some(JsonValue::String(text)) => match text.trim().parse::<f64>() {
                    Ok(parsed) if parsed.is_finite() => value = Some(parsed),
                    _ => status = Some(text.clone()),
                },
                Some(other) => {
                    if let Some(parsed) = loose_f64(other) {
                        value = Some(parsed);
                    }
                }
                None => {}
            }
        }

        (value, status)
    }

    pub fn timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.sensor_datahora_coleta
            .as_ref()
            .or(self.timestamp.as_ref())
            .map(|raw| raw.to_datetime(now))
            .unwrap_or(now)
    }

    pub fn metadata(&self) -> Option<Map<String, JsonValue>> {
        let mut metadata = Map::new();
        for (key, raw) in [
            ("battery", &self.sensor_bateria_pct),
            ("rssi", &self.sensor_sinal_rssi),
            ("lqi", &self.sensor_sinal_lqi),
            ("battery_voltage", &self.sensor_voltagem_bateria),
        ] {
            if let Some(value) = raw.as_ref().filter(|v| !v.is_null()) {
                metadata.insert(key.to_string(), value.clone());
            }
        }
        if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        }
    }

    pub fn to_record(
        &self,
        sensor_id: i32,
        equipment: &Equipment,
        now: DateTime<Utc>,
    ) -> TelemetryRecord {
        let (value, status) = self.value_and_status();
        TelemetryRecord {
            sensor_id,
            equipment_id: equipment.id,
            scope: equipment.scope,
            value,
            status,
            timestamp: self.timestamp(now),
            metadata: self.metadata(),
        }
    }
}

fn short_id(uuid: &str) -> &str {
    match uuid.char_indices().nth(8) {
        Some((idx, _)) => &uuid[..idx],
        None => uuid,
    }
}

fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

pub(crate) fn loose_f64(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

pub(crate) fn loose_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn loose_i32(value: &JsonValue) -> Option<i32> {
    loose_i64(value).and_then(|v| i32::try_from(v).ok())
}

fn loose_flag(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_i64() == Some(1),
        JsonValue::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "sim" | "yes" | "true" | "1"
        ),
        _ => false,
    }
}
