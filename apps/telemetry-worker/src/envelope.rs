use crate::error::MessageError;
use crate::model::{ScopeKey, UsageCounts};
use crate::telemetry::loose_i64;
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Minio,
    S3,
    Local,
}

impl StorageKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "minio" => Some(StorageKind::Minio),
            "s3" => Some(StorageKind::S3),
            "local" => Some(StorageKind::Local),
            _ => None,
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageKind::Minio => "minio",
            StorageKind::S3 => "s3",
            StorageKind::Local => "local",
        })
    }
}

/// Reference to a payload uploaded to blob storage by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimCheck {
    pub claim_check: String,
    pub storage: Option<StorageKind>,
    pub scope: ScopeKey,
    pub usage: UsageCounts,
}

/// Pre-claim-check producers put the readings in the message itself.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyPayload {
    pub scope: ScopeKey,
    pub items: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    ClaimCheck(ClaimCheck),
    Legacy(LegacyPayload),
}

impl Envelope {
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        let mut bytes = payload.to_vec();
        let value: JsonValue = simd_json::serde::from_slice(&mut bytes)
            .map_err(|err| MessageError::Envelope(err.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: JsonValue) -> Result<Self, MessageError> {
        match value {
            JsonValue::Object(ref map) if map.contains_key("claim_check") => {
                let claim_check = match map.get("claim_check") {
                    Some(JsonValue::String(key)) if !key.trim().is_empty() => key.trim().to_string(),
                    _ => {
                        return Err(MessageError::Envelope(
                            "claim_check must be a non-empty string".to_string(),
                        ))
                    }
                };
                let storage = match map.get("storage_type") {
                    None | Some(JsonValue::Null) => None,
                    Some(JsonValue::String(raw)) => Some(StorageKind::parse(raw).ok_or_else(
                        || MessageError::Envelope(format!("unknown storage_type {raw:?}")),
                    )?),
                    Some(other) => {
                        return Err(MessageError::Envelope(format!(
                            "storage_type must be a string, got {other}"
                        )))
                    }
                };
                let metadata = map.get("metadata").filter(|m| m.is_object());
                let meta = |key: &str| metadata.and_then(|m| m.get(key));
                let top = |key: &str| map.get(key);

                let scope = ScopeKey::new(
                    first_id(&[meta("tenantId"), top("tenant_id")]),
                    first_id(&[meta("organizationId"), top("organization_id")]),
                    first_id(&[meta("workspaceId"), top("workspace_id")]),
                );
                let usage = UsageCounts::new(
                    first_count(&[meta("itemsCount")]),
                    first_count(&[meta("totalSensors")]),
                    first_count(&[meta("fileSize"), top("file_size")]),
                );

                Ok(Envelope::ClaimCheck(ClaimCheck {
                    claim_check,
                    storage,
                    scope,
                    usage,
                }))
            }
            JsonValue::Object(mut map) => {
                let scope = ScopeKey::new(
                    first_id(&[map.get("tenant_id")]),
                    first_id(&[map.get("organization_id")]),
                    first_id(&[map.get("workspace_id")]),
                );
                let items = match map.remove("data") {
                    Some(data) => into_items(data),
                    None => vec![JsonValue::Object(map)],
                };
                Ok(Envelope::Legacy(LegacyPayload { scope, items }))
            }
            JsonValue::Array(items) => Ok(Envelope::Legacy(LegacyPayload {
                scope: ScopeKey::default(),
                items,
            })),
            other => Err(MessageError::Envelope(format!(
                "expected an object or array, got {other}"
            ))),
        }
    }

    pub fn claim_check(&self) -> Option<&str> {
        match self {
            Envelope::ClaimCheck(cc) => Some(&cc.claim_check),
            Envelope::Legacy(_) => None,
        }
    }
}

/// A blob (or inline `data`) may hold a single item or a list of them.
pub fn into_items(value: JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items,
        JsonValue::Null => Vec::new(),
        other => vec![other],
    }
}

fn non_negative(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
            s.parse::<i64>().ok()
        }
        JsonValue::Number(_) => loose_i64(value).filter(|v| *v >= 0),
        _ => None,
    }
}

// Zero and unparsable values fall through to the next candidate.
fn first_count(candidates: &[Option<&JsonValue>]) -> i64 {
    candidates
        .iter()
        .flatten()
        .filter_map(|value| non_negative(value))
        .find(|v| *v != 0)
        .unwrap_or(0)
}

fn first_id(candidates: &[Option<&JsonValue>]) -> i32 {
    i32::try_from(first_count(candidates)).unwrap_or(0)
}
