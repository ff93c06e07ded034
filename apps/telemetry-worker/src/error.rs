use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored value: {0}")]
    Decode(String),
    #[cfg(test)]
    #[error("injected failure: {0}")]
    Injected(String),
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob {0} not found")]
    NotFound(String),
    #[error("invalid blob key {0:?}")]
    InvalidKey(String),
    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob storage request failed: {0}")]
    Remote(String),
}

/// Errors that escape `TelemetryProcessor::process_batch` or the entity
/// resolver. Per-item and per-group failures are collected into the batch
/// outcome instead.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("tenant, organization and workspace must all be non-zero (got {tenant_id}/{organization_id}/{workspace_id})")]
    InvalidScope {
        tenant_id: i32,
        organization_id: i32,
        workspace_id: i32,
    },
    #[error("{entity} {uuid} belongs to another scope")]
    ScopeViolation { entity: &'static str, uuid: String },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Why a single broker message could not be handled.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("undecodable envelope: {0}")]
    Envelope(String),
    #[error("claim check {claim_check} could not be fetched: {source}")]
    BlobFetch {
        claim_check: String,
        #[source]
        source: BlobError,
    },
    #[error("claim check payload is not JSON: {0}")]
    Payload(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl MessageError {
    /// Transient failures are worth retrying in process before the message
    /// is dead-lettered.
    pub fn is_transient(&self) -> bool {
        match self {
            MessageError::BlobFetch { source, .. } => !matches!(
                source,
                BlobError::NotFound(_) | BlobError::InvalidKey(_)
            ),
            MessageError::Process(ProcessError::Storage(_)) => true,
            _ => false,
        }
    }
}
