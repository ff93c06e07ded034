use crate::error::StoreError;
use crate::model::{ScopeKey, UsageCounts};
use crate::store::IngestStore;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;

/// Daily usage counters, tenant-wide and per full scope.
#[derive(Clone)]
pub struct UsageAccumulator {
    store: Arc<dyn IngestStore>,
}

impl UsageAccumulator {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    /// Adds `delta` to today's (UTC) counters. Returns whether anything was
    /// written; an all-zero delta is skipped.
    pub async fn record_usage(
        &self,
        scope: ScopeKey,
        delta: UsageCounts,
    ) -> Result<bool, StoreError> {
        self.record_usage_on(scope, Utc::now().date_naive(), delta)
            .await
    }

    pub async fn record_usage_on(
        &self,
        scope: ScopeKey,
        day: NaiveDate,
        delta: UsageCounts,
    ) -> Result<bool, StoreError> {
        if delta.is_zero() {
            return Ok(false);
        }
        self.store.add_usage(scope, day, delta).await?;
        tracing::debug!(
            tenant_id = scope.tenant_id,
            organization_id = scope.organization_id,
            workspace_id = scope.workspace_id,
            items = delta.items,
            sensors = delta.sensors,
            bytes = delta.bytes,
            %day,
            "recorded usage"
        );
        Ok(true)
    }
}
