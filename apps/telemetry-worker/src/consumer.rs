use crate::blob::BlobRouter;
use crate::config::Config;
use crate::envelope::{into_items, Envelope};
use crate::error::MessageError;
use crate::ingest::{BatchOutcome, TelemetryProcessor};
use crate::kafka::{InboundMessage, MessageSource, Position};
use crate::model::{DeadLetter, ScopeKey};
use crate::pipeline::IngestStats;
use crate::store::IngestStore;
use crate::usage::UsageAccumulator;
use anyhow::Result;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub batch_size: usize,
    pub auto_commit: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub idle_backoff: Duration,
    pub delete_after_processing: bool,
    pub record_usage: bool,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.kafka_batch_size.max(1),
            auto_commit: config.kafka_auto_commit,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            idle_backoff: config.idle_backoff(),
            delete_after_processing: config.delete_file_after_processing,
            record_usage: config.billing_usage_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageReport {
    pub claim_check: Option<String>,
    pub scope: ScopeKey,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Handled(MessageReport),
    DeadLettered,
    /// Neither handled nor parked; its partition must not move past it.
    Unresolved,
}

impl Disposition {
    fn resolved(&self) -> bool {
        !matches!(self, Disposition::Unresolved)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub handled: usize,
    pub dead_lettered: usize,
    pub unresolved: usize,
    pub skipped: usize,
    pub committed: Vec<Position>,
}

pub struct IngestionLoop<S> {
    source: S,
    blobs: BlobRouter,
    processor: TelemetryProcessor,
    usage: UsageAccumulator,
    store: Arc<dyn IngestStore>,
    settings: IngestSettings,
    stats: Arc<IngestStats>,
    /// Partitions stopped at an unresolved message. The client's fetch
    /// position has already moved past it, so they stay held until restart.
    held: HashSet<(String, i32)>,
}

impl<S: MessageSource> IngestionLoop<S> {
    pub fn new(
        source: S,
        blobs: BlobRouter,
        store: Arc<dyn IngestStore>,
        insert_chunk_size: usize,
        settings: IngestSettings,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            source,
            blobs,
            processor: TelemetryProcessor::new(store.clone(), insert_chunk_size),
            usage: UsageAccumulator::new(store.clone()),
            store,
            settings,
            stats,
            held: HashSet::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            batch_size = self.settings.batch_size,
            auto_commit = self.settings.auto_commit,
            "ingestion loop started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = self.source.poll() => polled,
            };
            let messages = match polled {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!(error = %err, "broker poll failed");
                    self.stats.record_error(err.to_string());
                    if pause(POLL_ERROR_BACKOFF, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            if messages.is_empty() {
                if pause(self.settings.idle_backoff, &mut shutdown).await {
                    break;
                }
                continue;
            }

            let batch_id = Uuid::new_v4();
            let span = tracing::info_span!("batch", %batch_id);
            let report = self
                .handle_batch(messages, &shutdown)
                .instrument(span)
                .await;
            tracing::debug!(
                %batch_id,
                handled = report.handled,
                dead_lettered = report.dead_lettered,
                unresolved = report.unresolved,
                skipped = report.skipped,
                "batch finished"
            );
            self.stats.log_summary("ingest stats");
        }
        self.stats.log_summary("ingestion loop stopped");
        Ok(())
    }

    /// Processes one polled set in chunks of `batch_size`, committing after
    /// each chunk. A partition stops at its first unresolved message; later
    /// messages from it, in this poll and every later one, are left for
    /// redelivery after a restart.
    pub async fn handle_batch(
        &mut self,
        messages: Vec<InboundMessage>,
        shutdown: &watch::Receiver<bool>,
    ) -> BatchReport {
        IngestStats::add(&self.stats.messages_polled, messages.len() as u64);
        let mut report = BatchReport::default();

        if self.settings.auto_commit {
            let positions = last_positions(&messages);
            if self.commit(&positions).await {
                report.committed.extend(positions);
            }
        }

        let mut blocked = if self.settings.auto_commit {
            HashSet::new()
        } else {
            self.held.clone()
        };
        let mut stopping = false;
        for chunk in messages.chunks(self.settings.batch_size.max(1)) {
            let mut advanced: HashMap<(String, i32), i64> = HashMap::new();
            for message in chunk {
                let partition = (message.topic.clone(), message.partition);
                if stopping || blocked.contains(&partition) {
                    report.skipped += 1;
                    continue;
                }
                if *shutdown.borrow() {
                    tracing::info!("shutdown requested; leaving rest of batch for redelivery");
                    stopping = true;
                    report.skipped += 1;
                    continue;
                }

                let disposition = self.handle_message(message, shutdown).await;
                match &disposition {
                    Disposition::Handled(_) => report.handled += 1,
                    Disposition::DeadLettered => report.dead_lettered += 1,
                    Disposition::Unresolved => report.unresolved += 1,
                }
                if disposition.resolved() {
                    advanced.insert(partition, message.offset);
                } else {
                    tracing::error!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        "partition held at unresolved message until restart"
                    );
                    blocked.insert(partition);
                }
            }

            if !self.settings.auto_commit && !advanced.is_empty() {
                let mut positions: Vec<Position> = advanced
                    .into_iter()
                    .map(|((topic, partition), offset)| Position {
                        topic,
                        partition,
                        offset,
                    })
                    .collect();
                positions.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
                if self.commit(&positions).await {
                    report.committed.extend(positions);
                }
            }
        }
        if !self.settings.auto_commit {
            self.held = blocked;
        }
        report
    }

    async fn commit(&mut self, positions: &[Position]) -> bool {
        if positions.is_empty() {
            return true;
        }
        match self.source.commit(positions).await {
            Ok(()) => {
                self.stats.mark_committed();
                tracing::debug!(positions = positions.len(), "committed offsets");
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "offset commit failed");
                self.stats.record_error(err.to_string());
                false
            }
        }
    }

    /// Retries transient failures, then parks the message in the dead-letter
    /// table.
    pub async fn handle_message(
        &self,
        message: &InboundMessage,
        shutdown: &watch::Receiver<bool>,
    ) -> Disposition {
        let key = message.key.as_deref().unwrap_or("");
        let mut attempt = 0u32;
        loop {
            match self.process_message(message).await {
                Ok(report) => {
                    IngestStats::add(&self.stats.messages_handled, 1);
                    IngestStats::add(&self.stats.rows_inserted, report.outcome.inserted);
                    self.stats.clear_error();
                    if !report.outcome.is_clean() {
                        tracing::warn!(
                            message_key = key,
                            partition = message.partition,
                            offset = message.offset,
                            claim_check = report.claim_check.as_deref().unwrap_or(""),
                            tenant_id = report.scope.tenant_id,
                            organization_id = report.scope.organization_id,
                            workspace_id = report.scope.workspace_id,
                            errors = ?report.outcome.errors,
                            "message processed with item errors"
                        );
                    }
                    return Disposition::Handled(report);
                }
                Err(err) if err.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        message_key = key,
                        partition = message.partition,
                        offset = message.offset,
                        attempt,
                        error = %err,
                        "transient failure; retrying message"
                    );
                    let mut shutdown = shutdown.clone();
                    if pause(self.settings.retry_delay, &mut shutdown).await {
                        return Disposition::Unresolved;
                    }
                }
                Err(err) => {
                    IngestStats::add(&self.stats.messages_failed, 1);
                    self.stats.record_error(err.to_string());
                    return self.dead_letter(message, &err).await;
                }
            }
        }
    }

    async fn dead_letter(&self, message: &InboundMessage, err: &MessageError) -> Disposition {
        let claim_check = Envelope::decode(&message.value)
            .ok()
            .and_then(|envelope| envelope.claim_check().map(str::to_string));
        tracing::error!(
            message_key = message.key.as_deref().unwrap_or(""),
            partition = message.partition,
            offset = message.offset,
            claim_check = claim_check.as_deref().unwrap_or(""),
            error = %err,
            "message failed; dead-lettering"
        );
        let letter = DeadLetter {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            message_key: message.key.clone(),
            claim_check,
            error: err.to_string(),
            payload: String::from_utf8_lossy(&message.value).into_owned(),
        };
        match self.store.record_dead_letter(&letter).await {
            Ok(()) => {
                IngestStats::add(&self.stats.dead_lettered, 1);
                Disposition::DeadLettered
            }
            Err(store_err) => {
                tracing::error!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %store_err,
                    "dead-letter write failed; holding partition offset"
                );
                self.stats.record_error(store_err.to_string());
                Disposition::Unresolved
            }
        }
    }

    async fn process_message(&self, message: &InboundMessage) -> Result<MessageReport, MessageError> {
        match Envelope::decode(&message.value)? {
            Envelope::ClaimCheck(claim) => {
                let backend = self.blobs.backend(claim.storage);
                let bytes = backend.fetch(&claim.claim_check).await.map_err(|source| {
                    MessageError::BlobFetch {
                        claim_check: claim.claim_check.clone(),
                        source,
                    }
                })?;
                let mut buffer = bytes.to_vec();
                let payload: JsonValue = simd_json::serde::from_slice(&mut buffer)
                    .map_err(|err| MessageError::Payload(err.to_string()))?;

                let outcome = self
                    .processor
                    .process_batch(claim.scope, into_items(payload))
                    .await?;

                if self.settings.record_usage {
                    if let Err(err) = self.usage.record_usage(claim.scope, claim.usage).await {
                        tracing::warn!(
                            claim_check = %claim.claim_check,
                            tenant_id = claim.scope.tenant_id,
                            error = %err,
                            "failed to record usage"
                        );
                    }
                }

                if self.settings.delete_after_processing {
                    if outcome.failed_groups == 0 {
                        if let Err(err) = backend.delete(&claim.claim_check).await {
                            tracing::warn!(
                                claim_check = %claim.claim_check,
                                error = %err,
                                "failed to delete processed blob"
                            );
                        }
                    } else {
                        tracing::warn!(
                            claim_check = %claim.claim_check,
                            failed_groups = outcome.failed_groups,
                            "keeping blob for replay"
                        );
                    }
                }

                tracing::info!(
                    claim_check = %claim.claim_check,
                    tenant_id = claim.scope.tenant_id,
                    organization_id = claim.scope.organization_id,
                    workspace_id = claim.scope.workspace_id,
                    processed = outcome.processed,
                    inserted = outcome.inserted,
                    errors = outcome.errors.len(),
                    "processed claim check"
                );
                Ok(MessageReport {
                    claim_check: Some(claim.claim_check),
                    scope: claim.scope,
                    outcome,
                })
            }
            Envelope::Legacy(legacy) => {
                let outcome = self
                    .processor
                    .process_batch(legacy.scope, legacy.items)
                    .await?;
                tracing::info!(
                    tenant_id = legacy.scope.tenant_id,
                    processed = outcome.processed,
                    inserted = outcome.inserted,
                    errors = outcome.errors.len(),
                    "processed legacy message"
                );
                Ok(MessageReport {
                    claim_check: None,
                    scope: legacy.scope,
                    outcome,
                })
            }
        }
    }
}

/// Highest offset per partition in a polled set.
fn last_positions(messages: &[InboundMessage]) -> Vec<Position> {
    let mut last: HashMap<(String, i32), i64> = HashMap::new();
    for message in messages {
        let entry = last
            .entry((message.topic.clone(), message.partition))
            .or_insert(message.offset);
        *entry = (*entry).max(message.offset);
    }
    let mut positions: Vec<Position> = last
        .into_iter()
        .map(|((topic, partition), offset)| Position {
            topic,
            partition,
            offset,
        })
        .collect();
    positions.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
    positions
}

/// Sleeps for `duration`; returns true when shutdown was signalled instead.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::memory::MemoryBlobStore;
    use crate::blob::BlobStore;
    use crate::envelope::StorageKind;
    use crate::model::UsageCounts;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const TOPIC: &str = "telemetry.raw";

    #[derive(Default)]
    struct ScriptedSource {
        batches: VecDeque<Vec<InboundMessage>>,
        commits: Arc<Mutex<Vec<Vec<Position>>>>,
        stop_when_drained: Option<watch::Sender<bool>>,
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn poll(&mut self) -> Result<Vec<InboundMessage>> {
            match self.batches.pop_front() {
                Some(batch) => Ok(batch),
                None => {
                    if let Some(stop) = self.stop_when_drained.take() {
                        let _ = stop.send(true);
                    }
                    Ok(Vec::new())
                }
            }
        }

        async fn commit(&mut self, positions: &[Position]) -> Result<()> {
            self.commits.lock().unwrap().push(positions.to_vec());
            Ok(())
        }
    }

    struct Harness {
        ingest: IngestionLoop<ScriptedSource>,
        store: Arc<MemoryStore>,
        blobs: Arc<MemoryBlobStore>,
        commits: Arc<Mutex<Vec<Vec<Position>>>>,
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            batch_size: 100,
            auto_commit: false,
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            idle_backoff: Duration::from_millis(1),
            delete_after_processing: true,
            record_usage: true,
        }
    }

    fn harness(settings: IngestSettings) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let local: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::default());
        let router = BlobRouter::new(StorageKind::Minio, blobs.clone(), local);
        let source = ScriptedSource::default();
        let commits = source.commits.clone();
        let ingest = IngestionLoop::new(
            source,
            router,
            store.clone(),
            500,
            settings,
            Arc::new(IngestStats::new()),
        );
        Harness {
            ingest,
            store,
            blobs,
            commits,
        }
    }

    fn message(partition: i32, offset: i64, value: JsonValue) -> InboundMessage {
        InboundMessage {
            topic: TOPIC.to_string(),
            partition,
            offset,
            key: Some(format!("key-{offset}")),
            value: serde_json::to_vec(&value).unwrap(),
        }
    }

    fn claim_check(key: &str) -> JsonValue {
        json!({
            "claim_check": key,
            "storage_type": "minio",
            "metadata": {
                "tenantId": 1,
                "organizationId": 2,
                "workspaceId": 3,
                "itemsCount": 2,
                "totalSensors": 2,
                "fileSize": 321
            }
        })
    }

    fn two_readings_blob() -> Vec<u8> {
        serde_json::to_vec(&json!([
            {
                "equip_uuid": "equip-0001-aaaa",
                "equip_nome": "Freezer",
                "sensor": [{
                    "sensor_uuid": "sensor-0001-aaaa",
                    "sensor_tipo": "temperature",
                    "valor": -18.5,
                    "sensor_datahora_coleta": "2024-05-01T10:00:00Z"
                }]
            },
            {
                "equip_uuid": "equip-0001-aaaa",
                "sensor": {
                    "sensor_uuid": "sensor-0001-aaaa",
                    "valor": -18.1,
                    "sensor_datahora_coleta": "2024-05-01T10:01:00Z"
                }
            }
        ]))
        .unwrap()
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn claim_check_end_to_end() {
        let mut h = harness(settings());
        h.blobs.put("2024/05/01/a.json", two_readings_blob());

        let report = h
            .ingest
            .handle_batch(vec![message(0, 7, claim_check("2024/05/01/a.json"))], &no_shutdown())
            .await;

        assert_eq!(report.handled, 1);
        {
            let state = h.store.state();
            assert_eq!(state.equipments.len(), 1);
            assert_eq!(state.sensors.len(), 1);
            assert_eq!(state.telemetry.len(), 2);
            assert!(state
                .telemetry
                .iter()
                .all(|r| r.scope == ScopeKey::new(1, 2, 3)));
            let day = Utc::now().date_naive();
            assert_eq!(state.usage_daily[&(1, day)], UsageCounts::new(2, 2, 321));
        }
        assert!(!h.blobs.contains("2024/05/01/a.json"));
        assert_eq!(
            h.commits.lock().unwrap().clone(),
            vec![vec![Position {
                topic: TOPIC.to_string(),
                partition: 0,
                offset: 7
            }]]
        );

        // A missing blob is permanent: no retries, straight to the dead-letter table.
        let disposition = h
            .ingest
            .handle_message(&message(0, 8, claim_check("missing")), &no_shutdown())
            .await;
        assert_eq!(disposition, Disposition::DeadLettered);
        assert_eq!(h.store.state().dead_letters.len(), 1);
    }

    #[tokio::test]
    async fn processor_outcome_counts_items_and_rows() {
        let h = harness(settings());
        h.blobs.put("b", two_readings_blob());
        let Disposition::Handled(report) = h
            .ingest
            .handle_message(&message(0, 1, claim_check("b")), &no_shutdown())
            .await
        else {
            panic!("expected handled");
        };
        assert_eq!(report.outcome.processed, 2);
        assert_eq!(report.outcome.inserted, 2);
        assert!(report.outcome.errors.is_empty());
        assert_eq!(report.claim_check.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn poison_message_is_dead_lettered_and_committed() {
        let mut h = harness(settings());
        h.blobs.put("good", two_readings_blob());
        let mut poison = message(0, 1, json!(null));
        poison.value = b"{not json".to_vec();

        let report = h
            .ingest
            .handle_batch(vec![poison, message(0, 2, claim_check("good"))], &no_shutdown())
            .await;

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.handled, 1);
        let letters = h.store.state().dead_letters.clone();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].offset, 1);
        assert_eq!(letters[0].payload, "{not json");
        assert!(letters[0].error.contains("undecodable envelope"));
        assert_eq!(report.committed.last().map(|p| p.offset), Some(2));
    }

    #[tokio::test]
    async fn transient_blob_failures_are_retried() {
        let h = harness(settings());
        h.blobs.put("flaky", two_readings_blob());
        h.blobs.fail_next_fetches(2);

        let disposition = h
            .ingest
            .handle_message(&message(0, 1, claim_check("flaky")), &no_shutdown())
            .await;
        assert!(matches!(disposition, Disposition::Handled(_)));
        assert_eq!(h.store.state().telemetry.len(), 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let h = harness(settings());
        h.blobs.put("down", two_readings_blob());
        h.blobs.fail_next_fetches(10);

        let disposition = h
            .ingest
            .handle_message(&message(0, 1, claim_check("down")), &no_shutdown())
            .await;
        assert_eq!(disposition, Disposition::DeadLettered);
        let state = h.store.state();
        assert_eq!(state.dead_letters[0].claim_check.as_deref(), Some("down"));
        assert!(state.telemetry.is_empty());
    }

    #[tokio::test]
    async fn failed_dead_letter_holds_only_its_partition() {
        let mut h = harness(settings());
        h.blobs.put("p0", two_readings_blob());
        h.blobs.put("p1", two_readings_blob());
        h.store.state().fail_dead_letters = true;

        let report = h
            .ingest
            .handle_batch(
                vec![
                    message(1, 40, claim_check("p1")),
                    message(0, 10, json!({"data": []})),
                    message(0, 11, claim_check("p0")),
                ],
                &no_shutdown(),
            )
            .await;

        assert_eq!(report.unresolved, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(
            report.committed,
            vec![Position {
                topic: TOPIC.to_string(),
                partition: 1,
                offset: 40
            }]
        );
        assert!(h.blobs.contains("p0"));
    }

    #[tokio::test]
    async fn held_partition_stays_held_on_later_polls() {
        let mut h = harness(settings());
        h.blobs.put("p0", two_readings_blob());
        h.blobs.put("p1", two_readings_blob());
        h.store.state().fail_dead_letters = true;

        let first = h
            .ingest
            .handle_batch(vec![message(0, 10, json!({"data": []}))], &no_shutdown())
            .await;
        assert_eq!(first.unresolved, 1);
        assert!(first.committed.is_empty());

        // The client has moved on, so the next poll starts after offset 10.
        let second = h
            .ingest
            .handle_batch(
                vec![
                    message(0, 11, claim_check("p0")),
                    message(1, 3, claim_check("p1")),
                ],
                &no_shutdown(),
            )
            .await;
        assert_eq!(second.skipped, 1);
        assert_eq!(second.handled, 1);
        assert_eq!(
            h.commits.lock().unwrap().clone(),
            vec![vec![Position {
                topic: TOPIC.to_string(),
                partition: 1,
                offset: 3
            }]]
        );
        assert!(h.blobs.contains("p0"));
        assert!(!h.blobs.contains("p1"));
    }

    #[tokio::test]
    async fn failed_group_keeps_blob_for_replay() {
        let mut h = harness(settings());
        h.blobs.put("partial", two_readings_blob());
        // The first equipment created gets id 1.
        h.store.state().fail_telemetry_for.insert(1);

        let report = h
            .ingest
            .handle_batch(vec![message(0, 3, claim_check("partial"))], &no_shutdown())
            .await;

        assert_eq!(report.handled, 1);
        assert!(h.blobs.contains("partial"));
        assert!(h.store.state().telemetry.is_empty());
        assert_eq!(report.committed.len(), 1);
    }

    #[tokio::test]
    async fn legacy_envelope_without_scope_is_dead_lettered() {
        let mut h = harness(settings());
        let report = h
            .ingest
            .handle_batch(
                vec![message(0, 5, json!({"data": [{"equip_uuid": "x"}]}))],
                &no_shutdown(),
            )
            .await;
        assert_eq!(report.dead_lettered, 1);
        let letters = h.store.state().dead_letters.clone();
        assert!(letters[0].error.contains("must all be non-zero"));
        assert_eq!(letters[0].claim_check, None);
    }

    #[tokio::test]
    async fn legacy_envelope_with_scope_skips_usage() {
        let mut h = harness(settings());
        let report = h
            .ingest
            .handle_batch(
                vec![message(
                    0,
                    5,
                    json!({
                        "tenant_id": 1, "organization_id": 2, "workspace_id": 3,
                        "data": [{"equip_uuid": "e1", "sensor": {"sensor_uuid": "s1", "valor": 1}}]
                    }),
                )],
                &no_shutdown(),
            )
            .await;
        assert_eq!(report.handled, 1);
        let state = h.store.state();
        assert_eq!(state.telemetry.len(), 1);
        assert!(state.usage_daily.is_empty());
    }

    #[tokio::test]
    async fn auto_commit_commits_whole_poll_up_front() {
        let mut settings = settings();
        settings.auto_commit = true;
        let mut h = harness(settings);
        let mut poison = message(0, 1, json!(null));
        poison.value = b"garbage".to_vec();
        h.store.state().fail_dead_letters = true;

        let report = h
            .ingest
            .handle_batch(vec![poison, message(0, 2, json!([]))], &no_shutdown())
            .await;
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.committed[0].offset, 2);
    }

    #[tokio::test]
    async fn batches_commit_per_chunk() {
        let mut settings = settings();
        settings.batch_size = 2;
        let mut h = harness(settings);
        let messages = (0..5)
            .map(|offset| {
                message(
                    0,
                    offset,
                    json!({
                        "tenant_id": 1, "organization_id": 2, "workspace_id": 3,
                        "data": []
                    }),
                )
            })
            .collect();

        h.ingest.handle_batch(messages, &no_shutdown()).await;
        let offsets: Vec<i64> = h
            .commits
            .lock()
            .unwrap()
            .iter()
            .map(|positions| positions[0].offset)
            .collect();
        assert_eq!(offsets, vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let mut h = harness(settings());
        h.blobs.put("a", two_readings_blob());
        let (tx, rx) = watch::channel(false);
        h.ingest.source.batches.push_back(vec![message(0, 1, claim_check("a"))]);
        h.ingest.source.stop_when_drained = Some(tx);

        tokio::time::timeout(Duration::from_secs(5), h.ingest.run(rx))
            .await
            .expect("loop should observe shutdown")
            .unwrap();
        assert_eq!(h.commits.lock().unwrap().len(), 1);
        assert_eq!(h.store.state().telemetry.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_leaves_remaining_messages_uncommitted() {
        let mut h = harness(settings());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = h
            .ingest
            .handle_batch(vec![message(0, 1, json!([]))], &rx)
            .await;
        assert_eq!(report.skipped, 1);
        assert!(report.committed.is_empty());
    }
}
