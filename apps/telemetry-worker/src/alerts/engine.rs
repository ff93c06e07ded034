use super::webhook::{event_name, webhook_matches, WebhookNotifier, WebhookPayload};
use crate::error::StoreError;
use crate::model::{NewAlert, ScopeKey, TenantQuota, UsageCounts};
use crate::store::AlertStore;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const METRICS: [&str; 3] = ["items", "sensors", "bytes"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantEvaluation {
    Throttled,
    Evaluated {
        alerts_created: usize,
        deliveries: usize,
        /// Delivery rows that could not be written. The tenant is not marked
        /// as checked when this is non-zero.
        delivery_failures: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub evaluated: usize,
    pub throttled: usize,
    pub failed: usize,
    pub alerts_created: usize,
    pub deliveries: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct DeliveryTally {
    attempted: usize,
    failed: usize,
}

/// Longest of the tenant override, the plan default and the global cadence.
pub fn effective_delay(quota: &TenantQuota, global: Duration) -> chrono::Duration {
    let global = i64::try_from(global.as_secs()).unwrap_or(i64::MAX);
    let seconds = [quota.tenant_delay_seconds, quota.plan_delay_seconds]
        .into_iter()
        .flatten()
        .fold(global, i64::max);
    chrono::Duration::seconds(seconds)
}

fn limit_for(quota: &TenantQuota, metric: &str) -> Option<i64> {
    match metric {
        "items" => quota.items_per_day,
        "sensors" => quota.sensors_per_day,
        _ => quota.bytes_per_day,
    }
}

fn used_for(usage: &UsageCounts, metric: &str) -> i64 {
    match metric {
        "items" => usage.items,
        "sensors" => usage.sensors,
        _ => usage.bytes,
    }
}

pub struct AlertEngine {
    store: Arc<dyn AlertStore>,
    notifier: Option<WebhookNotifier>,
    poll_interval: Duration,
}

impl AlertEngine {
    /// `notifier` is `None` when webhooks are disabled.
    pub fn new(
        store: Arc<dyn AlertStore>,
        notifier: Option<WebhookNotifier>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            poll_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            poll_seconds = self.poll_interval.as_secs(),
            webhooks = self.notifier.is_some(),
            "alert engine started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.run_cycle(Utc::now(), &shutdown).await;
            if report.alerts_created > 0 || report.failed > 0 {
                tracing::info!(
                    evaluated = report.evaluated,
                    throttled = report.throttled,
                    failed = report.failed,
                    alerts = report.alerts_created,
                    deliveries = report.deliveries,
                    "alert cycle finished"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("alert engine stopped");
        Ok(())
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let mut report = CycleReport::default();
        let tenants = match self.store.tenant_quotas().await {
            Ok(tenants) => tenants,
            Err(err) => {
                tracing::error!(error = %err, "failed to load tenants for alerting");
                report.failed += 1;
                return report;
            }
        };

        for quota in &tenants {
            if *shutdown.borrow() {
                break;
            }
            match self.evaluate_tenant(quota, now).await {
                Ok(TenantEvaluation::Throttled) => report.throttled += 1,
                Ok(TenantEvaluation::Evaluated {
                    alerts_created,
                    deliveries,
                    delivery_failures,
                }) => {
                    report.evaluated += 1;
                    report.alerts_created += alerts_created;
                    report.deliveries += deliveries;
                    if delivery_failures > 0 {
                        report.failed += 1;
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::error!(tenant_id = quota.tenant_id, error = %err, "alert evaluation failed");
                }
            }
        }
        report
    }

    pub async fn evaluate_tenant(
        &self,
        quota: &TenantQuota,
        now: DateTime<Utc>,
    ) -> Result<TenantEvaluation, StoreError> {
        let tenant_id = quota.tenant_id;
        if let Some(last) = self.store.last_checked(tenant_id).await? {
            if now - last < effective_delay(quota, self.poll_interval) {
                return Ok(TenantEvaluation::Throttled);
            }
        }

        let day = now.date_naive();
        let mut alerts_created = 0;
        let mut deliveries = 0;
        let mut delivery_failures = 0;
        for rule in self.store.enabled_rules(tenant_id).await? {
            let workspace_ids = if rule.workspace_ids.is_empty() {
                vec![0]
            } else {
                rule.workspace_ids.clone()
            };
            let workspace_id = if workspace_ids.contains(&0) {
                0
            } else {
                workspace_ids[0]
            };
            let usage = self
                .store
                .usage_for(tenant_id, rule.organization_id, &workspace_ids, day)
                .await?;

            for metric in METRICS {
                let Some(limit) = limit_for(quota, metric).filter(|limit| *limit > 0) else {
                    continue;
                };
                let used = used_for(&usage, metric);
                if i128::from(used) * 100
                    < i128::from(rule.threshold_percent) * i128::from(limit)
                {
                    continue;
                }
                let percent = used as f64 / limit as f64 * 100.0;

                let alert = NewAlert {
                    scope: ScopeKey::new(tenant_id, rule.organization_id, workspace_id),
                    alert_type: format!("quota_{metric}_{}", rule.threshold_percent),
                    day,
                    message: format!("{metric} usage reached {}%", rule.threshold_percent),
                    metadata: json!({
                        "used": used,
                        "limit": limit,
                        "percent": (percent * 100.0).round() / 100.0,
                        "organization_id": rule.organization_id,
                        "workspace_ids": workspace_ids,
                    }),
                };
                let Some(alert_id) = self.store.create_alert(&alert).await? else {
                    tracing::debug!(tenant_id, alert_type = %alert.alert_type, "alert already raised today");
                    continue;
                };
                alerts_created += 1;
                tracing::info!(
                    tenant_id,
                    organization_id = rule.organization_id,
                    workspace_id,
                    alert_id,
                    alert_type = %alert.alert_type,
                    used,
                    limit,
                    "quota alert raised"
                );
                let tally = self.deliver(alert_id, &alert, now).await;
                deliveries += tally.attempted;
                delivery_failures += tally.failed;
            }
        }

        if delivery_failures == 0 {
            self.store.touch_last_checked(tenant_id, now).await?;
        } else {
            tracing::warn!(
                tenant_id,
                delivery_failures,
                "delivery bookkeeping failed; tenant stays due"
            );
        }
        Ok(TenantEvaluation::Evaluated {
            alerts_created,
            deliveries,
            delivery_failures,
        })
    }

    /// Sends `alert` to every matching webhook. Store errors are logged per
    /// webhook and counted, so one bad row does not stop the others.
    async fn deliver(&self, alert_id: i32, alert: &NewAlert, now: DateTime<Utc>) -> DeliveryTally {
        let mut tally = DeliveryTally::default();
        let Some(notifier) = &self.notifier else {
            return tally;
        };
        let tenant_id = alert.scope.tenant_id;
        let webhooks = match self.store.enabled_webhooks(tenant_id).await {
            Ok(webhooks) => webhooks,
            Err(err) => {
                tracing::error!(tenant_id, alert_id, error = %err, "failed to load webhooks");
                tally.failed += 1;
                return tally;
            }
        };
        let event = event_name(&alert.alert_type);
        let payload = WebhookPayload {
            event: event.clone(),
            alert_type: alert.alert_type.clone(),
            tenant_id,
            organization_id: alert.scope.organization_id,
            workspace_id: alert.scope.workspace_id,
            timestamp: now.timestamp(),
        };

        for webhook in webhooks {
            if !webhook_matches(
                &webhook,
                alert.scope.organization_id,
                alert.scope.workspace_id,
                &event,
            ) {
                continue;
            }
            let delivery = match self.store.create_delivery(alert_id, webhook.id).await {
                Ok(delivery) => delivery,
                Err(err) => {
                    tracing::error!(
                        alert_id,
                        webhook_id = webhook.id,
                        error = %err,
                        "failed to create delivery row"
                    );
                    tally.failed += 1;
                    continue;
                }
            };
            let outcome = notifier.deliver(&webhook, &payload).await;
            tally.attempted += 1;
            if let Err(err) = self.store.finish_delivery(delivery.id, &outcome).await {
                tracing::error!(
                    alert_id,
                    webhook_id = webhook.id,
                    delivery_id = delivery.id,
                    error = %err,
                    "failed to record delivery outcome"
                );
                tally.failed += 1;
                continue;
            }
            tracing::debug!(
                alert_id,
                webhook_id = webhook.id,
                delivery_id = delivery.id,
                status = outcome.status.as_str(),
                "webhook delivery recorded"
            );
        }
        tally
    }
}
