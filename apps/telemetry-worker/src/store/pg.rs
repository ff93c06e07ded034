use super::{is_tenant_wide, AlertStore, IngestStore};
use crate::error::StoreError;
use crate::model::{
    AlertDelivery, AlertRule, DeadLetter, DeliveryOutcome, DeliveryStatus, EntityStatus,
    Equipment, NewAlert, NewEquipment, NewSensor, ScopeKey, Sensor, TelemetryRecord, TenantQuota,
    UsageCounts, Webhook,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

const EQUIPMENT_COLUMNS: &str = "id, uuid, name, status, collection_interval, siren_active, \
     siren_time, tenant_id, organization_id, workspace_id";
const SENSOR_COLUMNS: &str = "id, uuid, name, type, unit, status, equipment_id, tenant_id, \
     organization_id, workspace_id, manufacturer, model, firmware, hardware_id, via_hub";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn scope_from_row(row: &PgRow) -> Result<ScopeKey, sqlx::Error> {
    Ok(ScopeKey::new(
        row.try_get("tenant_id")?,
        row.try_get("organization_id")?,
        row.try_get("workspace_id")?,
    ))
}

fn equipment_from_row(row: &PgRow) -> Result<Equipment, sqlx::Error> {
    Ok(Equipment {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        status: EntityStatus::normalize(row.try_get::<Option<String>, _>("status")?.as_deref()),
        collection_interval_seconds: row.try_get("collection_interval")?,
        siren_active: row.try_get("siren_active")?,
        siren_time_seconds: row.try_get("siren_time")?,
        scope: scope_from_row(row)?,
    })
}

fn sensor_from_row(row: &PgRow) -> Result<Sensor, sqlx::Error> {
    Ok(Sensor {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        sensor_type: row.try_get("type")?,
        unit: row.try_get("unit")?,
        status: EntityStatus::normalize(row.try_get::<Option<String>, _>("status")?.as_deref()),
        equipment_id: row.try_get("equipment_id")?,
        scope: scope_from_row(row)?,
        manufacturer: row.try_get("manufacturer")?,
        model: row.try_get("model")?,
        firmware: row.try_get("firmware")?,
        hardware_id: row.try_get("hardware_id")?,
        via_hub: row.try_get("via_hub")?,
    })
}

fn delivery_from_row(row: &PgRow) -> Result<AlertDelivery, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(AlertDelivery {
        id: row.try_get("id")?,
        alert_id: row.try_get("alert_id")?,
        webhook_id: row.try_get("webhook_id")?,
        status: DeliveryStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("delivery status {status:?}")))?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        next_retry_at: row.try_get("next_retry_at")?,
    })
}

#[async_trait]
impl IngestStore for PgStore {
    async fn find_equipment(&self, uuid: &str) -> Result<Option<Equipment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EQUIPMENT_COLUMNS} FROM equipments WHERE uuid = $1 ORDER BY id LIMIT 1"
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(equipment_from_row).transpose()?)
    }

    async fn create_equipment(
        &self,
        scope: ScopeKey,
        new: &NewEquipment,
    ) -> Result<Equipment, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO equipments (
                uuid, name, status, collection_interval, siren_active, siren_time,
                tenant_id, organization_id, workspace_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (uuid, tenant_id, organization_id, workspace_id)
            DO UPDATE SET uuid = EXCLUDED.uuid
            RETURNING {EQUIPMENT_COLUMNS}
            "#
        ))
        .bind(&new.uuid)
        .bind(&new.name)
        .bind(new.status.as_str())
        .bind(new.collection_interval_seconds)
        .bind(new.siren_active)
        .bind(new.siren_time_seconds)
        .bind(scope.tenant_id)
        .bind(scope.organization_id)
        .bind(scope.workspace_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(equipment_from_row(&row)?)
    }

    async fn find_sensor(&self, uuid: &str) -> Result<Option<Sensor>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SENSOR_COLUMNS} FROM sensors WHERE uuid = $1"))
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(sensor_from_row).transpose()?)
    }

    async fn create_sensor(
        &self,
        equipment: &Equipment,
        new: &NewSensor,
    ) -> Result<Sensor, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sensors (
                uuid, name, type, unit, status, equipment_id,
                tenant_id, organization_id, workspace_id,
                manufacturer, model, firmware, hardware_id, via_hub, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), NOW())
            ON CONFLICT (uuid) DO UPDATE SET uuid = EXCLUDED.uuid
            RETURNING {SENSOR_COLUMNS}
            "#
        ))
        .bind(&new.uuid)
        .bind(&new.name)
        .bind(&new.sensor_type)
        .bind(&new.unit)
        .bind(new.status.as_str())
        .bind(equipment.id)
        .bind(equipment.scope.tenant_id)
        .bind(equipment.scope.organization_id)
        .bind(equipment.scope.workspace_id)
        .bind(&new.manufacturer)
        .bind(&new.model)
        .bind(&new.firmware)
        .bind(&new.hardware_id)
        .bind(new.via_hub)
        .fetch_one(&self.pool)
        .await?;
        Ok(sensor_from_row(&row)?)
    }

    async fn insert_telemetry(
        &self,
        records: &[TelemetryRecord],
        chunk_size: usize,
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in records.chunks(chunk_size.max(1)) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO telemetry_data (sensor_id, equipment_id, tenant_id, organization_id, \
                 workspace_id, value, status, timestamp, metadata, created_at) ",
            );
            builder.push_values(chunk.iter(), |mut b, record| {
                b.push_bind(record.sensor_id)
                    .push_bind(record.equipment_id)
                    .push_bind(record.scope.tenant_id)
                    .push_bind(record.scope.organization_id)
                    .push_bind(record.scope.workspace_id)
                    .push_bind(record.value)
                    .push_bind(record.status.as_deref())
                    .push_bind(record.timestamp)
                    .push_bind(record.metadata.as_ref().map(Json))
                    .push_bind(created_at);
            });
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn add_usage(
        &self,
        scope: ScopeKey,
        day: NaiveDate,
        delta: UsageCounts,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO tenant_usage_daily
                (tenant_id, day, items_count, sensors_count, bytes_ingested, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (tenant_id, day) DO UPDATE SET
                items_count = tenant_usage_daily.items_count + EXCLUDED.items_count,
                sensors_count = tenant_usage_daily.sensors_count + EXCLUDED.sensors_count,
                bytes_ingested = tenant_usage_daily.bytes_ingested + EXCLUDED.bytes_ingested,
                updated_at = NOW()
            "#,
        )
        .bind(scope.tenant_id)
        .bind(day)
        .bind(delta.items)
        .bind(delta.sensors)
        .bind(delta.bytes)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO tenant_usage_daily_scoped
                (tenant_id, organization_id, workspace_id, day,
                 items_count, sensors_count, bytes_ingested, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (tenant_id, organization_id, workspace_id, day) DO UPDATE SET
                items_count = tenant_usage_daily_scoped.items_count + EXCLUDED.items_count,
                sensors_count = tenant_usage_daily_scoped.sensors_count + EXCLUDED.sensors_count,
                bytes_ingested = tenant_usage_daily_scoped.bytes_ingested + EXCLUDED.bytes_ingested,
                updated_at = NOW()
            "#,
        )
        .bind(scope.tenant_id)
        .bind(scope.organization_id)
        .bind(scope.workspace_id)
        .bind(day)
        .bind(delta.items)
        .bind(delta.sensors)
        .bind(delta.bytes)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO telemetry_dead_letters
                (topic, partition, "offset", message_key, claim_check, error, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(&letter.topic)
        .bind(letter.partition)
        .bind(letter.offset)
        .bind(&letter.message_key)
        .bind(&letter.claim_check)
        .bind(&letter.error)
        .bind(&letter.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn tenant_quotas(&self) -> Result<Vec<TenantQuota>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                t.id AS tenant_id,
                tl.alert_delay_seconds::BIGINT AS tenant_delay_seconds,
                p.alert_delay_seconds::BIGINT AS plan_delay_seconds,
                COALESCE(tl.items_per_day, p.items_per_day)::BIGINT AS items_per_day,
                COALESCE(tl.sensors_per_day, p.sensors_per_day)::BIGINT AS sensors_per_day,
                COALESCE(tl.bytes_per_day, p.bytes_per_day)::BIGINT AS bytes_per_day
            FROM tenants t
            LEFT JOIN plans p ON p.code = t.plan_code
            LEFT JOIN tenant_limits tl ON tl.tenant_id = t.id
            WHERE t.status = 'active' OR t.id = 0
            ORDER BY t.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut quotas = rows
            .iter()
            .map(|row| {
                Ok(TenantQuota {
                    tenant_id: row.try_get("tenant_id")?,
                    tenant_delay_seconds: row.try_get("tenant_delay_seconds")?,
                    plan_delay_seconds: row.try_get("plan_delay_seconds")?,
                    items_per_day: row.try_get("items_per_day")?,
                    sensors_per_day: row.try_get("sensors_per_day")?,
                    bytes_per_day: row.try_get("bytes_per_day")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        if !quotas.iter().any(|quota| quota.tenant_id == 0) {
            quotas.insert(0, TenantQuota::default());
        }
        Ok(quotas)
    }

    async fn last_checked(&self, tenant_id: i32) -> Result<Option<DateTime<Utc>>, StoreError> {
        let value: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
            "SELECT last_checked_at FROM tenant_alert_state WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value.flatten())
    }

    async fn touch_last_checked(
        &self,
        tenant_id: i32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_alert_state (tenant_id, last_checked_at)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO UPDATE SET last_checked_at = EXCLUDED.last_checked_at
            "#,
        )
        .bind(tenant_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enabled_rules(&self, tenant_id: i32) -> Result<Vec<AlertRule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, organization_id, workspace_ids, threshold_percent, enabled
            FROM tenant_alert_rules
            WHERE tenant_id IN (0, $1) AND enabled = TRUE
            ORDER BY tenant_id, id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        let rules = rows
            .iter()
            .map(|row| {
                Ok(AlertRule {
                    id: row.try_get("id")?,
                    tenant_id: row.try_get("tenant_id")?,
                    organization_id: row.try_get("organization_id")?,
                    workspace_ids: row
                        .try_get::<Option<Vec<i32>>, _>("workspace_ids")?
                        .unwrap_or_default(),
                    threshold_percent: row.try_get("threshold_percent")?,
                    enabled: row.try_get("enabled")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(rules)
    }

    async fn usage_for(
        &self,
        tenant_id: i32,
        organization_id: i32,
        workspace_ids: &[i32],
        day: NaiveDate,
    ) -> Result<UsageCounts, StoreError> {
        let row = if is_tenant_wide(organization_id, workspace_ids) {
            sqlx::query(
                r#"
                SELECT items_count::BIGINT AS items, sensors_count::BIGINT AS sensors,
                       bytes_ingested::BIGINT AS bytes
                FROM tenant_usage_daily
                WHERE tenant_id = $1 AND day = $2
                "#,
            )
            .bind(tenant_id)
            .bind(day)
            .fetch_optional(&self.pool)
            .await?
        } else {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "SELECT COALESCE(SUM(items_count), 0)::BIGINT AS items, \
                 COALESCE(SUM(sensors_count), 0)::BIGINT AS sensors, \
                 COALESCE(SUM(bytes_ingested), 0)::BIGINT AS bytes \
                 FROM tenant_usage_daily_scoped WHERE tenant_id = ",
            );
            builder.push_bind(tenant_id);
            builder.push(" AND day = ");
            builder.push_bind(day);
            if organization_id != 0 {
                builder.push(" AND organization_id = ");
                builder.push_bind(organization_id);
            }
            if !workspace_ids.is_empty() && !workspace_ids.contains(&0) {
                builder.push(" AND workspace_id = ANY(");
                builder.push_bind(workspace_ids.to_vec());
                builder.push(")");
            }
            builder.build().fetch_optional(&self.pool).await?
        };

        let Some(row) = row else {
            return Ok(UsageCounts::default());
        };
        Ok(UsageCounts::new(
            row.try_get::<Option<i64>, _>("items")?.unwrap_or(0),
            row.try_get::<Option<i64>, _>("sensors")?.unwrap_or(0),
            row.try_get::<Option<i64>, _>("bytes")?.unwrap_or(0),
        ))
    }

    async fn create_alert(&self, alert: &NewAlert) -> Result<Option<i32>, StoreError> {
        let id: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO tenant_alerts (
                tenant_id, organization_id, workspace_id, alert_type, day, message, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(alert.scope.tenant_id)
        .bind(alert.scope.organization_id)
        .bind(alert.scope.workspace_id)
        .bind(&alert.alert_type)
        .bind(alert.day)
        .bind(&alert.message)
        .bind(Json(&alert.metadata))
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn enabled_webhooks(&self, tenant_id: i32) -> Result<Vec<Webhook>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, organization_id, workspace_ids, event_types, url, secret, enabled
            FROM tenant_webhooks
            WHERE tenant_id IN (0, $1) AND enabled = TRUE
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        let hooks = rows
            .iter()
            .map(|row| {
                Ok(Webhook {
                    id: row.try_get("id")?,
                    tenant_id: row.try_get("tenant_id")?,
                    organization_id: row.try_get("organization_id")?,
                    workspace_ids: row
                        .try_get::<Option<Vec<i32>>, _>("workspace_ids")?
                        .unwrap_or_default(),
                    event_types: row
                        .try_get::<Option<Vec<String>>, _>("event_types")?
                        .unwrap_or_default(),
                    url: row.try_get("url")?,
                    secret: row.try_get("secret")?,
                    enabled: row.try_get("enabled")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(hooks)
    }

    async fn create_delivery(
        &self,
        alert_id: i32,
        webhook_id: i32,
    ) -> Result<AlertDelivery, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO tenant_alert_delivery
                (alert_id, webhook_id, status, attempts, created_at, updated_at)
            VALUES ($1, $2, 'pending', 0, NOW(), NOW())
            RETURNING id, alert_id, webhook_id, status, attempts, last_error, next_retry_at
            "#,
        )
        .bind(alert_id)
        .bind(webhook_id)
        .fetch_one(&self.pool)
        .await?;
        delivery_from_row(&row)
    }

    async fn finish_delivery(
        &self,
        delivery_id: i32,
        outcome: &DeliveryOutcome,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tenant_alert_delivery
            SET status = $2,
                attempts = attempts + 1,
                last_error = $3,
                next_retry_at = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(delivery_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.last_error)
        .bind(outcome.next_retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Throwaway-schema helpers for the Postgres integration tests. They only run
/// with `WORKER_INTEGRATION_TEST=1` and `WORKER_TEST_DATABASE_URL` set.
#[cfg(test)]
pub(crate) mod test_support {
    use anyhow::Result;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::env;

    const SCHEMA: &[&str] = &[
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id integer primary key,
            status text not null default 'active',
            plan_code text null
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS plans (
            code text primary key,
            items_per_day bigint null,
            sensors_per_day bigint null,
            bytes_per_day bigint null,
            alert_delay_seconds integer null
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tenant_limits (
            tenant_id integer primary key,
            items_per_day bigint null,
            sensors_per_day bigint null,
            bytes_per_day bigint null,
            alert_delay_seconds integer null
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS equipments (
            id serial primary key,
            uuid varchar(36) not null,
            name varchar(200) not null,
            status varchar(20) not null default 'active',
            collection_interval integer not null default 60,
            siren_active boolean not null default false,
            siren_time integer not null default 120,
            tenant_id integer not null,
            organization_id integer not null,
            workspace_id integer not null,
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now(),
            unique (uuid, tenant_id, organization_id, workspace_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sensors (
            id serial primary key,
            uuid varchar(36) not null unique,
            name varchar(200) not null,
            type varchar(50) not null,
            unit varchar(20) null,
            status varchar(20) not null default 'active',
            equipment_id integer not null references equipments(id) on delete cascade,
            tenant_id integer not null,
            organization_id integer not null,
            workspace_id integer not null,
            manufacturer varchar(100) null,
            model varchar(100) null,
            firmware varchar(50) null,
            hardware_id varchar(100) null,
            via_hub boolean not null default false,
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS telemetry_data (
            id serial primary key,
            sensor_id integer not null references sensors(id) on delete cascade,
            equipment_id integer not null references equipments(id) on delete cascade,
            tenant_id integer not null,
            organization_id integer not null,
            workspace_id integer not null,
            value double precision null,
            status varchar(50) null,
            timestamp timestamptz not null,
            metadata jsonb null,
            created_at timestamptz not null default now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tenant_usage_daily (
            tenant_id integer not null,
            day date not null,
            items_count bigint not null default 0,
            sensors_count bigint not null default 0,
            bytes_ingested bigint not null default 0,
            updated_at timestamptz not null default now(),
            primary key (tenant_id, day)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tenant_usage_daily_scoped (
            tenant_id integer not null,
            organization_id integer not null,
            workspace_id integer not null,
            day date not null,
            items_count bigint not null default 0,
            sensors_count bigint not null default 0,
            bytes_ingested bigint not null default 0,
            updated_at timestamptz not null default now(),
            primary key (tenant_id, organization_id, workspace_id, day)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tenant_alert_rules (
            id serial primary key,
            tenant_id integer not null,
            organization_id integer not null default 0,
            workspace_ids integer[] not null default '{0}',
            threshold_percent integer not null,
            enabled boolean not null default true
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tenant_alerts (
            id serial primary key,
            tenant_id integer not null,
            organization_id integer not null default 0,
            workspace_id integer not null default 0,
            alert_type varchar(50) not null,
            day date not null,
            message text null,
            metadata jsonb null,
            created_at timestamptz not null default now(),
            resolved_at timestamptz null,
            unique (tenant_id, organization_id, workspace_id, alert_type, day)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tenant_webhooks (
            id serial primary key,
            tenant_id integer not null,
            organization_id integer not null default 0,
            workspace_ids integer[] not null default '{0}',
            event_types text[] not null default '{quota_80,quota_90,quota_100}',
            url text null,
            secret text null,
            enabled boolean not null default false
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tenant_alert_delivery (
            id serial primary key,
            alert_id integer not null references tenant_alerts(id) on delete cascade,
            webhook_id integer not null references tenant_webhooks(id) on delete cascade,
            status varchar(20) not null default 'pending',
            attempts integer not null default 0,
            last_error text null,
            next_retry_at timestamptz null,
            created_at timestamptz not null default now(),
            updated_at timestamptz not null default now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tenant_alert_state (
            tenant_id integer primary key,
            last_checked_at timestamptz null
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS telemetry_dead_letters (
            id serial primary key,
            topic text not null,
            partition integer not null,
            "offset" bigint not null,
            message_key text null,
            claim_check text null,
            error text not null,
            payload text not null,
            created_at timestamptz not null default now()
        )
        "#,
    ];

    pub fn integration_database_url() -> Option<String> {
        if env::var("WORKER_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return None;
        }
        env::var("WORKER_TEST_DATABASE_URL").ok()
    }

    pub async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(pool)
    }

    pub async fn drop_schema(database_url: &str, schema: &str) -> Result<()> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&admin_pool)
            .await;
        Ok(())
    }
}
