use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::campaigns::model::{
    AudienceSpec, CampaignJob, CampaignLog, CounterUpdate, DeliveryOutcome, DeliveryRecord,
    LogLevel, NewCampaign, Outcome, OutcomeRecord, Variables, VariableMapping,
};
use crate::campaigns::status::CampaignStatus;
use crate::campaigns::store::CampaignStore;
use crate::error::InfraError;
use crate::{boxed, BoxFuture};

#[derive(Debug, sqlx::FromRow)]
struct CampaignRow {
    id: Uuid,
    tenant_id: Uuid,
    template_id: Uuid,
    audience_json: Value,
    variable_mappings: Value,
    status: String,
    total_items: i64,
    success_count: i64,
    error_count: i64,
    failure_reason: Option<String>,
    requeue_of: Option<Uuid>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<CampaignRow> for CampaignJob {
    type Error = InfraError;

    fn try_from(row: CampaignRow) -> Result<Self, Self::Error> {
        let status = CampaignStatus::parse(&row.status)
            .ok_or_else(|| InfraError::Corrupt(format!("campaign status {:?}", row.status)))?;
        let audience: AudienceSpec = serde_json::from_value(row.audience_json)?;
        let variable_mappings: Vec<VariableMapping> = serde_json::from_value(row.variable_mappings)?;

        Ok(CampaignJob {
            id: row.id,
            tenant_id: row.tenant_id,
            template_id: row.template_id,
            audience,
            variable_mappings,
            status,
            total_items: row.total_items,
            success_count: row.success_count,
            error_count: row.error_count,
            failure_reason: row.failure_reason,
            requeue_of: row.requeue_of,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    work_item_id: Uuid,
    campaign_id: Uuid,
    recipient_id: Uuid,
    channel_address: String,
    variables: Value,
    outcome: String,
    provider_message_id: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    attempt: i32,
    worker_id: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for DeliveryRecord {
    type Error = InfraError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let outcome = DeliveryOutcome::parse(&row.outcome)
            .ok_or_else(|| InfraError::Corrupt(format!("delivery outcome {:?}", row.outcome)))?;
        let variables: Variables = serde_json::from_value(row.variables)?;

        Ok(DeliveryRecord {
            work_item_id: row.work_item_id,
            campaign_id: row.campaign_id,
            recipient_id: row.recipient_id,
            channel_address: row.channel_address,
            variables,
            outcome,
            provider_message_id: row.provider_message_id,
            error_code: row.error_code,
            error_message: row.error_message,
            attempt: row.attempt,
            worker_id: row.worker_id,
            created_at: row.created_at,
        })
    }
}

const CAMPAIGN_COLUMNS: &str = r#"
    id, tenant_id, template_id, audience_json, variable_mappings, status,
    total_items, success_count, error_count, failure_reason, requeue_of,
    created_at, started_at, completed_at
"#;

#[derive(Clone)]
pub struct PgCampaignStore {
    pool: PgPool,
}

impl PgCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ----------------------------
    // Campaign records
    // ----------------------------

    pub async fn create(&self, new: &NewCampaign) -> Result<CampaignJob, InfraError> {
        let sql = format!(
            r#"
            INSERT INTO campaigns (id, tenant_id, template_id, audience_json, variable_mappings, status, requeue_of)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {CAMPAIGN_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, CampaignRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.tenant_id)
            .bind(new.template_id)
            .bind(serde_json::to_value(&new.audience)?)
            .bind(serde_json::to_value(&new.variable_mappings)?)
            .bind(CampaignStatus::Queued.as_str())
            .bind(new.requeue_of)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<CampaignJob>, InfraError> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1");
        let row = sqlx::query_as::<_, CampaignRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(CampaignJob::try_from).transpose()
    }

    /// Newest first; limit is clamped to [1, 500].
    pub async fn list(
        &self,
        tenant_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CampaignJob>, InfraError> {
        let limit = limit.clamp(1, 500);
        let sql = format!(
            r#"
            SELECT {CAMPAIGN_COLUMNS}
            FROM campaigns
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        );

        let rows = sqlx::query_as::<_, CampaignRow>(&sql)
            .bind(tenant_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(CampaignJob::try_from).collect()
    }

    pub async fn update_total_items(&self, id: Uuid, total: i64) -> Result<(), InfraError> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET total_items = $2,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    pub async fn apply_transition(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
        reason: Option<&str>,
    ) -> Result<bool, InfraError> {
        let allowed: Vec<String> = from
            .iter()
            .filter(|s| s.can_transition_to(to))
            .map(|s| s.as_str().to_string())
            .collect();
        if allowed.is_empty() {
            return Ok(false);
        }

        let res = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $2,
                failure_reason = COALESCE($3, failure_reason),
                completed_at = CASE WHEN $4 THEN COALESCE(completed_at, now()) ELSE completed_at END,
                updated_at = now()
            WHERE id = $1
              AND status = ANY($5)
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(reason)
        .bind(to.is_terminal())
        .bind(&allowed)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// One transaction: the delivery row claims the work item, and only the
    /// claiming call moves a counter.
    pub async fn apply_outcome(
        &self,
        record: &OutcomeRecord,
    ) -> Result<Option<CounterUpdate>, InfraError> {
        let delivery = DeliveryRecord::from_outcome(record, Utc::now());
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO deliveries (
                work_item_id, campaign_id, recipient_id, channel_address, variables,
                outcome, provider_message_id, error_code, error_message, attempt, worker_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (work_item_id) DO NOTHING
            "#,
        )
        .bind(delivery.work_item_id)
        .bind(delivery.campaign_id)
        .bind(delivery.recipient_id)
        .bind(&delivery.channel_address)
        .bind(serde_json::to_value(&delivery.variables)?)
        .bind(delivery.outcome.as_str())
        .bind(&delivery.provider_message_id)
        .bind(&delivery.error_code)
        .bind(&delivery.error_message)
        .bind(delivery.attempt)
        .bind(&delivery.worker_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let (success_inc, error_inc) = match record.outcome {
            Outcome::Sent { .. } => (1_i64, 0_i64),
            Outcome::Failed { .. } => (0, 1),
        };

        let row = sqlx::query_as::<_, (Uuid, String, i64, i64, i64)>(
            r#"
            UPDATE campaigns
            SET success_count = success_count + $2,
                error_count = error_count + $3,
                started_at = COALESCE(started_at, now()),
                status = CASE WHEN status = 'queued' THEN 'processing' ELSE status END,
                updated_at = now()
            WHERE id = $1
            RETURNING id, status, total_items, success_count, error_count
            "#,
        )
        .bind(record.item.campaign_id)
        .bind(success_inc)
        .bind(error_inc)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        let Some((campaign_id, status, total_items, success_count, error_count)) = row else {
            return Ok(None);
        };
        let status = CampaignStatus::parse(&status)
            .ok_or_else(|| InfraError::Corrupt(format!("campaign status {status:?}")))?;

        Ok(Some(CounterUpdate {
            campaign_id,
            status,
            total_items,
            success_count,
            error_count,
        }))
    }

    pub async fn delivery_exists(&self, work_item_id: Uuid) -> Result<bool, InfraError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM deliveries WHERE work_item_id = $1)")
                .bind(work_item_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    pub async fn deliveries(
        &self,
        campaign_id: Uuid,
        outcome: Option<DeliveryOutcome>,
        limit: i64,
    ) -> Result<Vec<DeliveryRecord>, InfraError> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT work_item_id, campaign_id, recipient_id, channel_address, variables,
                   outcome, provider_message_id, error_code, error_message,
                   attempt, worker_id, created_at
            FROM deliveries
            WHERE campaign_id = $1
              AND ($2::text IS NULL OR outcome = $2)
            ORDER BY created_at DESC, work_item_id
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(outcome.map(|o| o.as_str()))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeliveryRecord::try_from).collect()
    }

    // ----------------------------
    // Tenant settings
    // ----------------------------

    pub async fn messages_per_second(&self, tenant_id: Uuid) -> Result<Option<u32>, InfraError> {
        let mps: Option<Option<i32>> =
            sqlx::query_scalar("SELECT messages_per_second FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(mps.flatten().and_then(|v| u32::try_from(v).ok()))
    }

    pub async fn update_messages_per_second(
        &self,
        tenant_id: Uuid,
        messages_per_second: u32,
    ) -> Result<(), InfraError> {
        let mps = i32::try_from(messages_per_second).unwrap_or(i32::MAX);
        sqlx::query(
            r#"
            INSERT INTO tenants (id, messages_per_second)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
            SET messages_per_second = EXCLUDED.messages_per_second,
                updated_at = now()
            "#,
        )
        .bind(tenant_id)
        .bind(mps)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----------------------------
    // Operator log
    // ----------------------------

    pub async fn insert_log(
        &self,
        campaign_id: Uuid,
        level: LogLevel,
        message: &str,
        details: Value,
    ) -> Result<(), InfraError> {
        sqlx::query(
            r#"
            INSERT INTO campaign_logs (id, campaign_id, level, message, details_json)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(campaign_id)
        .bind(level.as_str())
        .bind(message)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn logs(&self, campaign_id: Uuid) -> Result<Vec<CampaignLog>, InfraError> {
        let logs = sqlx::query_as::<_, CampaignLog>(
            r#"
            SELECT id, campaign_id, level, message, details_json, created_at
            FROM campaign_logs
            WHERE campaign_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }
}

impl CampaignStore for PgCampaignStore {
    fn create_campaign<'a>(
        &'a self,
        new: &'a NewCampaign,
    ) -> BoxFuture<'a, Result<CampaignJob, InfraError>> {
        boxed(self.create(new))
    }

    fn get_campaign<'a>(
        &'a self,
        id: Uuid,
    ) -> BoxFuture<'a, Result<Option<CampaignJob>, InfraError>> {
        boxed(self.get(id))
    }

    fn list_campaigns<'a>(
        &'a self,
        tenant_id: Option<Uuid>,
        limit: i64,
    ) -> BoxFuture<'a, Result<Vec<CampaignJob>, InfraError>> {
        boxed(self.list(tenant_id, limit))
    }

    fn set_total_items<'a>(&'a self, id: Uuid, total: i64) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(self.update_total_items(id, total))
    }

    fn transition<'a>(
        &'a self,
        id: Uuid,
        from: &'a [CampaignStatus],
        to: CampaignStatus,
        reason: Option<&'a str>,
    ) -> BoxFuture<'a, Result<bool, InfraError>> {
        boxed(self.apply_transition(id, from, to, reason))
    }

    fn record_outcome<'a>(
        &'a self,
        record: &'a OutcomeRecord,
    ) -> BoxFuture<'a, Result<Option<CounterUpdate>, InfraError>> {
        boxed(self.apply_outcome(record))
    }

    fn is_settled<'a>(&'a self, work_item_id: Uuid) -> BoxFuture<'a, Result<bool, InfraError>> {
        boxed(self.delivery_exists(work_item_id))
    }

    fn tenant_rate<'a>(&'a self, tenant_id: Uuid) -> BoxFuture<'a, Result<Option<u32>, InfraError>> {
        boxed(self.messages_per_second(tenant_id))
    }

    fn set_tenant_rate<'a>(
        &'a self,
        tenant_id: Uuid,
        messages_per_second: u32,
    ) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(self.update_messages_per_second(tenant_id, messages_per_second))
    }

    fn list_deliveries<'a>(
        &'a self,
        campaign_id: Uuid,
        outcome: Option<DeliveryOutcome>,
        limit: i64,
    ) -> BoxFuture<'a, Result<Vec<DeliveryRecord>, InfraError>> {
        boxed(self.deliveries(campaign_id, outcome, limit))
    }

    fn append_log<'a>(
        &'a self,
        campaign_id: Uuid,
        level: LogLevel,
        message: &'a str,
        details: Value,
    ) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(self.insert_log(campaign_id, level, message, details))
    }

    fn list_logs<'a>(
        &'a self,
        campaign_id: Uuid,
    ) -> BoxFuture<'a, Result<Vec<CampaignLog>, InfraError>> {
        boxed(self.logs(campaign_id))
    }
}
