use std::time::Duration;
use uuid::Uuid;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use super::{Delivery, PartitionKey, WorkChannel};
use crate::campaigns::{Variables, WorkItem};
use crate::error::InfraError;
use crate::{boxed, BoxFuture};

#[derive(Debug, sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    partition: i32,
    campaign_id: Uuid,
    tenant_id: Uuid,
    recipient_id: Uuid,
    channel_address: String,
    template_id: Uuid,
    variables: Value,
    attempt: i32,
    locked_by: Option<String>,
}

impl WorkItemRow {
    fn into_delivery(self) -> Result<Delivery, InfraError> {
        let variables: Variables = serde_json::from_value(self.variables)?;
        let partition = u32::try_from(self.partition)
            .map_err(|_| InfraError::Corrupt(format!("partition {}", self.partition)))?;

        Ok(Delivery {
            item: WorkItem {
                id: self.id,
                campaign_id: self.campaign_id,
                tenant_id: self.tenant_id,
                recipient_id: self.recipient_id,
                channel_address: self.channel_address,
                template_id: self.template_id,
                variables,
                attempt: self.attempt,
            },
            partition,
            worker_id: self.locked_by.unwrap_or_default(),
        })
    }
}

/// `work_items` table as a partitioned channel. One topic per table slice.
#[derive(Clone)]
pub struct PgChannel {
    pool: PgPool,
    topic: String,
    partitions: u32,
    key: PartitionKey,
    lease: Duration,
}

impl PgChannel {
    pub fn new(
        pool: PgPool,
        topic: impl Into<String>,
        partitions: u32,
        key: PartitionKey,
        lease: Duration,
    ) -> Self {
        Self {
            pool,
            topic: topic.into(),
            partitions: partitions.max(1),
            key,
            lease,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    // ----------------------------
    // Producer side
    // ----------------------------

    pub async fn publish_batch(&self, items: &[WorkItem]) -> Result<(), InfraError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(items.len());
        let mut partitions = Vec::with_capacity(items.len());
        let mut campaign_ids = Vec::with_capacity(items.len());
        let mut tenant_ids = Vec::with_capacity(items.len());
        let mut recipient_ids = Vec::with_capacity(items.len());
        let mut addresses = Vec::with_capacity(items.len());
        let mut template_ids = Vec::with_capacity(items.len());
        let mut variables = Vec::with_capacity(items.len());
        let mut attempts = Vec::with_capacity(items.len());

        for item in items {
            ids.push(item.id);
            partitions.push(self.key.partition_of(item, self.partitions) as i32);
            campaign_ids.push(item.campaign_id);
            tenant_ids.push(item.tenant_id);
            recipient_ids.push(item.recipient_id);
            addresses.push(item.channel_address.clone());
            template_ids.push(item.template_id);
            variables.push(serde_json::to_value(&item.variables)?);
            attempts.push(item.attempt);
        }

        // UNNEST keeps input order, so seq follows publish order.
        sqlx::query(
            r#"
            INSERT INTO work_items (
                id, topic, partition, campaign_id, tenant_id, recipient_id,
                channel_address, template_id, variables, attempt
            )
            SELECT id, $1, partition, campaign_id, tenant_id, recipient_id,
                   channel_address, template_id, variables, attempt
            FROM UNNEST(
                $2::uuid[], $3::int[], $4::uuid[], $5::uuid[], $6::uuid[],
                $7::text[], $8::uuid[], $9::jsonb[], $10::int[]
            ) AS t(id, partition, campaign_id, tenant_id, recipient_id,
                   channel_address, template_id, variables, attempt)
            "#,
        )
        .bind(&self.topic)
        .bind(&ids)
        .bind(&partitions)
        .bind(&campaign_ids)
        .bind(&tenant_ids)
        .bind(&recipient_ids)
        .bind(&addresses)
        .bind(&template_ids)
        .bind(&variables)
        .bind(&attempts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----------------------------
    // Leasing
    // ----------------------------

    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED, so two workers never
    /// lease the same row.
    pub async fn lease_one(
        &self,
        partitions: &[u32],
        worker_id: &str,
    ) -> Result<Option<Delivery>, InfraError> {
        let partitions: Vec<i32> = partitions.iter().map(|p| *p as i32).collect();
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);

        let mut tx = self.pool.begin().await?;

        let candidate: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM work_items
            WHERE topic = $1
              AND partition = ANY($2)
              AND status = 'queued'
              AND run_at <= now()
            ORDER BY seq ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(&self.topic)
        .bind(&partitions)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let leased = sqlx::query_as::<_, WorkItemRow>(
            r#"
            UPDATE work_items
            SET status = 'leased',
                locked_by = $2,
                locked_at = now(),
                lock_expires_at = now() + ($3::bigint * interval '1 millisecond'),
                updated_at = now()
            WHERE id = $1
            RETURNING id, partition, campaign_id, tenant_id, recipient_id,
                      channel_address, template_id, variables, attempt, locked_by
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(lease_ms)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        leased.into_delivery().map(Some)
    }

    pub async fn mark_acked(&self, delivery: &Delivery) -> Result<bool, InfraError> {
        let res = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'acked',
                locked_at = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'leased'
              AND locked_by = $2
            "#,
        )
        .bind(delivery.item.id)
        .bind(&delivery.worker_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn reschedule(&self, delivery: &Delivery, delay: Duration) -> Result<(), InfraError> {
        let next_run_at: DateTime<Utc> =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'queued',
                attempt = attempt + 1,
                run_at = $3,
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'leased'
              AND locked_by = $2
            "#,
        )
        .bind(delivery.item.id)
        .bind(&delivery.worker_id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----------------------------
    // Maintenance
    // ----------------------------

    pub async fn reap_expired_leases(&self) -> Result<u64, InfraError> {
        let res = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'queued',
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE topic = $1
              AND status = 'leased'
              AND lock_expires_at IS NOT NULL
              AND lock_expires_at < now()
            "#,
        )
        .bind(&self.topic)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    pub async fn delete_queued(&self, campaign_id: Uuid) -> Result<u64, InfraError> {
        let res = sqlx::query(
            r#"
            DELETE FROM work_items
            WHERE campaign_id = $1
              AND status = 'queued'
            "#,
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    /// Deletes acknowledged items older than `retention`.
    pub async fn prune_acked(&self, retention: Duration) -> Result<u64, InfraError> {
        let retention_secs = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let res = sqlx::query(
            r#"
            DELETE FROM work_items
            WHERE topic = $1
              AND status = 'acked'
              AND updated_at < now() - ($2::bigint * interval '1 second')
            "#,
        )
        .bind(&self.topic)
        .bind(retention_secs)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

impl WorkChannel for PgChannel {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    fn publish<'a>(&'a self, items: &'a [WorkItem]) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(self.publish_batch(items))
    }

    fn claim<'a>(
        &'a self,
        partitions: &'a [u32],
        worker_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Delivery>, InfraError>> {
        boxed(self.lease_one(partitions, worker_id))
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<bool, InfraError>> {
        boxed(self.mark_acked(delivery))
    }

    fn retry_later<'a>(
        &'a self,
        delivery: &'a Delivery,
        delay: Duration,
    ) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(self.reschedule(delivery, delay))
    }

    fn reclaim_expired<'a>(&'a self) -> BoxFuture<'a, Result<u64, InfraError>> {
        boxed(self.reap_expired_leases())
    }

    fn purge_campaign<'a>(&'a self, campaign_id: Uuid) -> BoxFuture<'a, Result<u64, InfraError>> {
        boxed(self.delete_queued(campaign_id))
    }
}
