use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::campaigns::model::{
    CampaignJob, CampaignLog, CounterUpdate, DeliveryOutcome, DeliveryRecord, LogLevel,
    NewCampaign, Outcome, OutcomeRecord,
};
use crate::campaigns::status::CampaignStatus;
use crate::campaigns::store::CampaignStore;
use crate::clock::Clock;
use crate::error::InfraError;
use crate::{boxed, BoxFuture};

#[derive(Default)]
struct Inner {
    campaigns: HashMap<Uuid, CampaignJob>,
    created_order: Vec<Uuid>,
    deliveries: HashMap<Uuid, DeliveryRecord>,
    delivery_order: Vec<Uuid>,
    tenant_rates: HashMap<Uuid, u32>,
    logs: Vec<CampaignLog>,
    unavailable: bool,
}

/// Process-local campaign store. Timestamps come from the tokio clock.
#[derive(Default)]
pub struct MemoryCampaignStore {
    clock: Clock,
    inner: Mutex<Inner>,
}

impl MemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with [`InfraError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guard(&self) -> Result<MutexGuard<'_, Inner>, InfraError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(InfraError::Unavailable("campaign store"));
        }
        Ok(inner)
    }
}

impl CampaignStore for MemoryCampaignStore {
    fn create_campaign<'a>(
        &'a self,
        new: &'a NewCampaign,
    ) -> BoxFuture<'a, Result<CampaignJob, InfraError>> {
        boxed(async move {
            let mut inner = self.guard()?;
            let job = CampaignJob {
                id: Uuid::new_v4(),
                tenant_id: new.tenant_id,
                template_id: new.template_id,
                audience: new.audience.clone(),
                variable_mappings: new.variable_mappings.clone(),
                status: CampaignStatus::Queued,
                total_items: 0,
                success_count: 0,
                error_count: 0,
                failure_reason: None,
                requeue_of: new.requeue_of,
                created_at: self.clock.now(),
                started_at: None,
                completed_at: None,
            };
            inner.created_order.push(job.id);
            inner.campaigns.insert(job.id, job.clone());
            Ok(job)
        })
    }

    fn get_campaign<'a>(
        &'a self,
        id: Uuid,
    ) -> BoxFuture<'a, Result<Option<CampaignJob>, InfraError>> {
        boxed(async move { Ok(self.guard()?.campaigns.get(&id).cloned()) })
    }

    fn list_campaigns<'a>(
        &'a self,
        tenant_id: Option<Uuid>,
        limit: i64,
    ) -> BoxFuture<'a, Result<Vec<CampaignJob>, InfraError>> {
        boxed(async move {
            let inner = self.guard()?;
            let limit = limit.clamp(1, 500) as usize;
            Ok(inner
                .created_order
                .iter()
                .rev()
                .filter_map(|id| inner.campaigns.get(id))
                .filter(|job| tenant_id.map_or(true, |t| job.tenant_id == t))
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn set_total_items<'a>(&'a self, id: Uuid, total: i64) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(async move {
            let mut inner = self.guard()?;
            if let Some(job) = inner.campaigns.get_mut(&id) {
                job.total_items = total;
            }
            Ok(())
        })
    }

    fn transition<'a>(
        &'a self,
        id: Uuid,
        from: &'a [CampaignStatus],
        to: CampaignStatus,
        reason: Option<&'a str>,
    ) -> BoxFuture<'a, Result<bool, InfraError>> {
        boxed(async move {
            let now = self.clock.now();
            let mut inner = self.guard()?;
            let Some(job) = inner.campaigns.get_mut(&id) else {
                return Ok(false);
            };
            if !from.contains(&job.status) || !job.status.can_transition_to(to) {
                return Ok(false);
            }

            job.status = to;
            if to.is_terminal() && job.completed_at.is_none() {
                job.completed_at = Some(now);
            }
            if let Some(reason) = reason {
                job.failure_reason = Some(reason.to_string());
            }
            Ok(true)
        })
    }

    fn record_outcome<'a>(
        &'a self,
        record: &'a OutcomeRecord,
    ) -> BoxFuture<'a, Result<Option<CounterUpdate>, InfraError>> {
        boxed(async move {
            let now = self.clock.now();
            let mut inner = self.guard()?;
            if inner.deliveries.contains_key(&record.item.id) {
                return Ok(None);
            }
            let Some(job) = inner.campaigns.get_mut(&record.item.campaign_id) else {
                return Ok(None);
            };

            match record.outcome {
                Outcome::Sent { .. } => job.success_count += 1,
                Outcome::Failed { .. } => job.error_count += 1,
            }
            if job.started_at.is_none() {
                job.started_at = Some(now);
            }
            if job.status == CampaignStatus::Queued {
                job.status = CampaignStatus::Processing;
            }

            let update = CounterUpdate {
                campaign_id: job.id,
                status: job.status,
                total_items: job.total_items,
                success_count: job.success_count,
                error_count: job.error_count,
            };

            inner
                .deliveries
                .insert(record.item.id, DeliveryRecord::from_outcome(record, now));
            inner.delivery_order.push(record.item.id);
            Ok(Some(update))
        })
    }

    fn is_settled<'a>(&'a self, work_item_id: Uuid) -> BoxFuture<'a, Result<bool, InfraError>> {
        boxed(async move { Ok(self.guard()?.deliveries.contains_key(&work_item_id)) })
    }

    fn tenant_rate<'a>(&'a self, tenant_id: Uuid) -> BoxFuture<'a, Result<Option<u32>, InfraError>> {
        boxed(async move { Ok(self.guard()?.tenant_rates.get(&tenant_id).copied()) })
    }

    fn set_tenant_rate<'a>(
        &'a self,
        tenant_id: Uuid,
        messages_per_second: u32,
    ) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(async move {
            self.guard()?
                .tenant_rates
                .insert(tenant_id, messages_per_second);
            Ok(())
        })
    }

    fn list_deliveries<'a>(
        &'a self,
        campaign_id: Uuid,
        outcome: Option<DeliveryOutcome>,
        limit: i64,
    ) -> BoxFuture<'a, Result<Vec<DeliveryRecord>, InfraError>> {
        boxed(async move {
            let inner = self.guard()?;
            Ok(inner
                .delivery_order
                .iter()
                .rev()
                .filter_map(|id| inner.deliveries.get(id))
                .filter(|d| d.campaign_id == campaign_id)
                .filter(|d| outcome.map_or(true, |o| d.outcome == o))
                .take(limit.max(0) as usize)
                .cloned()
                .collect())
        })
    }

    fn append_log<'a>(
        &'a self,
        campaign_id: Uuid,
        level: LogLevel,
        message: &'a str,
        details: Value,
    ) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(async move {
            let created_at = self.clock.now();
            self.guard()?.logs.push(CampaignLog {
                id: Uuid::new_v4(),
                campaign_id,
                level: level.as_str().to_string(),
                message: message.to_string(),
                details_json: details,
                created_at,
            });
            Ok(())
        })
    }

    fn list_logs<'a>(
        &'a self,
        campaign_id: Uuid,
    ) -> BoxFuture<'a, Result<Vec<CampaignLog>, InfraError>> {
        boxed(async move {
            Ok(self
                .guard()?
                .logs
                .iter()
                .filter(|l| l.campaign_id == campaign_id)
                .cloned()
                .collect())
        })
    }
}
