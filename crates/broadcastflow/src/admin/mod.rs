//! Operator controls: cancellation, tenant throughput, requeue, reports.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::campaigns::status::ACTIVE;
use crate::campaigns::{log_best_effort, CampaignJob, CampaignStatus, CampaignStore, LogLevel, RequeueScope};
use crate::channel::WorkChannel;
use crate::clock::Clock;
use crate::enqueuer::Enqueuer;
use crate::error::{AdminError, ValidationError};
use crate::speed::SpeedReport;

#[derive(Debug, Clone, Serialize)]
pub struct CancelReport {
    pub campaign_id: Uuid,
    pub previous_status: CampaignStatus,
    /// Queued work items dropped from the channel.
    pub purged_items: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub campaign: CampaignJob,
    /// Configured ceiling of the tenant, if any.
    pub messages_per_second: Option<u32>,
    /// Ceiling the dispatcher applies.
    pub effective_messages_per_second: u32,
    pub progress: SpeedReport,
}

pub struct Admin {
    store: Arc<dyn CampaignStore>,
    channel: Arc<dyn WorkChannel>,
    enqueuer: Arc<Enqueuer>,
    default_messages_per_second: u32,
    clock: Clock,
}

impl Admin {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        channel: Arc<dyn WorkChannel>,
        enqueuer: Arc<Enqueuer>,
        default_messages_per_second: u32,
    ) -> Self {
        Self {
            store,
            channel,
            enqueuer,
            default_messages_per_second,
            clock: Clock::new(),
        }
    }

    /// Stops a queued or running campaign. In-flight sends finish; items not
    /// yet started are skipped by the workers.
    pub async fn cancel_campaign(&self, campaign_id: Uuid) -> Result<CancelReport, AdminError> {
        let job = self
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or(AdminError::NotFound(campaign_id))?;
        if job.status.is_terminal() {
            return Err(AdminError::AlreadyFinished(job.status));
        }

        let cancelled = self
            .store
            .transition(
                campaign_id,
                &ACTIVE,
                CampaignStatus::Cancelled,
                Some("cancelled by operator"),
            )
            .await?;
        if !cancelled {
            let status = self
                .store
                .get_campaign(campaign_id)
                .await?
                .map(|j| j.status)
                .unwrap_or(job.status);
            return Err(AdminError::AlreadyFinished(status));
        }

        let purged_items = match self.channel.purge_campaign(campaign_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(%campaign_id, error = %e, "purging queued items failed; workers will skip them");
                0
            }
        };

        tracing::info!(%campaign_id, previous = %job.status, purged_items, "campaign cancelled");
        log_best_effort(
            self.store.as_ref(),
            campaign_id,
            LogLevel::Warn,
            "campaign cancelled",
            json!({
                "previous_status": job.status.as_str(),
                "purged_items": purged_items,
                "success_count": job.success_count,
                "error_count": job.error_count,
            }),
        )
        .await;

        Ok(CancelReport {
            campaign_id,
            previous_status: job.status,
            purged_items,
        })
    }

    /// Takes effect at the next rate-limit check of every worker.
    pub async fn set_messages_per_second(
        &self,
        tenant_id: Uuid,
        messages_per_second: i64,
    ) -> Result<u32, AdminError> {
        if messages_per_second < 1 {
            return Err(ValidationError::InvalidRate(messages_per_second).into());
        }
        let mps = u32::try_from(messages_per_second).unwrap_or(u32::MAX);
        self.store.set_tenant_rate(tenant_id, mps).await?;
        tracing::info!(%tenant_id, messages_per_second = mps, "tenant throughput updated");
        Ok(mps)
    }

    pub async fn requeue(
        &self,
        campaign_id: Uuid,
        scope: RequeueScope,
        template_override: Option<Uuid>,
    ) -> Result<CampaignJob, AdminError> {
        if self.store.get_campaign(campaign_id).await?.is_none() {
            return Err(AdminError::NotFound(campaign_id));
        }
        Ok(self
            .enqueuer
            .requeue(campaign_id, scope, template_override)
            .await?)
    }

    pub async fn campaign_report(&self, campaign_id: Uuid) -> Result<CampaignReport, AdminError> {
        let campaign = self
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or(AdminError::NotFound(campaign_id))?;
        let messages_per_second = self.store.tenant_rate(campaign.tenant_id).await?;
        let progress = SpeedReport::for_job(&campaign, self.clock.now());

        Ok(CampaignReport {
            effective_messages_per_second: messages_per_second
                .unwrap_or(self.default_messages_per_second),
            messages_per_second,
            progress,
            campaign,
        })
    }
}
