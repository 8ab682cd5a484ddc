use serde_json::Value;
use uuid::Uuid;

use crate::campaigns::model::{
    CampaignJob, CampaignLog, CounterUpdate, DeliveryOutcome, DeliveryRecord, LogLevel,
    NewCampaign, OutcomeRecord,
};
use crate::campaigns::status::CampaignStatus;
use crate::error::InfraError;
use crate::BoxFuture;

/// Persisted campaign records. Counters are only ever changed by
/// [`CampaignStore::record_outcome`]; status only by [`CampaignStore::transition`].
pub trait CampaignStore: Send + Sync {
    fn create_campaign<'a>(
        &'a self,
        new: &'a NewCampaign,
    ) -> BoxFuture<'a, Result<CampaignJob, InfraError>>;

    fn get_campaign<'a>(&'a self, id: Uuid)
        -> BoxFuture<'a, Result<Option<CampaignJob>, InfraError>>;

    /// Newest first.
    fn list_campaigns<'a>(
        &'a self,
        tenant_id: Option<Uuid>,
        limit: i64,
    ) -> BoxFuture<'a, Result<Vec<CampaignJob>, InfraError>>;

    fn set_total_items<'a>(&'a self, id: Uuid, total: i64) -> BoxFuture<'a, Result<(), InfraError>>;

    /// Guarded transition: applies only when the current status is in `from`
    /// and the edge exists in the state machine. Entering a terminal status
    /// stamps `completed_at`. Returns whether the transition happened.
    fn transition<'a>(
        &'a self,
        id: Uuid,
        from: &'a [CampaignStatus],
        to: CampaignStatus,
        reason: Option<&'a str>,
    ) -> BoxFuture<'a, Result<bool, InfraError>>;

    /// Idempotent per work item. The first call stores a delivery record and
    /// increments exactly one counter atomically; later calls return `None`.
    fn record_outcome<'a>(
        &'a self,
        record: &'a OutcomeRecord,
    ) -> BoxFuture<'a, Result<Option<CounterUpdate>, InfraError>>;

    fn is_settled<'a>(&'a self, work_item_id: Uuid) -> BoxFuture<'a, Result<bool, InfraError>>;

    fn tenant_rate<'a>(&'a self, tenant_id: Uuid) -> BoxFuture<'a, Result<Option<u32>, InfraError>>;

    fn set_tenant_rate<'a>(
        &'a self,
        tenant_id: Uuid,
        messages_per_second: u32,
    ) -> BoxFuture<'a, Result<(), InfraError>>;

    fn list_deliveries<'a>(
        &'a self,
        campaign_id: Uuid,
        outcome: Option<DeliveryOutcome>,
        limit: i64,
    ) -> BoxFuture<'a, Result<Vec<DeliveryRecord>, InfraError>>;

    fn append_log<'a>(
        &'a self,
        campaign_id: Uuid,
        level: LogLevel,
        message: &'a str,
        details: Value,
    ) -> BoxFuture<'a, Result<(), InfraError>>;

    fn list_logs<'a>(&'a self, campaign_id: Uuid)
        -> BoxFuture<'a, Result<Vec<CampaignLog>, InfraError>>;
}

/// Writes an operator log line; a failure is traced and otherwise ignored.
pub async fn log_best_effort(
    store: &dyn CampaignStore,
    campaign_id: Uuid,
    level: LogLevel,
    message: &str,
    details: Value,
) {
    if let Err(e) = store.append_log(campaign_id, level, message, details).await {
        tracing::warn!(%campaign_id, error = %e, "failed to write campaign log");
    }
}

/// Moves a fully accounted-for campaign into the terminal status its counters
/// imply. Returns the status when this call performed the transition.
pub async fn finalize_if_accounted(
    store: &dyn CampaignStore,
    update: &CounterUpdate,
) -> Result<Option<CampaignStatus>, InfraError> {
    if !update.is_accounted_for() || update.status != CampaignStatus::Processing {
        return Ok(None);
    }

    let terminal = CampaignStatus::terminal_for(update.success_count, update.error_count);
    let applied = store
        .transition(
            update.campaign_id,
            &[CampaignStatus::Processing],
            terminal,
            None,
        )
        .await?;

    Ok(applied.then_some(terminal))
}

/// Current counters of a campaign in [`CounterUpdate`] form.
pub async fn current_counters(
    store: &dyn CampaignStore,
    campaign_id: Uuid,
) -> Result<Option<CounterUpdate>, InfraError> {
    Ok(store
        .get_campaign(campaign_id)
        .await?
        .map(|job| CounterUpdate {
            campaign_id: job.id,
            status: job.status,
            total_items: job.total_items,
            success_count: job.success_count,
            error_count: job.error_count,
        }))
}
