//! The dispatch loop: claim, throttle, send, classify, count, acknowledge.

pub mod pool;
pub mod retry;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::campaigns::{
    finalize_if_accounted, log_best_effort, CampaignStatus, CampaignStore, LogLevel, Outcome,
    OutcomeRecord,
};
use crate::channel::{Delivery, WorkChannel};
use crate::error::InfraError;
use crate::gateway::{ErrorClass, Gateway, GatewayError, GatewayErrorKind, SendRequest};
use crate::ratelimit::{tenant_messages_key, RateLimiter};
use retry::{next_delay, RetryConfig};

pub use pool::WorkerPool;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Total tries for transient gateway failures, first send included.
    pub max_attempts: i32,
    /// Ceiling for tenants without a configured messages-per-second.
    pub default_messages_per_second: u32,
    pub send_timeout: Duration,
    pub rate_window: Duration,
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_messages_per_second: 80,
            send_timeout: Duration::from_millis(20_000),
            rate_window: Duration::from_millis(1000),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CampaignMissing,
    Cancelled,
    Finished(CampaignStatus),
    AlreadySettled,
}

/// What one [`Dispatcher::process_one`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing runnable in the owned partitions.
    Idle,
    Sent {
        campaign_id: Uuid,
        finalized: Option<CampaignStatus>,
    },
    Failed {
        campaign_id: Uuid,
        kind: GatewayErrorKind,
        finalized: Option<CampaignStatus>,
    },
    /// Transient failure; the item went back to its partition.
    Retrying {
        campaign_id: Uuid,
        attempt: i32,
        delay: Duration,
    },
    /// Acknowledged without a gateway call and without touching counters.
    Skipped { campaign_id: Uuid, reason: SkipReason },
    /// The outcome had already been recorded by an earlier delivery.
    Duplicate { campaign_id: Uuid },
}

enum Gate {
    Open,
    Closed(SkipReason),
}

/// One dispatch loop body. Shared by all loops of a worker process.
pub struct Dispatcher {
    channel: Arc<dyn WorkChannel>,
    store: Arc<dyn CampaignStore>,
    limiter: Arc<dyn RateLimiter>,
    gateway: Arc<dyn Gateway>,
    cfg: DispatchConfig,
    worker_id: String,
    partitions: Vec<u32>,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<dyn WorkChannel>,
        store: Arc<dyn CampaignStore>,
        limiter: Arc<dyn RateLimiter>,
        gateway: Arc<dyn Gateway>,
        cfg: DispatchConfig,
        worker_id: impl Into<String>,
        partitions: Vec<u32>,
    ) -> Self {
        Self {
            channel,
            store,
            limiter,
            gateway,
            cfg,
            worker_id: worker_id.into(),
            partitions,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn partitions(&self) -> &[u32] {
        &self.partitions
    }

    pub fn channel(&self) -> &Arc<dyn WorkChannel> {
        &self.channel
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    /// Claims and fully handles at most one work item.
    ///
    /// Infrastructure errors leave the item leased; it is redelivered once
    /// the lease expires.
    pub async fn process_one(&self) -> Result<DispatchOutcome, InfraError> {
        let Some(delivery) = self.channel.claim(&self.partitions, &self.worker_id).await? else {
            return Ok(DispatchOutcome::Idle);
        };
        let campaign_id = delivery.item.campaign_id;

        if self.store.is_settled(delivery.item.id).await? {
            self.ack(&delivery).await?;
            tracing::debug!(
                %campaign_id,
                work_item_id = %delivery.item.id,
                "redelivered item already settled"
            );
            return Ok(DispatchOutcome::Skipped {
                campaign_id,
                reason: SkipReason::AlreadySettled,
            });
        }

        if let Gate::Closed(reason) = self.throttle(&delivery).await? {
            self.ack(&delivery).await?;
            tracing::debug!(%campaign_id, ?reason, "skipped work item");
            return Ok(DispatchOutcome::Skipped {
                campaign_id,
                reason,
            });
        }

        let request = SendRequest::for_item(&delivery.item);
        let result = match tokio::time::timeout(self.cfg.send_timeout, self.gateway.send(&request)).await
        {
            Ok(res) => res,
            Err(_) => Err(GatewayError::new(
                GatewayErrorKind::Timeout,
                format!("no response within {:?}", self.cfg.send_timeout),
            )),
        };

        let outcome = match result {
            Ok(receipt) => Outcome::Sent {
                provider_message_id: receipt.provider_message_id,
            },
            // Item stays leased and uncounted; redelivered after the lease expires.
            Err(err) if err.kind.class() == ErrorClass::Infrastructure => {
                tracing::error!(
                    alert = true,
                    %campaign_id,
                    work_item_id = %delivery.item.id,
                    worker_id = %self.worker_id,
                    error = %err,
                    "gateway dependency unreachable"
                );
                return Err(InfraError::Unavailable("gateway dependency"));
            }
            Err(err) if err.kind.is_transient() && delivery.item.attempt < self.cfg.max_attempts => {
                let delay = next_delay(delivery.item.attempt, &self.cfg.retry, &mut rand::thread_rng());
                self.channel.retry_later(&delivery, delay).await?;
                tracing::warn!(
                    %campaign_id,
                    worker_id = %self.worker_id,
                    attempt = delivery.item.attempt,
                    code = err.kind.as_str(),
                    error = %err.message,
                    delay_ms = delay.as_millis() as u64,
                    "transient gateway error, retrying"
                );
                return Ok(DispatchOutcome::Retrying {
                    campaign_id,
                    attempt: delivery.item.attempt + 1,
                    delay,
                });
            }
            Err(err) => {
                tracing::warn!(
                    %campaign_id,
                    worker_id = %self.worker_id,
                    attempt = delivery.item.attempt,
                    code = err.kind.as_str(),
                    error = %err.message,
                    "send failed"
                );
                Outcome::Failed {
                    error_code: err.kind.as_str().to_string(),
                    error_message: err.message,
                }
            }
        };

        let failed_kind = match &outcome {
            Outcome::Failed { error_code, .. } => GatewayErrorKind::parse(error_code),
            Outcome::Sent { .. } => None,
        };

        let record = OutcomeRecord {
            item: delivery.item.clone(),
            outcome,
            worker_id: self.worker_id.clone(),
        };

        let Some(update) = self.store.record_outcome(&record).await? else {
            self.ack(&delivery).await?;
            return Ok(DispatchOutcome::Duplicate { campaign_id });
        };

        let finalized = finalize_if_accounted(self.store.as_ref(), &update).await?;
        if let Some(status) = finalized {
            tracing::info!(
                %campaign_id,
                status = %status,
                success = update.success_count,
                errors = update.error_count,
                "campaign finished"
            );
            log_best_effort(
                self.store.as_ref(),
                campaign_id,
                LogLevel::Info,
                "campaign finished",
                json!({
                    "status": status.as_str(),
                    "success_count": update.success_count,
                    "error_count": update.error_count,
                    "total_items": update.total_items,
                }),
            )
            .await;
        }

        self.ack(&delivery).await?;

        Ok(match failed_kind {
            None => DispatchOutcome::Sent {
                campaign_id,
                finalized,
            },
            Some(kind) => DispatchOutcome::Failed {
                campaign_id,
                kind,
                finalized,
            },
        })
    }

    /// Waits for a rate-limit slot, rechecking the campaign before every try.
    async fn throttle(&self, delivery: &Delivery) -> Result<Gate, InfraError> {
        let item = &delivery.item;
        let key = tenant_messages_key(item.tenant_id);

        loop {
            let Some(job) = self.store.get_campaign(item.campaign_id).await? else {
                return Ok(Gate::Closed(SkipReason::CampaignMissing));
            };
            match job.status {
                CampaignStatus::Cancelled => return Ok(Gate::Closed(SkipReason::Cancelled)),
                status if status.is_terminal() => {
                    return Ok(Gate::Closed(SkipReason::Finished(status)))
                }
                _ => {}
            }

            let limit = self
                .store
                .tenant_rate(item.tenant_id)
                .await?
                .unwrap_or(self.cfg.default_messages_per_second);

            let acquired = self
                .limiter
                .try_acquire(&key, limit, self.cfg.rate_window)
                .await?;
            if acquired.allowed {
                return Ok(Gate::Open);
            }

            let wait = acquired
                .retry_after
                .unwrap_or(self.cfg.rate_window)
                .clamp(Duration::from_millis(1), self.cfg.rate_window);
            tracing::trace!(
                tenant_id = %item.tenant_id,
                wait_ms = wait.as_millis() as u64,
                "rate limited"
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), InfraError> {
        if !self.channel.ack(delivery).await? {
            tracing::warn!(
                work_item_id = %delivery.item.id,
                worker_id = %self.worker_id,
                partition = delivery.partition,
                "ack lost: lease expired before acknowledgement"
            );
        }
        Ok(())
    }
}
