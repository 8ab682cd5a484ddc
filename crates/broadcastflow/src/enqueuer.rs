//! Campaign creation: validate, resolve the audience, publish one work item
//! per recipient.

use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::audience::{
    bind_variables, normalize_address, AudienceResolver, MessageTemplate, Recipient, TemplateStore,
};
use crate::campaigns::{
    current_counters, finalize_if_accounted, log_best_effort, AudienceSpec, CampaignJob,
    CampaignStatus, CampaignStore, DeliveryOutcome, LogLevel, NewCampaign, RequeueScope, WorkItem,
};
use crate::channel::WorkChannel;
use crate::error::{EnqueueError, InfraError, ValidationError};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

enum Resolution {
    Ready(Vec<WorkItem>),
    Invalid(ValidationError),
}

pub struct Enqueuer {
    store: Arc<dyn CampaignStore>,
    templates: Arc<dyn TemplateStore>,
    audience: Arc<dyn AudienceResolver>,
    channel: Arc<dyn WorkChannel>,
    batch_size: usize,
}

impl Enqueuer {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        templates: Arc<dyn TemplateStore>,
        audience: Arc<dyn AudienceResolver>,
        channel: Arc<dyn WorkChannel>,
    ) -> Self {
        Self {
            store,
            templates,
            audience,
            channel,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Creates the campaign record and publishes its work items.
    ///
    /// Structural errors are returned before anything is stored. Resolution
    /// errors (unknown or unapproved template, no reachable recipient) leave
    /// the campaign `Failed` with nothing published.
    pub async fn create_campaign(&self, new: NewCampaign) -> Result<CampaignJob, EnqueueError> {
        validate(&new).map_err(|source| EnqueueError::Validation {
            campaign_id: None,
            source,
        })?;

        let job = self.store.create_campaign(&new).await?;
        let campaign_id = job.id;
        tracing::info!(%campaign_id, tenant_id = %job.tenant_id, "campaign created");

        let items = match self.resolve(&job).await {
            Ok(Resolution::Ready(items)) => items,
            Ok(Resolution::Invalid(source)) => {
                self.fail(campaign_id, &source.to_string()).await?;
                return Err(EnqueueError::Validation {
                    campaign_id: Some(campaign_id),
                    source,
                });
            }
            Err(e) => {
                if let Err(fail_err) = self.fail(campaign_id, &format!("audience resolution: {e}")).await {
                    tracing::warn!(%campaign_id, error = %fail_err, "could not mark campaign failed");
                }
                return Err(e.into());
            }
        };

        let expected = items.len() as i64;
        self.store.set_total_items(campaign_id, expected).await?;

        let mut published = 0_i64;
        for batch in items.chunks(self.batch_size) {
            if let Err(source) = self.channel.publish(batch).await {
                return Err(self.abort_publish(campaign_id, published, expected, source).await);
            }
            if published == 0 {
                self.store
                    .transition(
                        campaign_id,
                        &[CampaignStatus::Queued],
                        CampaignStatus::Processing,
                        None,
                    )
                    .await?;
            }
            published += batch.len() as i64;
        }

        tracing::info!(%campaign_id, items = published, "campaign enqueued");
        log_best_effort(
            self.store.as_ref(),
            campaign_id,
            LogLevel::Info,
            "campaign enqueued",
            json!({ "total_items": published }),
        )
        .await;

        Ok(self.store.get_campaign(campaign_id).await?.unwrap_or(job))
    }

    /// New campaign for the recipients of an earlier one, optionally with
    /// another template.
    pub async fn requeue(
        &self,
        source_campaign: Uuid,
        scope: RequeueScope,
        template_override: Option<Uuid>,
    ) -> Result<CampaignJob, EnqueueError> {
        let source = self
            .store
            .get_campaign(source_campaign)
            .await?
            .ok_or(EnqueueError::Validation {
                campaign_id: None,
                source: ValidationError::CampaignNotFound(source_campaign),
            })?;

        self.create_campaign(NewCampaign {
            tenant_id: source.tenant_id,
            template_id: template_override.unwrap_or(source.template_id),
            audience: AudienceSpec::Requeue {
                campaign_id: source.id,
                scope,
            },
            variable_mappings: Vec::new(),
            requeue_of: Some(source.id),
        })
        .await
    }

    async fn resolve(&self, job: &CampaignJob) -> Result<Resolution, InfraError> {
        let Some(template) = self
            .templates
            .get_template(job.tenant_id, job.template_id)
            .await?
        else {
            return Ok(Resolution::Invalid(ValidationError::TemplateNotFound(job.template_id)));
        };
        if !template.approved {
            return Ok(Resolution::Invalid(ValidationError::TemplateNotApproved(template.id)));
        }

        let recipients = match &job.audience {
            AudienceSpec::Requeue { campaign_id, scope } => {
                if self.store.get_campaign(*campaign_id).await?.is_none() {
                    return Ok(Resolution::Invalid(ValidationError::CampaignNotFound(*campaign_id)));
                }
                self.requeue_recipients(*campaign_id, *scope).await?
            }
            spec => self.audience.resolve(job.tenant_id, spec).await?,
        };

        let items = build_items(job, &template, recipients);
        if items.is_empty() {
            return Ok(Resolution::Invalid(ValidationError::NoRecipients));
        }
        Ok(Resolution::Ready(items))
    }

    /// Recipients of an earlier campaign, rebuilt from its delivery records.
    /// Stored slot values come back as `variable<n>` attributes.
    async fn requeue_recipients(
        &self,
        campaign_id: Uuid,
        scope: RequeueScope,
    ) -> Result<Vec<Recipient>, InfraError> {
        let filter = match scope {
            RequeueScope::All => None,
            RequeueScope::Failed => Some(DeliveryOutcome::Failed),
        };
        let deliveries = self
            .store
            .list_deliveries(campaign_id, filter, i64::MAX)
            .await?;

        let mut seen = HashSet::new();
        Ok(deliveries
            .into_iter()
            .filter(|d| seen.insert(d.recipient_id))
            .map(|d| Recipient {
                id: d.recipient_id,
                channel_address: d.channel_address,
                attributes: d
                    .variables
                    .into_iter()
                    .map(|(slot, value)| (format!("variable{slot}"), value))
                    .collect::<BTreeMap<_, _>>(),
            })
            .collect())
    }

    async fn fail(&self, campaign_id: Uuid, reason: &str) -> Result<(), InfraError> {
        self.store
            .transition(
                campaign_id,
                &[CampaignStatus::Queued],
                CampaignStatus::Failed,
                Some(reason),
            )
            .await?;
        tracing::warn!(%campaign_id, reason, "campaign failed before dispatch");
        log_best_effort(
            self.store.as_ref(),
            campaign_id,
            LogLevel::Error,
            "campaign failed before dispatch",
            json!({ "reason": reason }),
        )
        .await;
        Ok(())
    }

    /// The channel refused a batch. With nothing published the campaign fails;
    /// otherwise its expected total shrinks to what was published.
    async fn abort_publish(
        &self,
        campaign_id: Uuid,
        published: i64,
        expected: i64,
        source: InfraError,
    ) -> EnqueueError {
        tracing::error!(
            alert = true,
            %campaign_id,
            published,
            expected,
            error = %source,
            "publishing work items failed"
        );

        if published == 0 {
            if let Err(e) = self.fail(campaign_id, &format!("publish failed: {source}")).await {
                tracing::warn!(%campaign_id, error = %e, "could not mark campaign failed");
            }
            return EnqueueError::Infra(source);
        }

        let settle = async {
            self.store.set_total_items(campaign_id, published).await?;
            if let Some(counters) = current_counters(self.store.as_ref(), campaign_id).await? {
                finalize_if_accounted(self.store.as_ref(), &counters).await?;
            }
            Ok::<(), InfraError>(())
        };
        if let Err(e) = settle.await {
            tracing::warn!(%campaign_id, error = %e, "could not settle partially published campaign");
        }

        EnqueueError::PartialPublish {
            campaign_id,
            published,
            expected,
            source,
        }
    }
}

fn validate(new: &NewCampaign) -> Result<(), ValidationError> {
    if new.tenant_id.is_nil() {
        return Err(ValidationError::MissingTenant);
    }
    if new.template_id.is_nil() {
        return Err(ValidationError::MissingTemplate);
    }
    if new.audience.is_empty() {
        return Err(ValidationError::EmptyAudienceSpec);
    }
    Ok(())
}

/// One work item per distinct reachable address, in resolution order.
fn build_items(
    job: &CampaignJob,
    template: &MessageTemplate,
    recipients: Vec<Recipient>,
) -> Vec<WorkItem> {
    let slots = template.variable_slots();
    let mut seen = HashSet::new();

    recipients
        .into_iter()
        .filter_map(|r| {
            let address = normalize_address(&r.channel_address)?;
            if !seen.insert(address.clone()) {
                return None;
            }
            Some(WorkItem {
                id: Uuid::new_v4(),
                campaign_id: job.id,
                tenant_id: job.tenant_id,
                recipient_id: r.id,
                channel_address: address,
                template_id: job.template_id,
                variables: bind_variables(&slots, &job.variable_mappings, &r),
                attempt: 1,
            })
        })
        .collect()
}
