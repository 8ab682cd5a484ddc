use uuid::Uuid;

use crate::campaigns::CampaignStatus;

/// Broker or storage layer failure. Never attributed to a single work item.
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0} unavailable")]
    Unavailable(&'static str),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Malformed campaign definition, surfaced synchronously to the creator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("tenant id is required")]
    MissingTenant,

    #[error("template id is required")]
    MissingTemplate,

    #[error("audience selects no tags or contacts")]
    EmptyAudienceSpec,

    #[error("template {0} not found for tenant")]
    TemplateNotFound(Uuid),

    #[error("template {0} is not approved for sending")]
    TemplateNotApproved(Uuid),

    #[error("campaign {0} not found")]
    CampaignNotFound(Uuid),

    #[error("audience resolved to zero recipients with a channel address")]
    NoRecipients,

    #[error("messages per second must be at least 1, got {0}")]
    InvalidRate(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("invalid campaign: {source}")]
    Validation {
        campaign_id: Option<Uuid>,
        #[source]
        source: ValidationError,
    },

    #[error("published {published} of {expected} items for campaign {campaign_id}: {source}")]
    PartialPublish {
        campaign_id: Uuid,
        published: i64,
        expected: i64,
        #[source]
        source: InfraError,
    },

    #[error(transparent)]
    Infra(#[from] InfraError),
}

impl EnqueueError {
    pub fn campaign_id(&self) -> Option<Uuid> {
        match self {
            EnqueueError::Validation { campaign_id, .. } => *campaign_id,
            EnqueueError::PartialPublish { campaign_id, .. } => Some(*campaign_id),
            EnqueueError::Infra(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("campaign {0} not found")]
    NotFound(Uuid),

    #[error("campaign already finished with status {0}")]
    AlreadyFinished(CampaignStatus),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Infra(#[from] InfraError),
}
