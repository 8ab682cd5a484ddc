use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::status::CampaignStatus;

/// Template slot number (as written inside `{{ }}`) to resolved value.
pub type Variables = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudienceSpec {
    /// Contacts of the tenant carrying any of the tags.
    Tags { tag_ids: Vec<String> },
    /// An explicit list of contacts.
    Recipients { recipient_ids: Vec<Uuid> },
    /// Recipients of an earlier campaign, taken from its delivery records.
    Requeue { campaign_id: Uuid, scope: RequeueScope },
}

impl AudienceSpec {
    pub fn is_empty(&self) -> bool {
        match self {
            AudienceSpec::Tags { tag_ids } => tag_ids.iter().all(|t| t.trim().is_empty()),
            AudienceSpec::Recipients { recipient_ids } => recipient_ids.is_empty(),
            AudienceSpec::Requeue { campaign_id, .. } => campaign_id.is_nil(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueScope {
    All,
    Failed,
}

/// Binds template slot `slot` to the recipient attribute `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableMapping {
    pub slot: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub tenant_id: Uuid,
    pub template_id: Uuid,
    pub audience: AudienceSpec,
    #[serde(default)]
    pub variable_mappings: Vec<VariableMapping>,
    #[serde(default)]
    pub requeue_of: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub template_id: Uuid,
    pub audience: AudienceSpec,
    pub variable_mappings: Vec<VariableMapping>,

    pub status: CampaignStatus,
    pub total_items: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub failure_reason: Option<String>,
    pub requeue_of: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CampaignJob {
    pub fn processed(&self) -> i64 {
        self.success_count + self.error_count
    }
}

/// Channel message value: one recipient-level unit of dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub tenant_id: Uuid,
    pub recipient_id: Uuid,
    pub channel_address: String,
    pub template_id: Uuid,
    pub variables: Variables,
    pub attempt: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent {
        provider_message_id: String,
    },
    Failed {
        error_code: String,
        error_message: String,
    },
}

/// Terminal resolution of one work item, as handed to the state store.
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    pub item: WorkItem,
    pub outcome: Outcome,
    pub worker_id: String,
}

/// Counters of a campaign right after an outcome was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    pub total_items: i64,
    pub success_count: i64,
    pub error_count: i64,
}

impl CounterUpdate {
    pub fn is_accounted_for(&self) -> bool {
        self.total_items > 0 && self.success_count + self.error_count >= self.total_items
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sent" => Some(DeliveryOutcome::Sent),
            "failed" => Some(DeliveryOutcome::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub work_item_id: Uuid,
    pub campaign_id: Uuid,
    pub recipient_id: Uuid,
    pub channel_address: String,
    pub variables: Variables,
    pub outcome: DeliveryOutcome,
    pub provider_message_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attempt: i32,
    pub worker_id: String,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn from_outcome(record: &OutcomeRecord, created_at: DateTime<Utc>) -> Self {
        let (outcome, provider_message_id, error_code, error_message) = match &record.outcome {
            Outcome::Sent {
                provider_message_id,
            } => (
                DeliveryOutcome::Sent,
                Some(provider_message_id.clone()),
                None,
                None,
            ),
            Outcome::Failed {
                error_code,
                error_message,
            } => (
                DeliveryOutcome::Failed,
                None,
                Some(error_code.clone()),
                Some(error_message.clone()),
            ),
        };

        Self {
            work_item_id: record.item.id,
            campaign_id: record.item.campaign_id,
            recipient_id: record.item.recipient_id,
            channel_address: record.item.channel_address.clone(),
            variables: record.item.variables.clone(),
            outcome,
            provider_message_id,
            error_code,
            error_message,
            attempt: record.item.attempt,
            worker_id: record.worker_id.clone(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CampaignLog {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub level: String,
    pub message: String,
    pub details_json: Value,
    pub created_at: DateTime<Utc>,
}
