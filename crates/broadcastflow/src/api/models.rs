use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::campaigns::{CampaignJob, CampaignStatus, RequeueScope};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct CreatedCampaign {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    pub total_items: i64,
}

impl From<&CampaignJob> for CreatedCampaign {
    fn from(job: &CampaignJob) -> Self {
        Self {
            campaign_id: job.id,
            status: job.status,
            total_items: job.total_items,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListCampaignsQuery {
    pub tenant_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListDeliveriesQuery {
    pub outcome: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RequeueRequest {
    pub scope: RequeueScope,
    pub template_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SetRateRequest {
    pub messages_per_second: i64,
}

#[derive(Debug, Serialize)]
pub struct RateResponse {
    pub tenant_id: Uuid,
    pub messages_per_second: u32,
}
