use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a campaign. Forward-only: terminal states have no outgoing edges.
///
/// ```text
/// Queued ──► Processing ──► Completed | PartialFailure | Failed | Cancelled
///   │
///   └──────► Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    PartialFailure,
    Cancelled,
}

/// States in which work items of a campaign may still be dispatched.
pub const ACTIVE: [CampaignStatus; 2] = [CampaignStatus::Queued, CampaignStatus::Processing];

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Queued => "queued",
            CampaignStatus::Processing => "processing",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
            CampaignStatus::PartialFailure => "partial_failure",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Some(CampaignStatus::Queued),
            "processing" => Some(CampaignStatus::Processing),
            "completed" => Some(CampaignStatus::Completed),
            "failed" => Some(CampaignStatus::Failed),
            "partial_failure" => Some(CampaignStatus::PartialFailure),
            "cancelled" => Some(CampaignStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CampaignStatus::Queued | CampaignStatus::Processing)
    }

    pub fn accepts_dispatch(&self) -> bool {
        ACTIVE.contains(self)
    }

    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, PartialFailure)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    /// Terminal status once every expected item has been accounted for.
    pub fn terminal_for(success_count: i64, error_count: i64) -> CampaignStatus {
        if success_count == 0 {
            CampaignStatus::Failed
        } else if error_count == 0 {
            CampaignStatus::Completed
        } else {
            CampaignStatus::PartialFailure
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
