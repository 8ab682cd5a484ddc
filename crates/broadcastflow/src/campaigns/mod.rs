pub mod memory;
pub mod model;
pub mod repo;
pub mod status;
pub mod store;

pub use memory::MemoryCampaignStore;
pub use model::{
    AudienceSpec, CampaignJob, CampaignLog, CounterUpdate, DeliveryOutcome, DeliveryRecord,
    LogLevel, NewCampaign, Outcome, OutcomeRecord, RequeueScope, VariableMapping, Variables,
    WorkItem,
};
pub use repo::PgCampaignStore;
pub use status::{CampaignStatus, ACTIVE};
pub use store::{current_counters, finalize_if_accounted, log_best_effort, CampaignStore};
