// tests/status_machine.rs
mod common;

use common::work_item;

use broadcastflow::campaigns::{
    finalize_if_accounted, AudienceSpec, CampaignStatus, CampaignStore, CounterUpdate,
    MemoryCampaignStore, NewCampaign, Outcome, OutcomeRecord, ACTIVE,
};
use broadcastflow::error::InfraError;
use uuid::Uuid;

use CampaignStatus::*;

const ALL: [CampaignStatus; 6] = [Queued, Processing, Completed, Failed, PartialFailure, Cancelled];

fn new_campaign(tenant_id: Uuid) -> NewCampaign {
    NewCampaign {
        tenant_id,
        template_id: Uuid::new_v4(),
        audience: AudienceSpec::Tags {
            tag_ids: vec!["t".to_string()],
        },
        variable_mappings: Vec::new(),
        requeue_of: None,
    }
}

fn sent(item: broadcastflow::campaigns::WorkItem) -> OutcomeRecord {
    OutcomeRecord {
        item,
        outcome: Outcome::Sent {
            provider_message_id: "m-1".to_string(),
        },
        worker_id: "w-1".to_string(),
    }
}

fn failed(item: broadcastflow::campaigns::WorkItem) -> OutcomeRecord {
    OutcomeRecord {
        item,
        outcome: Outcome::Failed {
            error_code: "INVALID_RECIPIENT".to_string(),
            error_message: "not on the channel".to_string(),
        },
        worker_id: "w-1".to_string(),
    }
}

#[test]
fn edges_of_the_state_machine() {
    let allowed = [
        (Queued, Processing),
        (Queued, Failed),
        (Queued, Cancelled),
        (Processing, Completed),
        (Processing, PartialFailure),
        (Processing, Failed),
        (Processing, Cancelled),
    ];

    for from in ALL {
        for to in ALL {
            assert_eq!(
                from.can_transition_to(to),
                allowed.contains(&(from, to)),
                "{from} -> {to}"
            );
        }
    }
}

#[test]
fn terminal_states_have_no_way_out() {
    for status in ALL.into_iter().filter(CampaignStatus::is_terminal) {
        assert!(ALL.iter().all(|to| !status.can_transition_to(*to)));
        assert!(!status.accepts_dispatch());
    }
    assert_eq!(ACTIVE, [Queued, Processing]);
}

#[test]
fn terminal_status_follows_the_counters() {
    assert_eq!(CampaignStatus::terminal_for(10, 0), Completed);
    assert_eq!(CampaignStatus::terminal_for(7, 3), PartialFailure);
    assert_eq!(CampaignStatus::terminal_for(0, 10), Failed);
    assert_eq!(CampaignStatus::terminal_for(0, 0), Failed);
}

#[test]
fn status_names_round_trip_through_text_and_json() {
    for status in ALL {
        assert_eq!(CampaignStatus::parse(status.as_str()), Some(status));
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, format!("\"{}\"", status.as_str()));
    }
    assert_eq!(CampaignStatus::parse(" Partial_Failure "), Some(PartialFailure));
    assert_eq!(CampaignStatus::parse("paused"), None);
}

#[tokio::test]
async fn guarded_transition_rejects_stale_source_status() {
    let store = MemoryCampaignStore::new();
    let job = store.create_campaign(&new_campaign(Uuid::new_v4())).await.unwrap();
    assert_eq!(job.status, Queued);

    assert!(!store.transition(job.id, &[Processing], Cancelled, None).await.unwrap());
    assert!(!store.transition(job.id, &[Queued], Completed, None).await.unwrap());
    assert!(store.transition(job.id, &[Queued], Processing, None).await.unwrap());
    assert!(store
        .transition(job.id, &ACTIVE, Cancelled, Some("operator"))
        .await
        .unwrap());

    let after = store.get_campaign(job.id).await.unwrap().unwrap();
    assert_eq!(after.status, Cancelled);
    assert_eq!(after.failure_reason.as_deref(), Some("operator"));
    assert!(after.completed_at.is_some());

    assert!(!store.transition(job.id, &ACTIVE, Failed, None).await.unwrap());
    assert!(!store.transition(Uuid::new_v4(), &ACTIVE, Failed, None).await.unwrap());
}

#[tokio::test]
async fn outcomes_are_counted_once_per_work_item() {
    let store = MemoryCampaignStore::new();
    let tenant = Uuid::new_v4();
    let job = store.create_campaign(&new_campaign(tenant)).await.unwrap();
    store.set_total_items(job.id, 2).await.unwrap();

    let item = work_item(job.id, tenant);
    let first = store.record_outcome(&sent(item.clone())).await.unwrap().unwrap();
    assert_eq!(first.success_count, 1);
    assert_eq!(first.status, Processing, "first outcome starts the campaign");

    assert!(store.record_outcome(&sent(item.clone())).await.unwrap().is_none());
    assert!(store.record_outcome(&failed(item.clone())).await.unwrap().is_none());
    assert!(store.is_settled(item.id).await.unwrap());

    let after = store.get_campaign(job.id).await.unwrap().unwrap();
    assert_eq!((after.success_count, after.error_count), (1, 0));
    assert!(after.started_at.is_some());
    assert_eq!(store.list_deliveries(job.id, None, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn accounted_campaign_is_finalized_once() {
    let store = MemoryCampaignStore::new();
    let tenant = Uuid::new_v4();
    let job = store.create_campaign(&new_campaign(tenant)).await.unwrap();
    store.set_total_items(job.id, 2).await.unwrap();

    let a = store
        .record_outcome(&sent(work_item(job.id, tenant)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finalize_if_accounted(&store, &a).await.unwrap(), None);

    let b = store
        .record_outcome(&failed(work_item(job.id, tenant)))
        .await
        .unwrap()
        .unwrap();
    assert!(b.is_accounted_for());
    assert_eq!(
        finalize_if_accounted(&store, &b).await.unwrap(),
        Some(PartialFailure)
    );
    // A second finalizer racing on the same counters loses.
    assert_eq!(finalize_if_accounted(&store, &b).await.unwrap(), None);

    let done = store.get_campaign(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, PartialFailure);
}

#[tokio::test]
async fn cancelled_campaign_keeps_status_when_stragglers_land() {
    let store = MemoryCampaignStore::new();
    let tenant = Uuid::new_v4();
    let job = store.create_campaign(&new_campaign(tenant)).await.unwrap();
    store.set_total_items(job.id, 1).await.unwrap();
    store.transition(job.id, &[Queued], Processing, None).await.unwrap();
    store.transition(job.id, &ACTIVE, Cancelled, None).await.unwrap();

    let update = store
        .record_outcome(&sent(work_item(job.id, tenant)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.status, Cancelled);
    assert_eq!(finalize_if_accounted(&store, &update).await.unwrap(), None);

    let after = store.get_campaign(job.id).await.unwrap().unwrap();
    assert_eq!(after.status, Cancelled);
    assert_eq!(after.success_count, 1);
}

#[test]
fn zero_total_is_never_accounted_for() {
    let update = CounterUpdate {
        campaign_id: Uuid::new_v4(),
        status: Processing,
        total_items: 0,
        success_count: 0,
        error_count: 0,
    };
    assert!(!update.is_accounted_for());
}

#[tokio::test]
async fn unavailable_store_reports_infrastructure_errors() {
    let store = MemoryCampaignStore::new();
    store.set_unavailable(true);
    let err = store
        .create_campaign(&new_campaign(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, InfraError::Unavailable(_)));

    store.set_unavailable(false);
    assert!(store.list_campaigns(None, 10).await.unwrap().is_empty());
}
