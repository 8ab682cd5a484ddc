// tests/pg_pipeline.rs
mod common;

use common::{setup_db, template, work_item};

use broadcastflow::admin::Admin;
use broadcastflow::audience::PgDirectory;
use broadcastflow::campaigns::{
    AudienceSpec, CampaignStatus, CampaignStore, DeliveryOutcome, NewCampaign, Outcome,
    OutcomeRecord, PgCampaignStore, ACTIVE,
};
use broadcastflow::channel::{assigned_partitions, PartitionKey, PgChannel, WorkChannel};
use broadcastflow::dispatch::{DispatchConfig, Dispatcher, WorkerPool};
use broadcastflow::enqueuer::Enqueuer;
use broadcastflow::gateway::{GatewayErrorKind, LoopbackGateway};
use broadcastflow::ratelimit::{PgRateLimiter, RateLimiter};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const TOPIC: &str = "test-broadcast";

fn channel(pool: &PgPool, lease: Duration) -> PgChannel {
    PgChannel::new(pool.clone(), TOPIC, 4, PartitionKey::Recipient, lease)
}

async fn campaign(store: &PgCampaignStore, tenant_id: Uuid, total: i64) -> Uuid {
    let job = store
        .create_campaign(&NewCampaign {
            tenant_id,
            template_id: Uuid::new_v4(),
            audience: AudienceSpec::Tags {
                tag_ids: vec!["t".to_string()],
            },
            variable_mappings: Vec::new(),
            requeue_of: None,
        })
        .await
        .expect("create campaign");
    store.set_total_items(job.id, total).await.expect("set total");
    job.id
}

#[tokio::test]
#[serial]
async fn pg_outcomes_are_recorded_once() {
    let Some(pool) = setup_db().await else { return };
    let store = PgCampaignStore::new(pool.clone());
    let tenant = Uuid::new_v4();
    let id = campaign(&store, tenant, 2).await;

    let record = OutcomeRecord {
        item: work_item(id, tenant),
        outcome: Outcome::Sent {
            provider_message_id: "wamid.1".to_string(),
        },
        worker_id: "w-1".to_string(),
    };

    let first = store.record_outcome(&record).await.unwrap().unwrap();
    assert_eq!((first.success_count, first.error_count), (1, 0));
    assert_eq!(first.status, CampaignStatus::Processing);

    let (a, b) = tokio::join!(store.record_outcome(&record), store.record_outcome(&record));
    assert!(a.unwrap().is_none());
    assert!(b.unwrap().is_none());
    assert!(store.is_settled(record.item.id).await.unwrap());

    let job = store.get_campaign(id).await.unwrap().unwrap();
    assert_eq!(job.success_count, 1);
    assert!(job.started_at.is_some());

    let deliveries = store
        .list_deliveries(id, Some(DeliveryOutcome::Sent), 10)
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].provider_message_id.as_deref(), Some("wamid.1"));
}

#[tokio::test]
#[serial]
async fn pg_transition_is_guarded() {
    let Some(pool) = setup_db().await else { return };
    let store = PgCampaignStore::new(pool.clone());
    let id = campaign(&store, Uuid::new_v4(), 1).await;

    assert!(!store
        .transition(id, &[CampaignStatus::Processing], CampaignStatus::Completed, None)
        .await
        .unwrap());
    assert!(store
        .transition(id, &ACTIVE, CampaignStatus::Cancelled, Some("operator"))
        .await
        .unwrap());
    assert!(!store
        .transition(id, &ACTIVE, CampaignStatus::Failed, None)
        .await
        .unwrap());

    let job = store.get_campaign(id).await.unwrap().unwrap();
    assert_eq!(job.status, CampaignStatus::Cancelled);
    assert_eq!(job.failure_reason.as_deref(), Some("operator"));
    assert!(job.completed_at.is_some());
}

#[tokio::test]
#[serial]
async fn pg_channel_leases_each_item_to_one_worker() {
    let Some(pool) = setup_db().await else { return };
    let store = PgCampaignStore::new(pool.clone());
    let tenant = Uuid::new_v4();
    let id = campaign(&store, tenant, 40).await;

    let ch = channel(&pool, Duration::from_secs(30));
    let items: Vec<_> = (0..40).map(|_| work_item(id, tenant)).collect();
    ch.publish(&items).await.unwrap();

    let all = assigned_partitions(0, 1, 4);
    let drain = |worker: &'static str| {
        let ch = ch.clone();
        let all = all.clone();
        async move {
            let mut got = Vec::new();
            while let Some(d) = ch.claim(&all, worker).await.unwrap() {
                got.push(d.item.id);
                assert!(ch.ack(&d).await.unwrap());
            }
            got
        }
    };

    let (a, b) = tokio::join!(drain("w-a"), drain("w-b"));
    let mut seen = HashSet::new();
    for id in a.iter().chain(b.iter()) {
        assert!(seen.insert(*id), "item {id} leased twice");
    }
    assert_eq!(seen.len(), 40);
}

#[tokio::test]
#[serial]
async fn pg_channel_retry_reclaim_and_purge() {
    let Some(pool) = setup_db().await else { return };
    let store = PgCampaignStore::new(pool.clone());
    let tenant = Uuid::new_v4();
    let id = campaign(&store, tenant, 3).await;

    let ch = channel(&pool, Duration::from_millis(500));
    let partitions = assigned_partitions(0, 1, 4);
    ch.publish(&[work_item(id, tenant)]).await.unwrap();

    let d = ch.claim(&partitions, "w").await.unwrap().unwrap();
    ch.retry_later(&d, Duration::from_millis(300)).await.unwrap();
    assert!(ch.claim(&partitions, "w").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let again = ch.claim(&partitions, "crashed").await.unwrap().unwrap();
    assert_eq!(again.item.id, d.item.id);
    assert_eq!(again.item.attempt, 2);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(ch.reclaim_expired().await.unwrap(), 1);
    assert!(!ch.ack(&again).await.unwrap(), "expired lease cannot be acked");

    ch.publish(&[work_item(id, tenant), work_item(id, tenant)])
        .await
        .unwrap();
    assert_eq!(ch.purge_campaign(id).await.unwrap(), 3);
    assert!(ch.claim(&partitions, "w").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn pg_limiter_holds_across_instances() {
    let Some(pool) = setup_db().await else { return };
    let first = PgRateLimiter::new(pool.clone());
    let second = PgRateLimiter::new(pool.clone());
    let window = Duration::from_secs(5);

    let mut attempts = Vec::new();
    for i in 0..10 {
        let limiter = if i % 2 == 0 { first.clone() } else { second.clone() };
        attempts.push(tokio::spawn(async move {
            limiter.try_acquire("tenant:shared", 4, window).await.unwrap()
        }));
    }

    let mut allowed = 0;
    let mut refused = Vec::new();
    for a in attempts {
        let answer = a.await.unwrap();
        if answer.allowed {
            allowed += 1;
        } else {
            refused.push(answer.retry_after.unwrap());
        }
    }
    assert_eq!(allowed, 4);
    assert!(refused.iter().all(|d| *d > Duration::ZERO && *d <= window));

    assert!(!first.try_acquire("tenant:zero", 0, window).await.unwrap().allowed);
    assert!(first.try_acquire("tenant:other", 1, window).await.unwrap().allowed);
}

#[tokio::test]
#[serial]
async fn pg_pipeline_runs_a_campaign_to_partial_failure() {
    let Some(pool) = setup_db().await else { return };

    let directory = Arc::new(PgDirectory::new(pool.clone()));
    let store = Arc::new(PgCampaignStore::new(pool.clone()));
    let ch = Arc::new(channel(&pool, Duration::from_secs(30)));
    let tenant = Uuid::new_v4();

    directory.upsert_tenant(tenant, "acme", Some(50)).await.unwrap();
    let tpl = template(tenant, "Hi {{1}}");
    directory.insert_template(&tpl).await.unwrap();
    let tags = vec!["launch".to_string()];
    for i in 0..20 {
        directory
            .insert_contact(
                tenant,
                &format!("+1 555 {i:07}"),
                json!({ "variable1": format!("C{i}") }),
                &tags,
            )
            .await
            .unwrap();
    }

    let enqueuer = Arc::new(Enqueuer::new(
        store.clone(),
        directory.clone(),
        directory.clone(),
        ch.clone(),
    ));
    let admin = Admin::new(store.clone(), ch.clone(), enqueuer.clone(), 80);

    let job = enqueuer
        .create_campaign(NewCampaign {
            tenant_id: tenant,
            template_id: tpl.id,
            audience: AudienceSpec::Tags { tag_ids: tags },
            variable_mappings: Vec::new(),
            requeue_of: None,
        })
        .await
        .unwrap();
    assert_eq!(job.total_items, 20);

    let gateway = Arc::new(LoopbackGateway::failing_every(4, GatewayErrorKind::InvalidRecipient));
    let dispatcher = Arc::new(Dispatcher::new(
        ch.clone(),
        store.clone(),
        Arc::new(PgRateLimiter::new(pool.clone())),
        gateway.clone(),
        DispatchConfig::default(),
        "pg-worker",
        assigned_partitions(0, 1, 4),
    ));
    let (stop, rx) = watch::channel(false);
    let handle = tokio::spawn(
        WorkerPool::new(dispatcher, 4)
            .with_idle_backoff(Duration::from_millis(20))
            .run(rx),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let done = loop {
        let current = store.get_campaign(job.id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            break current;
        }
        assert!(tokio::time::Instant::now() < deadline, "campaign did not finish");
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    let _ = stop.send(true);
    handle.await.unwrap();

    assert_eq!(done.status, CampaignStatus::PartialFailure);
    assert_eq!(done.success_count, 15);
    assert_eq!(done.error_count, 5);
    assert_eq!(gateway.call_count(), 20);

    let report = admin.campaign_report(job.id).await.unwrap();
    assert_eq!(report.messages_per_second, Some(50));
    assert!(report.progress.speed.is_some());

    let requeued = admin
        .requeue(job.id, broadcastflow::campaigns::RequeueScope::Failed, None)
        .await
        .unwrap();
    assert_eq!(requeued.total_items, 5);
    assert_eq!(requeued.requeue_of, Some(job.id));
}
