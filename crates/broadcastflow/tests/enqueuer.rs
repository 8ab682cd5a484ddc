// tests/enqueuer.rs
mod common;

use common::{template, Harness, PARTITIONS};

use broadcastflow::campaigns::{
    AudienceSpec, CampaignStatus, CampaignStore, RequeueScope, VariableMapping, WorkItem,
};
use broadcastflow::channel::{Delivery, MemoryChannel, PartitionKey, WorkChannel};
use broadcastflow::dispatch::{DispatchConfig, DispatchOutcome};
use broadcastflow::enqueuer::Enqueuer;
use broadcastflow::error::{EnqueueError, InfraError, ValidationError};
use broadcastflow::gateway::{GatewayErrorKind, LoopbackGateway};
use broadcastflow::{boxed, BoxFuture};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Counts publish batches and refuses every batch after `fail_after`.
struct BatchCountingChannel {
    inner: MemoryChannel,
    batches: AtomicUsize,
    fail_after: Option<usize>,
}

impl BatchCountingChannel {
    fn new(fail_after: Option<usize>) -> Self {
        Self {
            inner: MemoryChannel::new(PARTITIONS, PartitionKey::Recipient),
            batches: AtomicUsize::new(0),
            fail_after,
        }
    }
}

impl WorkChannel for BatchCountingChannel {
    fn partition_count(&self) -> u32 {
        self.inner.partition_count()
    }

    fn publish<'a>(&'a self, items: &'a [WorkItem]) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(async move {
            let n = self.batches.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|limit| n >= limit) {
                return Err(InfraError::Unavailable("channel"));
            }
            self.inner.publish(items).await
        })
    }

    fn claim<'a>(
        &'a self,
        partitions: &'a [u32],
        worker_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Delivery>, InfraError>> {
        self.inner.claim(partitions, worker_id)
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<bool, InfraError>> {
        self.inner.ack(delivery)
    }

    fn retry_later<'a>(
        &'a self,
        delivery: &'a Delivery,
        delay: Duration,
    ) -> BoxFuture<'a, Result<(), InfraError>> {
        self.inner.retry_later(delivery, delay)
    }

    fn reclaim_expired<'a>(&'a self) -> BoxFuture<'a, Result<u64, InfraError>> {
        self.inner.reclaim_expired()
    }

    fn purge_campaign<'a>(&'a self, campaign_id: Uuid) -> BoxFuture<'a, Result<u64, InfraError>> {
        self.inner.purge_campaign(campaign_id)
    }
}

fn harness() -> Harness {
    Harness::new(Arc::new(LoopbackGateway::new()))
}

fn enqueuer_over(h: &Harness, channel: Arc<BatchCountingChannel>, batch_size: usize) -> Enqueuer {
    Enqueuer::new(h.store.clone(), h.directory.clone(), h.directory.clone(), channel)
        .with_batch_size(batch_size)
}

fn queued_items(h: &Harness) -> Vec<WorkItem> {
    (0..PARTITIONS)
        .flat_map(|p| h.channel.partition_snapshot(p))
        .collect()
}

#[tokio::test]
async fn publishes_one_item_per_recipient_with_bound_variables() {
    let h = harness();
    let ids = h.add_contacts(5, "news");

    let job = h.enqueuer.create_campaign(h.campaign("news")).await.unwrap();
    assert_eq!(job.total_items, 5);
    assert_eq!(job.status, CampaignStatus::Processing);
    assert_eq!(job.started_at, None, "started_at is set by the first outcome");

    let items = queued_items(&h);
    assert_eq!(items.len(), 5);
    for item in &items {
        assert!(ids.contains(&item.recipient_id));
        assert_eq!(item.campaign_id, job.id);
        assert_eq!(item.template_id, h.template.id);
        assert_eq!(item.attempt, 1);
        assert!(item.channel_address.starts_with("+1555"));
        assert_eq!(item.variables.keys().collect::<Vec<_>>(), ["1", "2"]);
    }

    let logs = h.store.list_logs(job.id).await.unwrap();
    assert!(logs.iter().any(|l| l.message == "campaign enqueued"));
}

#[tokio::test]
async fn variable_mappings_pick_recipient_attributes() {
    let h = harness();
    let id = h.directory.add_contact(
        h.tenant_id,
        "+44 20 7946 0000",
        BTreeMap::from([
            ("first_name".to_string(), "Ada".to_string()),
            ("variable2".to_string(), "fallback".to_string()),
        ]),
        &["map"],
    );

    let mut new = h.campaign("map");
    new.variable_mappings = vec![VariableMapping {
        slot: "1".to_string(),
        source: "first_name".to_string(),
    }];
    h.enqueuer.create_campaign(new).await.unwrap();

    let items = queued_items(&h);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].recipient_id, id);
    assert_eq!(items[0].channel_address, "+442079460000");
    assert_eq!(items[0].variables["1"], "Ada");
    assert_eq!(items[0].variables["2"], "fallback");
}

#[tokio::test]
async fn unreachable_and_duplicate_addresses_are_dropped() {
    let h = harness();
    let none = BTreeMap::new;
    h.directory.add_contact(h.tenant_id, "+1 555 000 0001", none(), &["d"]);
    h.directory.add_contact(h.tenant_id, "+1-555-000-0001", none(), &["d"]);
    h.directory.add_contact(h.tenant_id, "n/a", none(), &["d"]);
    h.directory.add_contact(h.tenant_id, "+1 555 000 0002", none(), &["d"]);

    let job = h.enqueuer.create_campaign(h.campaign("d")).await.unwrap();
    assert_eq!(job.total_items, 2);
    assert_eq!(h.channel.queued_len(), 2);
}

#[tokio::test]
async fn zero_recipients_fails_the_campaign_without_starting_it() {
    let h = harness();
    h.add_contacts(3, "someone-else");

    let err = h.enqueuer.create_campaign(h.campaign("nobody")).await.unwrap_err();
    let campaign_id = err.campaign_id().expect("record was created");
    assert!(matches!(
        err,
        EnqueueError::Validation {
            source: ValidationError::NoRecipients,
            ..
        }
    ));

    let job = h.store.get_campaign(campaign_id).await.unwrap().unwrap();
    assert_eq!(job.status, CampaignStatus::Failed);
    assert_eq!(job.started_at, None);
    assert!(job.completed_at.is_some());
    assert_eq!((job.total_items, job.success_count, job.error_count), (0, 0, 0));
    assert!(job.failure_reason.is_some());
    assert_eq!(h.channel.queued_len(), 0);
}

#[tokio::test]
async fn structural_errors_create_nothing() {
    let h = harness();

    let mut no_tenant = h.campaign("x");
    no_tenant.tenant_id = Uuid::nil();
    let mut no_template = h.campaign("x");
    no_template.template_id = Uuid::nil();
    let mut no_audience = h.campaign("x");
    no_audience.audience = AudienceSpec::Tags {
        tag_ids: vec!["  ".to_string()],
    };

    for (new, expected) in [
        (no_tenant, ValidationError::MissingTenant),
        (no_template, ValidationError::MissingTemplate),
        (no_audience, ValidationError::EmptyAudienceSpec),
    ] {
        match h.enqueuer.create_campaign(new).await {
            Err(EnqueueError::Validation {
                campaign_id: None,
                source,
            }) => assert_eq!(source, expected),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    assert!(h.store.list_campaigns(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_or_unapproved_template_fails_the_campaign() {
    let h = harness();
    h.add_contacts(2, "t");

    let mut unknown = h.campaign("t");
    unknown.template_id = Uuid::new_v4();
    let err = h.enqueuer.create_campaign(unknown).await.unwrap_err();
    assert!(matches!(
        err,
        EnqueueError::Validation {
            source: ValidationError::TemplateNotFound(_),
            ..
        }
    ));

    let mut draft = template(h.tenant_id, "Hello {{1}}");
    draft.approved = false;
    h.directory.add_template(draft.clone());
    let mut unapproved = h.campaign("t");
    unapproved.template_id = draft.id;
    let err = h.enqueuer.create_campaign(unapproved).await.unwrap_err();
    let id = err.campaign_id().unwrap();
    assert!(matches!(
        err,
        EnqueueError::Validation {
            source: ValidationError::TemplateNotApproved(_),
            ..
        }
    ));

    let job = h.store.get_campaign(id).await.unwrap().unwrap();
    assert_eq!(job.status, CampaignStatus::Failed);
    assert_eq!(h.channel.queued_len(), 0);
}

#[tokio::test]
async fn template_of_another_tenant_is_not_found() {
    let h = harness();
    h.add_contacts(1, "t");

    let foreign = template(Uuid::new_v4(), "Hi");
    h.directory.add_template(foreign.clone());
    let mut new = h.campaign("t");
    new.template_id = foreign.id;

    let err = h.enqueuer.create_campaign(new).await.unwrap_err();
    assert!(matches!(
        err,
        EnqueueError::Validation {
            source: ValidationError::TemplateNotFound(_),
            ..
        }
    ));
}

#[tokio::test]
async fn items_are_published_in_batches() {
    let h = harness();
    h.add_contacts(10, "b");
    let channel = Arc::new(BatchCountingChannel::new(None));

    let job = enqueuer_over(&h, channel.clone(), 3)
        .create_campaign(h.campaign("b"))
        .await
        .unwrap();

    assert_eq!(job.total_items, 10);
    assert_eq!(channel.batches.load(Ordering::SeqCst), 4);
    assert_eq!(channel.inner.queued_len(), 10);
}

#[tokio::test]
async fn publish_failure_before_any_batch_fails_the_campaign() {
    let h = harness();
    h.add_contacts(4, "p");
    let channel = Arc::new(BatchCountingChannel::new(Some(0)));

    let err = enqueuer_over(&h, channel, 2)
        .create_campaign(h.campaign("p"))
        .await
        .unwrap_err();
    assert!(matches!(err, EnqueueError::Infra(InfraError::Unavailable(_))));

    let jobs = h.store.list_campaigns(None, 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, CampaignStatus::Failed);
}

#[tokio::test]
async fn partial_publish_shrinks_the_expected_total() {
    let h = harness();
    h.add_contacts(10, "pp");
    let channel = Arc::new(BatchCountingChannel::new(Some(2)));

    let err = enqueuer_over(&h, channel.clone(), 3)
        .create_campaign(h.campaign("pp"))
        .await
        .unwrap_err();
    let EnqueueError::PartialPublish {
        campaign_id,
        published,
        expected,
        ..
    } = err
    else {
        panic!("expected partial publish, got {err:?}");
    };
    assert_eq!((published, expected), (6, 10));

    let job = h.store.get_campaign(campaign_id).await.unwrap().unwrap();
    assert_eq!(job.total_items, 6);
    assert_eq!(job.status, CampaignStatus::Processing);
    assert_eq!(channel.inner.queued_len(), 6);
}

#[tokio::test]
async fn requeue_failed_targets_only_failed_recipients() {
    let h = Harness::new(Arc::new(LoopbackGateway::failing_every(
        3,
        GatewayErrorKind::InvalidRecipient,
    )));
    h.add_contacts(9, "r");

    let source = h.enqueuer.create_campaign(h.campaign("r")).await.unwrap();
    let dispatcher = h.dispatcher(DispatchConfig::default(), "w-requeue");
    while dispatcher.process_one().await.unwrap() != DispatchOutcome::Idle {}

    let finished = h.store.get_campaign(source.id).await.unwrap().unwrap();
    assert_eq!(finished.status, CampaignStatus::PartialFailure);
    assert_eq!(finished.error_count, 3);

    let retry_template = template(h.tenant_id, "Retry {{1}} {{2}}");
    h.directory.add_template(retry_template.clone());

    let requeued = h
        .admin
        .requeue(source.id, RequeueScope::Failed, Some(retry_template.id))
        .await
        .unwrap();
    assert_eq!(requeued.requeue_of, Some(source.id));
    assert_eq!(requeued.template_id, retry_template.id);
    assert_eq!(requeued.total_items, 3);

    let failed = h
        .store
        .list_deliveries(source.id, Some(broadcastflow::campaigns::DeliveryOutcome::Failed), 10)
        .await
        .unwrap();
    let items = queued_items(&h);
    assert_eq!(items.len(), 3);
    for item in &items {
        let original = failed
            .iter()
            .find(|d| d.recipient_id == item.recipient_id)
            .expect("requeued recipient failed before");
        assert_eq!(item.variables, original.variables, "stored values are reused");
        assert_eq!(item.template_id, retry_template.id);
    }

    let all = h
        .admin
        .requeue(source.id, RequeueScope::All, None)
        .await
        .unwrap();
    assert_eq!(all.total_items, 9);
}

#[tokio::test]
async fn requeue_of_unknown_campaign_is_rejected() {
    let h = harness();
    let err = h
        .enqueuer
        .requeue(Uuid::new_v4(), RequeueScope::All, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EnqueueError::Validation {
            campaign_id: None,
            source: ValidationError::CampaignNotFound(_),
        }
    ));
    assert!(h.store.list_campaigns(None, 10).await.unwrap().is_empty());
}
