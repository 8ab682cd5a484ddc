#![allow(dead_code)]

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use broadcastflow::admin::Admin;
use broadcastflow::audience::{MemoryDirectory, MessageTemplate};
use broadcastflow::campaigns::{
    AudienceSpec, CampaignJob, CampaignStore, MemoryCampaignStore, NewCampaign, WorkItem,
};
use broadcastflow::channel::{assigned_partitions, MemoryChannel, PartitionKey};
use broadcastflow::dispatch::{DispatchConfig, Dispatcher, WorkerPool};
use broadcastflow::enqueuer::Enqueuer;
use broadcastflow::gateway::Gateway;
use broadcastflow::ratelimit::SlidingWindowLimiter;

pub const PARTITIONS: u32 = 8;

/// Connects to `TEST_DATABASE_URL`, migrates and truncates. `None` (test
/// skipped) when the variable is not set.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping Postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    broadcastflow::db::run_migrations(&pool)
        .await
        .expect("migrations failed");
    broadcastflow::db::truncate_all(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

pub fn template(tenant_id: Uuid, body: &str) -> MessageTemplate {
    MessageTemplate {
        id: Uuid::new_v4(),
        tenant_id,
        name: "order_update".to_string(),
        language: "en_US".to_string(),
        header: None,
        body: body.to_string(),
        approved: true,
    }
}

pub fn work_item(campaign_id: Uuid, tenant_id: Uuid) -> WorkItem {
    WorkItem {
        id: Uuid::new_v4(),
        campaign_id,
        tenant_id,
        recipient_id: Uuid::new_v4(),
        channel_address: "+15550001111".to_string(),
        template_id: Uuid::new_v4(),
        variables: BTreeMap::new(),
        attempt: 1,
    }
}

pub fn fast_retries() -> DispatchConfig {
    let mut cfg = DispatchConfig::default();
    cfg.retry.base = Duration::from_millis(10);
    cfg.retry.max = Duration::from_millis(100);
    cfg.retry.jitter_pct = 0.0;
    cfg
}

pub struct RunningPool {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunningPool {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        self.handle.await.expect("pool task panicked");
    }
}

/// The whole pipeline wired over the in-memory implementations.
pub struct Harness {
    pub tenant_id: Uuid,
    pub template: MessageTemplate,
    pub directory: Arc<MemoryDirectory>,
    pub store: Arc<MemoryCampaignStore>,
    pub channel: Arc<MemoryChannel>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub gateway: Arc<dyn Gateway>,
    pub enqueuer: Arc<Enqueuer>,
    pub admin: Arc<Admin>,
}

impl Harness {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self::with_lease(gateway, Duration::from_secs(30))
    }

    pub fn with_lease(gateway: Arc<dyn Gateway>, lease: Duration) -> Self {
        let tenant_id = Uuid::new_v4();
        let template = template(tenant_id, "Hi {{1}}, order {{2}} shipped");

        let directory = Arc::new(MemoryDirectory::new());
        directory.add_template(template.clone());

        let store = Arc::new(MemoryCampaignStore::new());
        let channel =
            Arc::new(MemoryChannel::new(PARTITIONS, PartitionKey::Recipient).with_lease(lease));
        let limiter = Arc::new(SlidingWindowLimiter::new());

        let enqueuer = Arc::new(Enqueuer::new(
            store.clone(),
            directory.clone(),
            directory.clone(),
            channel.clone(),
        ));
        let admin = Arc::new(Admin::new(store.clone(), channel.clone(), enqueuer.clone(), 80));

        Self {
            tenant_id,
            template,
            directory,
            store,
            channel,
            limiter,
            gateway,
            enqueuer,
            admin,
        }
    }

    /// `n` reachable contacts carrying `tag`, with `variable1`/`variable2` set.
    pub fn add_contacts(&self, n: usize, tag: &str) -> Vec<Uuid> {
        (0..n)
            .map(|i| {
                let attrs = BTreeMap::from([
                    ("variable1".to_string(), format!("Contact {i}")),
                    ("variable2".to_string(), format!("A-{i:05}")),
                ]);
                self.directory
                    .add_contact(self.tenant_id, &format!("+1 (555) {i:07}"), attrs, &[tag])
            })
            .collect()
    }

    pub fn campaign(&self, tag: &str) -> NewCampaign {
        NewCampaign {
            tenant_id: self.tenant_id,
            template_id: self.template.id,
            audience: AudienceSpec::Tags {
                tag_ids: vec![tag.to_string()],
            },
            variable_mappings: Vec::new(),
            requeue_of: None,
        }
    }

    pub async fn set_rate(&self, mps: u32) {
        self.store.set_tenant_rate(self.tenant_id, mps).await.unwrap();
    }

    pub fn dispatcher(&self, cfg: DispatchConfig, worker_id: &str) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            self.channel.clone(),
            self.store.clone(),
            self.limiter.clone(),
            self.gateway.clone(),
            cfg,
            worker_id,
            assigned_partitions(0, 1, PARTITIONS),
        ))
    }

    pub fn start_pool(&self, concurrency: usize, cfg: DispatchConfig) -> RunningPool {
        let (stop, rx) = watch::channel(false);
        let pool = WorkerPool::new(self.dispatcher(cfg, "worker-test"), concurrency)
            .with_idle_backoff(Duration::from_millis(5))
            .with_max_error_backoff(Duration::from_millis(200))
            .with_maintenance_interval(Duration::from_secs(1));
        RunningPool {
            stop,
            handle: tokio::spawn(pool.run(rx)),
        }
    }

    /// Polls until the campaign is terminal; panics after `limit`.
    pub async fn wait_terminal(&self, campaign_id: Uuid, limit: Duration) -> CampaignJob {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let job = self
                .store
                .get_campaign(campaign_id)
                .await
                .unwrap()
                .expect("campaign exists");
            if job.status.is_terminal() {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "campaign {campaign_id} still {} after {limit:?} ({}/{})",
                job.status,
                job.processed(),
                job.total_items
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
