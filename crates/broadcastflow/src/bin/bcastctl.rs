use anyhow::Context;
use serde_json::json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use broadcastflow::admin::Admin;
use broadcastflow::audience::{MemoryDirectory, MessageTemplate, PgDirectory};
use broadcastflow::campaigns::{
    AudienceSpec, CampaignStore, DeliveryOutcome, MemoryCampaignStore, NewCampaign,
    PgCampaignStore,
};
use broadcastflow::channel::{assigned_partitions, MemoryChannel, PgChannel, WorkChannel};
use broadcastflow::config::Config;
use broadcastflow::db;
use broadcastflow::dispatch::{DispatchConfig, Dispatcher, WorkerPool};
use broadcastflow::enqueuer::Enqueuer;
use broadcastflow::gateway::{GatewayErrorKind, LoopbackGateway};
use broadcastflow::logging;
use broadcastflow::ratelimit::SlidingWindowLimiter;
use broadcastflow::speed::{CounterSnapshot, Speed, SpeedSampler};

const USAGE: &str = "bcastctl <command>\n\
Commands:\n\
- migrate\n\
- reset\n\
- seed <n> [mps]\n\
- create <tenant_id> <template_id> <tag>...\n\
- status <campaign_id>\n\
- watch <campaign_id>\n\
- cancel <campaign_id>\n\
- set-rate <tenant_id> <mps>\n\
- deliveries <campaign_id> [sent|failed]\n\
- simulate <recipients> <mps> <concurrency> [fail_every]\n\
\n\
Uses DATABASE_URL (all commands except simulate).\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let cfg = Config::from_env(None);
    logging::init(cfg.log_format);

    if command == "simulate" {
        let recipients: usize = arg(&args, 2).and_then(|s| s.parse().ok()).unwrap_or(1000);
        let mps: u32 = arg(&args, 3).and_then(|s| s.parse().ok()).unwrap_or(80);
        let concurrency: usize = arg(&args, 4).and_then(|s| s.parse().ok()).unwrap_or(10);
        let fail_every: u64 = arg(&args, 5).and_then(|s| s.parse().ok()).unwrap_or(0);
        return simulate(recipients, mps, concurrency, fail_every).await;
    }

    let pool = db::make_pool(cfg.database_url()?, &cfg.pool).await?;
    let ctl = Ctl::new(pool, &cfg);

    match command.as_str() {
        "migrate" => {
            db::run_migrations(&ctl.pool).await?;
            println!("migrations applied");
        }
        "reset" => {
            db::truncate_all(&ctl.pool).await?;
            println!("reset OK");
        }
        "seed" => {
            let n: usize = arg(&args, 2).and_then(|s| s.parse().ok()).unwrap_or(10);
            let mps: Option<i32> = arg(&args, 3).and_then(|s| s.parse().ok());
            ctl.seed(n, mps).await?;
        }
        "create" => {
            let tenant_id: Uuid = required(&args, 2, "create <tenant_id> <template_id> <tag>...")?;
            let template_id: Uuid = required(&args, 3, "create <tenant_id> <template_id> <tag>...")?;
            let tag_ids: Vec<String> = args.iter().skip(4).cloned().collect();
            let job = ctl
                .enqueuer
                .create_campaign(NewCampaign {
                    tenant_id,
                    template_id,
                    audience: AudienceSpec::Tags { tag_ids },
                    variable_mappings: Vec::new(),
                    requeue_of: None,
                })
                .await?;
            println!("campaign {} status={} total_items={}", job.id, job.status, job.total_items);
        }
        "status" => {
            let id: Uuid = required(&args, 2, "status <campaign_id>")?;
            let report = ctl.admin.campaign_report(id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "watch" => {
            let id: Uuid = required(&args, 2, "watch <campaign_id>")?;
            watch_campaign(ctl.store.as_ref(), id).await?;
        }
        "cancel" => {
            let id: Uuid = required(&args, 2, "cancel <campaign_id>")?;
            let report = ctl.admin.cancel_campaign(id).await?;
            println!(
                "campaign {} cancelled (was {}), purged {} queued items",
                report.campaign_id, report.previous_status, report.purged_items
            );
        }
        "set-rate" => {
            let tenant_id: Uuid = required(&args, 2, "set-rate <tenant_id> <mps>")?;
            let mps: i64 = required(&args, 3, "set-rate <tenant_id> <mps>")?;
            let applied = ctl.admin.set_messages_per_second(tenant_id, mps).await?;
            println!("tenant {tenant_id} messages_per_second={applied}");
        }
        "deliveries" => {
            let id: Uuid = required(&args, 2, "deliveries <campaign_id> [sent|failed]")?;
            let outcome = arg(&args, 3).and_then(DeliveryOutcome::parse);
            for d in ctl.store.list_deliveries(id, outcome, 500).await? {
                let detail = match (&d.provider_message_id, &d.error_code) {
                    (Some(message_id), _) => message_id.clone(),
                    (None, Some(code)) => {
                        format!("{code}: {}", d.error_message.as_deref().unwrap_or(""))
                    }
                    (None, None) => String::new(),
                };
                println!(
                    "{} {} {} attempt={} {}",
                    d.created_at.format("%H:%M:%S%.3f"),
                    d.outcome.as_str(),
                    d.channel_address,
                    d.attempt,
                    detail
                );
            }
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn arg(args: &[String], i: usize) -> Option<&str> {
    args.get(i).map(String::as_str)
}

fn required<T>(args: &[String], i: usize, usage: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = arg(args, i).with_context(|| format!("usage: bcastctl {usage}"))?;
    raw.parse::<T>()
        .with_context(|| format!("invalid argument {raw:?}; usage: bcastctl {usage}"))
}

struct Ctl {
    pool: PgPool,
    store: Arc<PgCampaignStore>,
    directory: PgDirectory,
    enqueuer: Arc<Enqueuer>,
    admin: Admin,
}

impl Ctl {
    fn new(pool: PgPool, cfg: &Config) -> Self {
        let store = Arc::new(PgCampaignStore::new(pool.clone()));
        let directory = PgDirectory::new(pool.clone());
        let channel: Arc<dyn WorkChannel> = Arc::new(PgChannel::new(
            pool.clone(),
            cfg.topic.clone().unwrap_or_else(|| "broadcast".to_string()),
            cfg.channel.partitions,
            cfg.channel.partition_key,
            cfg.channel.lease,
        ));
        let enqueuer = Arc::new(Enqueuer::new(
            store.clone(),
            Arc::new(directory.clone()),
            Arc::new(directory.clone()),
            channel.clone(),
        ));
        let admin = Admin::new(
            store.clone(),
            channel,
            enqueuer.clone(),
            cfg.dispatch.default_messages_per_second,
        );

        Self {
            pool,
            store,
            directory,
            enqueuer,
            admin,
        }
    }

    /// One tenant, one approved template and `n` contacts tagged `seed`.
    async fn seed(&self, n: usize, mps: Option<i32>) -> anyhow::Result<()> {
        let tenant_id = Uuid::new_v4();
        self.directory.upsert_tenant(tenant_id, "seed tenant", mps).await?;

        let template = MessageTemplate {
            id: Uuid::new_v4(),
            tenant_id,
            name: "seed_greeting".to_string(),
            language: "en_US".to_string(),
            header: None,
            body: "Hello {{1}}, your code is {{2}}".to_string(),
            approved: true,
        };
        self.directory.insert_template(&template).await?;

        let tags = vec!["seed".to_string()];
        for i in 0..n {
            self.directory
                .insert_contact(
                    tenant_id,
                    &format!("+1555{:07}", i),
                    json!({ "variable1": format!("contact {i}"), "variable2": format!("{:06}", i) }),
                    &tags,
                )
                .await?;
        }

        println!("tenant={tenant_id} template={} contacts={n} tag=seed", template.id);
        Ok(())
    }
}

/// Polls every 2 seconds until the campaign is terminal.
async fn watch_campaign(store: &dyn CampaignStore, id: Uuid) -> anyhow::Result<()> {
    let mut sampler = SpeedSampler::new();
    loop {
        let job = store
            .get_campaign(id)
            .await?
            .with_context(|| format!("campaign {id} not found"))?;
        let instant = sampler.observe(CounterSnapshot::of(&job, chrono::Utc::now()));

        match (job.status.is_terminal(), instant) {
            (true, _) => {
                let avg = Speed::average(&job).unwrap_or_default();
                println!(
                    "{} {}/{} success={} error={} avg sending={:.1}/s accepting={:.1}/s",
                    job.status,
                    job.processed(),
                    job.total_items,
                    job.success_count,
                    job.error_count,
                    avg.sending,
                    avg.accepting
                );
                return Ok(());
            }
            (false, Some(speed)) => println!(
                "{} {}/{} success={} error={} sending={:.1}/s accepting={:.1}/s",
                job.status,
                job.processed(),
                job.total_items,
                job.success_count,
                job.error_count,
                speed.sending,
                speed.accepting
            ),
            (false, None) => println!(
                "{} {}/{} success={} error={}",
                job.status,
                job.processed(),
                job.total_items,
                job.success_count,
                job.error_count
            ),
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Whole pipeline in memory with the loopback gateway.
async fn simulate(
    recipients: usize,
    mps: u32,
    concurrency: usize,
    fail_every: u64,
) -> anyhow::Result<()> {
    let tenant_id = Uuid::new_v4();
    let directory = Arc::new(MemoryDirectory::new());
    let template = MessageTemplate {
        id: Uuid::new_v4(),
        tenant_id,
        name: "simulation".to_string(),
        language: "en_US".to_string(),
        header: None,
        body: "Hi {{1}}".to_string(),
        approved: true,
    };
    directory.add_template(template.clone());
    for i in 0..recipients {
        let attrs = BTreeMap::from([("variable1".to_string(), format!("r{i}"))]);
        directory.add_contact(tenant_id, &format!("+4470{:08}", i), attrs, &["sim"]);
    }

    let store = Arc::new(MemoryCampaignStore::new());
    store.set_tenant_rate(tenant_id, mps.max(1)).await?;
    let channel = Arc::new(MemoryChannel::new(16, Default::default()));
    let gateway = Arc::new(LoopbackGateway::failing_every(fail_every, GatewayErrorKind::InvalidRecipient));

    let dispatcher = Arc::new(Dispatcher::new(
        channel.clone(),
        store.clone(),
        Arc::new(SlidingWindowLimiter::new()),
        gateway.clone(),
        DispatchConfig::default(),
        format!("pid-{}", std::process::id()),
        assigned_partitions(0, 1, 16),
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let pool = tokio::spawn(
        WorkerPool::new(dispatcher, concurrency)
            .with_idle_backoff(Duration::from_millis(20))
            .run(stop_rx),
    );

    let enqueuer = Enqueuer::new(store.clone(), directory.clone(), directory, channel);
    let started = Instant::now();
    let job = enqueuer
        .create_campaign(NewCampaign {
            tenant_id,
            template_id: template.id,
            audience: AudienceSpec::Tags {
                tag_ids: vec!["sim".to_string()],
            },
            variable_mappings: Vec::new(),
            requeue_of: None,
        })
        .await?;
    println!("campaign {} total_items={} mps={mps} concurrency={concurrency}", job.id, job.total_items);

    watch_campaign(store.as_ref(), job.id).await?;

    let _ = stop_tx.send(true);
    pool.await?;

    println!(
        "duration={:.2}s gateway_calls={}",
        started.elapsed().as_secs_f64(),
        gateway.call_count()
    );
    Ok(())
}
