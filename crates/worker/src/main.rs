use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use broadcastflow::admin::Admin;
use broadcastflow::api;
use broadcastflow::audience::PgDirectory;
use broadcastflow::campaigns::PgCampaignStore;
use broadcastflow::channel::{PgChannel, WorkChannel};
use broadcastflow::config::{Config, LimiterKind};
use broadcastflow::db;
use broadcastflow::dispatch::{Dispatcher, WorkerPool};
use broadcastflow::enqueuer::Enqueuer;
use broadcastflow::gateway::{HttpGateway, HttpGatewayConfig};
use broadcastflow::logging;
use broadcastflow::ratelimit::{PgRateLimiter, RateLimiter, SlidingWindowLimiter};

const ACKED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env(std::env::args().nth(1));
    logging::init(cfg.log_format);

    let topic = cfg.topic()?.to_string();
    let identity = cfg.identity.clone();
    let partitions = cfg.owned_partitions();

    tracing::info!(
        worker_id = %identity.worker_id,
        worker_index = identity.index,
        worker_count = cfg.worker_count,
        topic = %topic,
        concurrency = cfg.concurrency,
        partitions = ?partitions,
        rate_limiter = ?cfg.rate_limiter,
        admin_api = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "broadcast worker starting"
    );

    let pool = db::make_pool(cfg.database_url()?, &cfg.pool).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store = Arc::new(PgCampaignStore::new(pool.clone()));
    let directory = Arc::new(PgDirectory::new(pool.clone()));
    let pg_channel = Arc::new(PgChannel::new(
        pool.clone(),
        topic.clone(),
        cfg.channel.partitions,
        cfg.channel.partition_key,
        cfg.channel.lease,
    ));
    let channel: Arc<dyn WorkChannel> = pg_channel.clone();

    let limiter: Arc<dyn RateLimiter> = match cfg.rate_limiter {
        LimiterKind::Local => {
            if cfg.worker_count > 1 {
                tracing::warn!(
                    worker_count = cfg.worker_count,
                    "process-local rate limiter with several workers: tenant ceilings apply per process"
                );
            }
            Arc::new(SlidingWindowLimiter::new())
        }
        LimiterKind::Shared => Arc::new(PgRateLimiter::new(pool.clone())),
    };

    let gateway = Arc::new(HttpGateway::new(
        HttpGatewayConfig {
            base_url: cfg.gateway.base_url.clone(),
            access_token: cfg
                .gateway
                .access_token
                .clone()
                .context("BCAST_GATEWAY_TOKEN is missing")?,
            sender_id: cfg
                .gateway
                .sender_id
                .clone()
                .context("BCAST_GATEWAY_SENDER_ID is missing")?,
            timeout: cfg.dispatch.send_timeout,
        },
        directory.clone(),
    )?);

    let dispatcher = Arc::new(Dispatcher::new(
        channel.clone(),
        store.clone(),
        limiter,
        gateway,
        cfg.dispatch.clone(),
        identity.worker_id.clone(),
        partitions,
    ));

    let enqueuer = Arc::new(Enqueuer::new(
        store.clone(),
        directory.clone(),
        directory,
        channel.clone(),
    ));
    let admin = Arc::new(Admin::new(
        store.clone(),
        channel,
        enqueuer.clone(),
        cfg.dispatch.default_messages_per_second,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- API task ----
    let app = api::router(api::ApiState {
        store,
        enqueuer,
        admin,
    });
    let api_addr = cfg.admin_addr.clone();
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("admin api listening on http://{addr}");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Acked item pruning ----
    let prune_handle = {
        let pg_channel = pg_channel.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                match pg_channel.prune_acked(ACKED_RETENTION).await {
                    Ok(n) if n > 0 => tracing::info!(pruned = n, "pruned acknowledged work items"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "pruning acknowledged work items failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(300)) => {}
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    // ---- Dispatch pool ----
    let mut pool_handle = tokio::spawn(
        WorkerPool::new(dispatcher, cfg.concurrency)
            .with_maintenance_interval(cfg.channel.lease / 2)
            .run(shutdown_rx),
    );

    tokio::select! {
        res = api_handle => {
            res??;
        }
        res = &mut pool_handle => {
            res?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested, finishing in-flight items");
            let _ = shutdown_tx.send(true);
            pool_handle.await?;
        }
    }

    let _ = shutdown_tx.send(true);
    prune_handle.await?;
    Ok(())
}
