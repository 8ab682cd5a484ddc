use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::{DispatchOutcome, Dispatcher};

/// Runs `concurrency` dispatch loops plus a maintenance loop until shutdown.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    concurrency: usize,
    idle_backoff: Duration,
    max_error_backoff: Duration,
    maintenance_interval: Duration,
}

impl WorkerPool {
    pub fn new(dispatcher: Arc<Dispatcher>, concurrency: usize) -> Self {
        Self {
            dispatcher,
            concurrency: concurrency.max(1),
            idle_backoff: Duration::from_millis(250),
            max_error_backoff: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(15),
        }
    }

    pub fn with_idle_backoff(mut self, idle: Duration) -> Self {
        self.idle_backoff = idle;
        self
    }

    /// How often expired leases are reclaimed and limiter state is purged.
    /// Typically half the lease.
    pub fn with_maintenance_interval(mut self, every: Duration) -> Self {
        self.maintenance_interval = every;
        self
    }

    pub fn with_max_error_backoff(mut self, cap: Duration) -> Self {
        self.max_error_backoff = cap;
        self
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        tracing::info!(
            worker_id = %self.dispatcher.worker_id(),
            concurrency = self.concurrency,
            partitions = ?self.dispatcher.partitions(),
            "worker pool starting"
        );

        for slot in 0..self.concurrency {
            tasks.spawn(dispatch_loop(
                slot,
                self.dispatcher.clone(),
                self.idle_backoff,
                self.max_error_backoff,
                shutdown.clone(),
            ));
        }
        tasks.spawn(maintenance_loop(
            self.dispatcher.clone(),
            self.maintenance_interval,
            shutdown.clone(),
        ));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(alert = true, error = %e, "dispatch task aborted");
            }
        }

        tracing::info!(worker_id = %self.dispatcher.worker_id(), "worker pool stopped");
    }
}

/// Sleeps for `d` or until shutdown is signalled. Returns true on shutdown.
async fn pause(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn dispatch_loop(
    slot: usize,
    dispatcher: Arc<Dispatcher>,
    idle_backoff: Duration,
    max_error_backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut error_backoff = Duration::from_millis(100);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match dispatcher.process_one().await {
            Ok(DispatchOutcome::Idle) => {
                if pause(idle_backoff, &mut shutdown).await {
                    break;
                }
            }
            Ok(_) => {
                error_backoff = Duration::from_millis(100);
            }
            Err(e) => {
                tracing::error!(
                    alert = true,
                    worker_id = %dispatcher.worker_id(),
                    slot,
                    error = %e,
                    backoff_ms = error_backoff.as_millis() as u64,
                    "infrastructure error, consumption paused"
                );
                if pause(error_backoff, &mut shutdown).await {
                    break;
                }
                error_backoff = (error_backoff * 2).min(max_error_backoff);
            }
        }
    }
}

async fn maintenance_loop(
    dispatcher: Arc<Dispatcher>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if pause(every, &mut shutdown).await {
            break;
        }

        match dispatcher.channel().reclaim_expired().await {
            Ok(n) if n > 0 => tracing::info!(reclaimed = n, "returned expired leases to their partitions"),
            Ok(_) => {}
            Err(e) => tracing::error!(alert = true, error = %e, "lease reclaim failed"),
        }

        if let Err(e) = dispatcher.limiter().purge_expired().await {
            tracing::warn!(error = %e, "rate limiter purge failed");
        }
    }
}
