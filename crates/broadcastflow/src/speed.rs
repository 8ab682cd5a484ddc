//! Throughput derived from counter snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::campaigns::{CampaignJob, CampaignStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub success_count: i64,
    pub error_count: i64,
    pub at: DateTime<Utc>,
}

impl CounterSnapshot {
    pub fn of(job: &CampaignJob, at: DateTime<Utc>) -> Self {
        Self {
            success_count: job.success_count,
            error_count: job.error_count,
            at,
        }
    }

    pub fn processed(&self) -> i64 {
        self.success_count + self.error_count
    }
}

/// Messages per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct Speed {
    /// Sent plus failed.
    pub sending: f64,
    /// Sent only.
    pub accepting: f64,
}

impl Speed {
    /// Rates between two snapshots. `None` when no time has passed between them.
    pub fn between(earlier: &CounterSnapshot, later: &CounterSnapshot) -> Option<Self> {
        let secs = seconds(earlier.at, later.at)?;
        let processed = (later.processed() - earlier.processed()) as f64;
        let accepted = (later.success_count - earlier.success_count) as f64;
        Some(Self {
            sending: processed / secs,
            accepting: accepted / secs,
        })
    }

    /// Average over `[started_at, completed_at]` of a finished campaign.
    pub fn average(job: &CampaignJob) -> Option<Self> {
        let end = job.completed_at?;
        Self::since_start(job, end)
    }

    /// Average from `started_at` up to `now`.
    pub fn since_start(job: &CampaignJob, now: DateTime<Utc>) -> Option<Self> {
        let start = job.started_at?;
        let secs = seconds(start, now)?;
        Some(Self {
            sending: job.processed() as f64 / secs,
            accepting: job.success_count as f64 / secs,
        })
    }
}

fn seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> Option<f64> {
    let ms = (to - from).num_milliseconds();
    (ms > 0).then(|| ms as f64 / 1000.0)
}

/// Keeps the two latest snapshots of one campaign for instantaneous speed.
#[derive(Debug, Default, Clone)]
pub struct SpeedSampler {
    previous: Option<CounterSnapshot>,
    latest: Option<CounterSnapshot>,
}

impl SpeedSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a snapshot and returns the speed since the one before it.
    pub fn observe(&mut self, snapshot: CounterSnapshot) -> Option<Speed> {
        self.previous = self.latest.replace(snapshot);
        self.current()
    }

    pub fn current(&self) -> Option<Speed> {
        Speed::between(self.previous.as_ref()?, self.latest.as_ref()?)
    }
}

/// Operator view of a campaign's progress.
#[derive(Debug, Clone, Serialize)]
pub struct SpeedReport {
    pub status: CampaignStatus,
    pub processed: i64,
    pub total_items: i64,
    /// Average over the whole run for finished campaigns, since start otherwise.
    pub speed: Option<Speed>,
}

impl SpeedReport {
    pub fn for_job(job: &CampaignJob, now: DateTime<Utc>) -> Self {
        let speed = if job.status.is_terminal() {
            Speed::average(job)
        } else {
            Speed::since_start(job, now)
        };
        Self {
            status: job.status,
            processed: job.processed(),
            total_items: job.total_items,
            speed,
        }
    }
}
