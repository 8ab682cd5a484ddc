//! Partitioned durable channel between the enqueuer and the worker pool.
//!
//! Items of one partition are claimed in publish order. A claimed item stays
//! leased to its worker until it is acknowledged, rescheduled, or its lease
//! expires and [`WorkChannel::reclaim_expired`] hands it out again.

pub mod memory;
pub mod pg;

use std::time::Duration;
use uuid::Uuid;

use crate::campaigns::WorkItem;
use crate::error::InfraError;
use crate::BoxFuture;

pub use memory::MemoryChannel;
pub use pg::PgChannel;

/// A leased work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub item: WorkItem,
    pub partition: u32,
    pub worker_id: String,
}

pub trait WorkChannel: Send + Sync {
    fn partition_count(&self) -> u32;

    /// Appends items to their partitions. Either all of `items` are stored or
    /// none are.
    fn publish<'a>(&'a self, items: &'a [WorkItem]) -> BoxFuture<'a, Result<(), InfraError>>;

    /// Leases the oldest runnable item of the given partitions.
    fn claim<'a>(
        &'a self,
        partitions: &'a [u32],
        worker_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Delivery>, InfraError>>;

    /// Exactly-once acknowledgement: true only for the call that retired the lease.
    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<bool, InfraError>>;

    /// Returns the item to its partition with `attempt + 1`, runnable after `delay`.
    fn retry_later<'a>(
        &'a self,
        delivery: &'a Delivery,
        delay: Duration,
    ) -> BoxFuture<'a, Result<(), InfraError>>;

    /// Makes items whose lease has expired claimable again.
    fn reclaim_expired<'a>(&'a self) -> BoxFuture<'a, Result<u64, InfraError>>;

    /// Drops still-queued items of a campaign. Leased items are left alone.
    fn purge_campaign<'a>(&'a self, campaign_id: Uuid) -> BoxFuture<'a, Result<u64, InfraError>>;
}

/// What an item is hashed on to pick its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionKey {
    #[default]
    Recipient,
    Tenant,
}

impl PartitionKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "recipient" => Some(PartitionKey::Recipient),
            "tenant" => Some(PartitionKey::Tenant),
            _ => None,
        }
    }

    pub fn partition_of(&self, item: &WorkItem, partitions: u32) -> u32 {
        let key = match self {
            PartitionKey::Recipient => item.recipient_id,
            PartitionKey::Tenant => item.tenant_id,
        };
        partition_for(key.as_bytes(), partitions)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over `key`, reduced to `[0, partitions)`.
pub fn partition_for(key: &[u8], partitions: u32) -> u32 {
    let partitions = partitions.max(1);
    let hash = key
        .iter()
        .fold(FNV_OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME));
    (hash % u64::from(partitions)) as u32
}

/// Partitions owned by worker `index` of `count`.
pub fn assigned_partitions(index: u32, count: u32, partitions: u32) -> Vec<u32> {
    let count = count.max(1);
    (0..partitions.max(1))
        .filter(|p| p % count == index % count)
        .collect()
}
