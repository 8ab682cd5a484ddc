use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Delivery, PartitionKey, WorkChannel};
use crate::campaigns::WorkItem;
use crate::error::InfraError;
use crate::{boxed, BoxFuture};

#[derive(Debug, Clone)]
struct Queued {
    item: WorkItem,
    run_at: Instant,
}

#[derive(Debug)]
struct Leased {
    delivery: Delivery,
    seq: u64,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    partitions: Vec<BTreeMap<u64, Queued>>,
    in_flight: HashMap<(Uuid, String), Leased>,
    acked: u64,
    unavailable: bool,
}

/// In-process channel with the same leasing rules as [`super::PgChannel`].
///
/// Publishing the same item twice is allowed and models a broker redelivery.
pub struct MemoryChannel {
    key: PartitionKey,
    lease: Duration,
    inner: Mutex<Inner>,
}

impl MemoryChannel {
    pub fn new(partitions: u32, key: PartitionKey) -> Self {
        let partitions = partitions.max(1) as usize;
        Self {
            key,
            lease: Duration::from_secs(30),
            inner: Mutex::new(Inner {
                partitions: vec![BTreeMap::new(); partitions],
                ..Inner::default()
            }),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Simulates an unreachable broker.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn queued_len(&self) -> usize {
        self.lock().partitions.iter().map(BTreeMap::len).sum()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn acked_count(&self) -> u64 {
        self.lock().acked
    }

    /// Queued items of one partition, in claim order.
    pub fn partition_snapshot(&self, partition: u32) -> Vec<WorkItem> {
        self.lock()
            .partitions
            .get(partition as usize)
            .map(|q| q.values().map(|e| e.item.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guard(&self) -> Result<MutexGuard<'_, Inner>, InfraError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(InfraError::Unavailable("channel"));
        }
        Ok(inner)
    }
}

impl WorkChannel for MemoryChannel {
    fn partition_count(&self) -> u32 {
        self.lock().partitions.len() as u32
    }

    fn publish<'a>(&'a self, items: &'a [WorkItem]) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(async move {
            let now = Instant::now();
            let mut inner = self.guard()?;
            let count = inner.partitions.len() as u32;
            for item in items {
                let partition = self.key.partition_of(item, count) as usize;
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.partitions[partition].insert(
                    seq,
                    Queued {
                        item: item.clone(),
                        run_at: now,
                    },
                );
            }
            Ok(())
        })
    }

    fn claim<'a>(
        &'a self,
        partitions: &'a [u32],
        worker_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Delivery>, InfraError>> {
        boxed(async move {
            let now = Instant::now();
            let mut inner = self.guard()?;

            let mut best: Option<(u64, u32)> = None;
            for &p in partitions {
                let Some(queue) = inner.partitions.get(p as usize) else {
                    continue;
                };
                let head = queue.iter().find(|(_, e)| e.run_at <= now).map(|(s, _)| *s);
                if let Some(seq) = head {
                    if best.map_or(true, |(b, _)| seq < b) {
                        best = Some((seq, p));
                    }
                }
            }

            let Some((seq, partition)) = best else {
                return Ok(None);
            };
            let Some(entry) = inner.partitions[partition as usize].remove(&seq) else {
                return Ok(None);
            };

            let delivery = Delivery {
                item: entry.item,
                partition,
                worker_id: worker_id.to_string(),
            };
            inner.in_flight.insert(
                (delivery.item.id, delivery.worker_id.clone()),
                Leased {
                    delivery: delivery.clone(),
                    seq,
                    deadline: now + self.lease,
                },
            );
            Ok(Some(delivery))
        })
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<bool, InfraError>> {
        boxed(async move {
            let mut inner = self.guard()?;
            let retired = inner
                .in_flight
                .remove(&(delivery.item.id, delivery.worker_id.clone()))
                .is_some();
            if retired {
                inner.acked += 1;
            }
            Ok(retired)
        })
    }

    fn retry_later<'a>(
        &'a self,
        delivery: &'a Delivery,
        delay: Duration,
    ) -> BoxFuture<'a, Result<(), InfraError>> {
        boxed(async move {
            let now = Instant::now();
            let mut inner = self.guard()?;
            let Some(leased) = inner
                .in_flight
                .remove(&(delivery.item.id, delivery.worker_id.clone()))
            else {
                return Ok(());
            };

            let mut item = leased.delivery.item;
            item.attempt += 1;
            let partition = leased.delivery.partition as usize;
            inner.partitions[partition].insert(
                leased.seq,
                Queued {
                    item,
                    run_at: now + delay,
                },
            );
            Ok(())
        })
    }

    fn reclaim_expired<'a>(&'a self) -> BoxFuture<'a, Result<u64, InfraError>> {
        boxed(async move {
            let now = Instant::now();
            let mut inner = self.guard()?;
            let expired: Vec<(Uuid, String)> = inner
                .in_flight
                .iter()
                .filter(|(_, l)| l.deadline <= now)
                .map(|(k, _)| k.clone())
                .collect();

            for key in &expired {
                if let Some(leased) = inner.in_flight.remove(key) {
                    let partition = leased.delivery.partition as usize;
                    inner.partitions[partition].insert(
                        leased.seq,
                        Queued {
                            item: leased.delivery.item,
                            run_at: now,
                        },
                    );
                }
            }
            Ok(expired.len() as u64)
        })
    }

    fn purge_campaign<'a>(&'a self, campaign_id: Uuid) -> BoxFuture<'a, Result<u64, InfraError>> {
        boxed(async move {
            let mut inner = self.guard()?;
            let mut purged = 0_u64;
            for queue in inner.partitions.iter_mut() {
                let before = queue.len();
                queue.retain(|_, e| e.item.campaign_id != campaign_id);
                purged += (before - queue.len()) as u64;
            }
            Ok(purged)
        })
    }
}
