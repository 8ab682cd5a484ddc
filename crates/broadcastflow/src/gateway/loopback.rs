use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use super::{Gateway, GatewayError, GatewayErrorKind, SendReceipt, SendRequest};
use crate::{boxed, BoxFuture};

/// Accepts every request, or fails every n-th call with a fixed kind.
/// Call instants are recorded on the tokio clock.
pub struct LoopbackGateway {
    fail_every: Option<(u64, GatewayErrorKind)>,
    calls: AtomicU64,
    sent: Mutex<Vec<(Instant, SendRequest)>>,
}

impl LoopbackGateway {
    pub fn new() -> Self {
        Self {
            fail_every: None,
            calls: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// The n-th, 2n-th, ... call fails with `kind`.
    pub fn failing_every(n: u64, kind: GatewayErrorKind) -> Self {
        Self {
            fail_every: (n > 0).then_some((n, kind)),
            ..Self::new()
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_instants(&self) -> Vec<Instant> {
        self.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn requests(&self) -> Vec<SendRequest> {
        self.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(Instant, SendRequest)>> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LoopbackGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway for LoopbackGateway {
    fn send<'a>(&'a self, request: &'a SendRequest) -> BoxFuture<'a, Result<SendReceipt, GatewayError>> {
        boxed(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.lock().push((Instant::now(), request.clone()));

            if let Some((every, kind)) = self.fail_every {
                if n % every == 0 {
                    return Err(GatewayError::new(kind, format!("loopback failure on call {n}")));
                }
            }

            Ok(SendReceipt {
                provider_message_id: format!("loopback.{n}"),
            })
        })
    }
}
