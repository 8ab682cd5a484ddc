pub mod admin;
pub mod api;
pub mod audience;
pub mod campaigns;
pub mod channel;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod enqueuer;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod ratelimit;
pub mod speed;

use std::{future::Future, pin::Pin};

/// Boxed `Send` future returned by the collaborator traits so they stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub fn boxed<'a, T>(fut: impl Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}
