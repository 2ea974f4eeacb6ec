//! Message bus abstraction
//!
//! Components talk to each other only through named addresses:
//! - **request**: one message in, exactly one reply (or failure) out
//! - **publish**: fire-and-forget; reaches the served handler and every subscriber
//! - **serve**: register the handler answering an address
//! - **subscribe**: stream of every message published to an address
//!
//! `NatsBus` carries this over NATS subjects, `LocalBus` inside one process.

pub mod local;
pub mod nats;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::types::Result;

pub use local::LocalBus;
pub use nats::NatsBus;

/// Answers requests arriving on one address
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, body: Value) -> Result<Value>;
}

/// Handler shared between the bus and its owner
pub type SharedHandler = Arc<dyn RequestHandler>;

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, body: Value) -> Result<Value> {
        (self.0)(body).await
    }
}

/// Wrap an async closure as a [`RequestHandler`]
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Addressed request/reply and publish/subscribe transport
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send `body` to `address` and wait for its single reply.
    ///
    /// A failure reply from the handler comes back as
    /// [`BusError::Remote`](crate::types::BusError::Remote) carrying its message.
    async fn request(&self, address: &str, body: Value) -> Result<Value>;

    /// Deliver `body` to `address` without waiting for a reply
    async fn publish(&self, address: &str, body: Value) -> Result<()>;

    /// Answer requests on `address` with `handler`
    async fn serve(&self, address: &str, handler: SharedHandler) -> Result<()>;

    /// Stream every message published to `address` from now on
    async fn subscribe(&self, address: &str) -> Result<BoxStream<'static, Value>>;

    /// Stop serving and release subscriptions
    async fn shutdown(&self) -> Result<()>;
}
