//! In-process message bus
//!
//! Handlers live in a map keyed by address; published messages fan out over
//! a broadcast channel per address. Replies go through the same
//! [`ReplyEnvelope`] framing as the NATS transport, so failures surface as
//! [`BusError::Remote`] on both.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{MessageBus, SharedHandler};
use crate::messages::ReplyEnvelope;
use crate::types::{BusError, Result};

/// Default time to wait for a reply
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages buffered per subscribed address before slow subscribers lag
const TOPIC_CAPACITY: usize = 256;

/// Single-process [`MessageBus`]
pub struct LocalBus {
    handlers: DashMap<String, SharedHandler>,
    topics: DashMap<String, broadcast::Sender<Value>>,
    request_timeout: Duration,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            topics: DashMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the time to wait for a reply
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Whether `address` has a handler
    pub fn is_served(&self, address: &str) -> bool {
        self.handlers.contains_key(address)
    }

    fn handler(&self, address: &str) -> Option<SharedHandler> {
        self.handlers.get(address).map(|h| h.value().clone())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn request(&self, address: &str, body: Value) -> Result<Value> {
        let handler = self
            .handler(address)
            .ok_or_else(|| BusError::Bus(format!("No handler registered for {}", address)))?;

        let result = tokio::time::timeout(self.request_timeout, handler.handle(body))
            .await
            .map_err(|_| BusError::Bus(format!("Request to {} timed out", address)))?;

        ReplyEnvelope::from_result(result).into_result()
    }

    async fn publish(&self, address: &str, body: Value) -> Result<()> {
        if let Some(sender) = self.topics.get(address) {
            // No live receivers is not an error for fire-and-forget
            let _ = sender.send(body.clone());
        }

        if let Some(handler) = self.handler(address) {
            let address = address.to_string();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(body).await {
                    warn!(address = %address, error = %e, "Handler for published message failed");
                }
            });
        }
        Ok(())
    }

    async fn serve(&self, address: &str, handler: SharedHandler) -> Result<()> {
        if self.handlers.contains_key(address) {
            return Err(BusError::Bus(format!("Address {} is already served", address)));
        }
        self.handlers.insert(address.to_string(), handler);
        info!(address = %address, "Serving address");
        Ok(())
    }

    async fn subscribe(&self, address: &str) -> Result<BoxStream<'static, Value>> {
        let receiver = self
            .topics
            .entry(address.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();
        debug!(address = %address, "Subscribed");

        let address = address.to_string();
        Ok(stream::unfold((receiver, address), |(mut rx, address)| async move {
            loop {
                match rx.recv().await {
                    Ok(value) => return Some((value, (rx, address))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(address = %address, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }

    async fn shutdown(&self) -> Result<()> {
        self.handlers.clear();
        self.topics.clear();
        info!("Local bus shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler_fn;
    use serde_json::json;

    fn echo() -> SharedHandler {
        handler_fn(|body| async move { Ok(json!({ "echo": body })) })
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = LocalBus::new();
        bus.serve("echo", echo()).await.unwrap();
        let reply = bus.request("echo", json!(1)).await.unwrap();
        assert_eq!(reply, json!({ "echo": 1 }));
    }

    #[tokio::test]
    async fn test_request_without_handler_fails() {
        let bus = LocalBus::new();
        let err = bus.request("nowhere", json!({})).await.unwrap_err();
        assert!(matches!(err, BusError::Bus(_)));
    }

    #[tokio::test]
    async fn test_handler_failure_is_remote() {
        let bus = LocalBus::new();
        bus.serve(
            "fail",
            handler_fn(|_| async { Err(BusError::Database("down".into())) }),
        )
        .await
        .unwrap();

        let err = bus.request("fail", json!({})).await.unwrap_err();
        assert!(matches!(err, BusError::Remote(ref m) if m == "Database error: down"));
    }

    #[tokio::test]
    async fn test_serve_twice_rejected() {
        let bus = LocalBus::new();
        bus.serve("echo", echo()).await.unwrap();
        assert!(bus.serve("echo", echo()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let bus = LocalBus::new().with_timeout(Duration::from_millis(50));
        bus.serve(
            "slow",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Value::Null)
            }),
        )
        .await
        .unwrap();

        let err = bus.request("slow", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_handler() {
        let bus = LocalBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.serve(
            "topic",
            handler_fn(move |body| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body);
                    Ok(Value::Null)
                }
            }),
        )
        .await
        .unwrap();
        let mut first = bus.subscribe("topic").await.unwrap();
        let mut second = bus.subscribe("topic").await.unwrap();

        bus.publish("topic", json!({ "n": 1 })).await.unwrap();

        assert_eq!(first.next().await, Some(json!({ "n": 1 })));
        assert_eq!(second.next().await, Some(json!({ "n": 1 })));
        assert_eq!(rx.recv().await, Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn test_publish_without_listeners_is_ok() {
        let bus = LocalBus::new();
        bus.publish("void", json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("topic").await.unwrap();
        bus.shutdown().await.unwrap();
        assert_eq!(sub.next().await, None);
    }
}
