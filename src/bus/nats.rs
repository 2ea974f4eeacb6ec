//! NATS transport
//!
//! Addresses map one-to-one onto NATS subjects. Request bodies are plain
//! JSON; replies are [`ReplyEnvelope`] frames so a handler failure reaches
//! the caller with its message intact.

use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{MessageBus, SharedHandler};
use crate::config::NatsArgs;
use crate::messages::ReplyEnvelope;
use crate::types::{BusError, Result};

/// Ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// NATS-backed [`MessageBus`]
pub struct NatsBus {
    client: Client,
    request_timeout: Duration,
    queue_group: String,
    name: String,
    /// Subscription loops started by `serve`
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NatsBus {
    /// Connect to the configured server; fails fast when it is unreachable
    pub async fn connect(args: &NatsArgs, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        let request_timeout = Duration::from_millis(args.request_timeout_ms);
        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5))
            .request_timeout(Some(request_timeout));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| BusError::Bus(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        Ok(Self {
            client,
            request_timeout,
            queue_group: args.nats_queue_group.clone(),
            name: name.to_string(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Client name reported to the server
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn request(&self, address: &str, body: Value) -> Result<Value> {
        let payload = serde_json::to_vec(&body)?;
        let reply = tokio::time::timeout(
            self.request_timeout,
            self.client.request(address.to_string(), payload.into()),
        )
        .await
        .map_err(|_| BusError::Bus(format!("Request to {} timed out", address)))?
        .map_err(|e| BusError::Bus(format!("Request failed: {}", e)))?;

        ReplyEnvelope::from_bytes(&reply.payload)?.into_result()
    }

    async fn publish(&self, address: &str, body: Value) -> Result<()> {
        let payload = serde_json::to_vec(&body)?;
        self.client
            .publish(address.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Bus(format!("Publish failed: {}", e)))
    }

    async fn serve(&self, address: &str, handler: SharedHandler) -> Result<()> {
        // One member of the queue group handles each message
        let mut subscriber = self
            .client
            .queue_subscribe(address.to_string(), self.queue_group.clone())
            .await
            .map_err(|e| BusError::Bus(format!("Subscribe failed: {}", e)))?;

        let client = self.client.clone();
        let subject = address.to_string();
        let task = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let handler = handler.clone();
                let client = client.clone();
                let subject = subject.clone();

                tokio::spawn(async move {
                    let result = match serde_json::from_slice::<Value>(&message.payload) {
                        Ok(body) => handler.handle(body).await,
                        Err(e) => Err(BusError::from(e)),
                    };

                    let Some(reply_to) = message.reply else {
                        if let Err(e) = result {
                            warn!(address = %subject, error = %e, "Handler for published message failed");
                        }
                        return;
                    };

                    match ReplyEnvelope::from_result(result).to_bytes() {
                        Ok(frame) => {
                            if let Err(e) = client.publish(reply_to, frame).await {
                                error!(address = %subject, error = %e, "Failed to send reply");
                            }
                        }
                        Err(e) => error!(address = %subject, error = %e, "Failed to encode reply"),
                    }
                });
            }
            debug!(address = %subject, "Subscription closed");
        });

        self.tasks.lock().await.push(task);
        info!(address = %address, queue = %self.queue_group, "Serving address");
        Ok(())
    }

    async fn subscribe(&self, address: &str) -> Result<BoxStream<'static, Value>> {
        let subscriber = self
            .client
            .subscribe(address.to_string())
            .await
            .map_err(|e| BusError::Bus(format!("Subscribe failed: {}", e)))?;

        let address = address.to_string();
        Ok(subscriber
            .filter_map(move |message| {
                let parsed = serde_json::from_slice::<Value>(&message.payload);
                if let Err(ref e) = parsed {
                    warn!(address = %address, error = %e, "Dropping non-JSON message");
                }
                futures::future::ready(parsed.ok())
            })
            .boxed())
    }

    async fn shutdown(&self) -> Result<()> {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Bus(format!("Flush failed: {}", e)))?;
        info!("NATS bus shut down");
        Ok(())
    }
}
