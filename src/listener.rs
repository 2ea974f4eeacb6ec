//! Data listener
//!
//! Fans every message published on the configured listening addresses into
//! the gateway save address. Fire-and-forget in both directions.

use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::types::Result;

/// Forwards producer addresses to the gateway save address
pub struct DataListener {
    tasks: Vec<JoinHandle<()>>,
}

impl DataListener {
    /// Subscribe to each of `addresses` and start forwarding to `save_address`
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        addresses: &[String],
        save_address: &str,
    ) -> Result<Self> {
        let mut tasks = Vec::with_capacity(addresses.len());

        for address in addresses {
            let mut messages = bus.subscribe(address).await?;
            let bus = bus.clone();
            let source = address.clone();
            let target = save_address.to_string();

            tasks.push(tokio::spawn(async move {
                while let Some(message) = messages.next().await {
                    debug!(from = %source, to = %target, "Forwarding message to save");
                    if let Err(e) = bus.publish(&target, message).await {
                        warn!(from = %source, error = %e, "Forwarding to save failed");
                    }
                }
                debug!(address = %source, "Listening address closed");
            }));
            info!(address = %address, save = %save_address, "Listening for data");
        }

        Ok(Self { tasks })
    }

    /// Number of addresses being listened on
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop forwarding
    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
        info!("Data listener stopped");
    }
}
