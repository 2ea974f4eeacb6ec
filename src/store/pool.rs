//! Shared store connections keyed by pool name
//!
//! Gateways configured with the same pool name share one connection. The
//! connection is closed when the last gateway holding it releases it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::DocumentStore;
use crate::types::Result;

struct PoolEntry {
    store: Arc<dyn DocumentStore>,
    refs: usize,
}

/// Registry of shared [`DocumentStore`] connections
#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, PoolEntry>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the store for `name`, connecting with `connect` on first use.
    ///
    /// The lock is held across `connect` so concurrent callers never open two
    /// connections for the same pool.
    pub async fn acquire<F, Fut>(&self, name: &str, connect: F) -> Result<Arc<dyn DocumentStore>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn DocumentStore>>>,
    {
        let mut pools = self.pools.lock().await;
        if let Some(entry) = pools.get_mut(name) {
            entry.refs += 1;
            debug!(pool = %name, refs = entry.refs, "Reusing shared store");
            return Ok(entry.store.clone());
        }

        let store = connect().await?;
        pools.insert(
            name.to_string(),
            PoolEntry {
                store: store.clone(),
                refs: 1,
            },
        );
        info!(pool = %name, "Opened shared store");
        Ok(store)
    }

    /// Drop one reference to `name`; closes the store at zero
    pub async fn release(&self, name: &str) -> Result<()> {
        let mut pools = self.pools.lock().await;
        let Some(entry) = pools.get_mut(name) else {
            return Ok(());
        };

        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            debug!(pool = %name, refs = entry.refs, "Released shared store");
            return Ok(());
        }

        if let Some(entry) = pools.remove(name) {
            entry.store.close().await?;
            info!(pool = %name, "Closed shared store");
        }
        Ok(())
    }

    /// Current number of holders of `name`
    pub async fn ref_count(&self, name: &str) -> usize {
        self.pools.lock().await.get(name).map_or(0, |e| e.refs)
    }
}
