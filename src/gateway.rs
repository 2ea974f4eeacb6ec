//! Database gateway
//!
//! Owns one shared store connection and exposes save, find and aggregate
//! keyed by collection name. Saved documents are stamped with the canonical
//! `datetime` before they are written.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::messages::{DbRequest, DbResponse, SaveAck, SaveEnvelope};
use crate::store::{DocumentStore, PoolRegistry};
use crate::timestamp::{self, TimestampFormat, DATETIME_FIELD};
use crate::translator;
use crate::types::{BusError, Result};

/// Lifecycle of a gateway instance.
///
/// There is no disconnected value: a gateway only exists once
/// [`DatabaseGateway::connect`] has joined its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Connected,
    Closing,
    Closed,
}

/// Save/find/aggregate over a pooled [`DocumentStore`]
pub struct DatabaseGateway {
    store: Arc<dyn DocumentStore>,
    pool_name: String,
    registry: Arc<PoolRegistry>,
    timestamps: TimestampFormat,
    state: RwLock<GatewayState>,
}

impl DatabaseGateway {
    /// Join the pool `pool_name`, opening it with `connect` if this is the first holder
    pub async fn connect<F, Fut>(
        registry: Arc<PoolRegistry>,
        pool_name: &str,
        timestamps: TimestampFormat,
        connect: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn DocumentStore>>>,
    {
        let store = registry.acquire(pool_name, connect).await?;
        info!(pool = %pool_name, "Database gateway connected");

        Ok(Self {
            store,
            pool_name: pool_name.to_string(),
            registry,
            timestamps,
            state: RwLock::new(GatewayState::Connected),
        })
    }

    /// Current lifecycle state
    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    /// Name of the shared pool this gateway holds
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    async fn ensure_connected(&self) -> Result<()> {
        match *self.state.read().await {
            GatewayState::Connected => Ok(()),
            _ => Err(BusError::Closed),
        }
    }

    /// Stamp `datetime` and upsert into the collection named by the envelope
    pub async fn save(&self, envelope: SaveEnvelope) -> Result<SaveAck> {
        self.ensure_connected().await?;

        let SaveEnvelope {
            type_name,
            mut payload,
        } = envelope;
        payload.insert(
            DATETIME_FIELD.to_string(),
            timestamp::date_value(&self.timestamps.now()),
        );
        let document = translator::json_to_document(Value::Object(payload))?;

        let outcome = self.store.save(&type_name, document).await.map_err(|e| {
            error!(collection = %type_name, error = %e, "Save failed");
            e
        })?;

        debug!(collection = %type_name, updated = outcome.is_update(), "Document saved");
        Ok(SaveAck {
            collection: type_name,
            updated: outcome.is_update(),
        })
    }

    /// Run a find with the translated filter and options
    pub async fn find(&self, request: &DbRequest) -> Result<DbResponse> {
        self.ensure_connected().await?;
        if request.collection.is_empty() {
            return Err(BusError::BadRequest("Find requires a collection".into()));
        }

        let filter = translator::parse_filter(&request.query);
        let spec = translator::find_spec(request);
        let rows = self
            .store
            .find(&request.collection, filter, spec)
            .await
            .map_err(|e| {
                error!(collection = %request.collection, error = %e, "Find failed");
                e
            })?;

        let response = DbResponse::new(rows.into_iter().map(translator::document_to_json).collect());
        if response.is_empty() {
            debug!(collection = %request.collection, "Find matched no documents");
        }
        Ok(response)
    }

    /// Run the fixed aggregation pipeline and return the raw cursor reply
    pub async fn aggregate(&self, request: &DbRequest) -> Result<Value> {
        self.ensure_connected().await?;
        if request.collection.is_empty() {
            return Err(BusError::BadRequest("Aggregate requires a collection".into()));
        }
        if !request.is_aggregate() {
            return Err(BusError::BadRequest("Aggregate requires a field".into()));
        }

        let filter = translator::parse_filter(&request.query);
        let pipeline = translator::build_aggregation_pipeline(filter, &request.aggregate);
        let raw = self
            .store
            .aggregate(&request.collection, pipeline)
            .await
            .map_err(|e| {
                error!(collection = %request.collection, error = %e, "Aggregation failed");
                e
            })?;

        Ok(Value::Object(translator::document_to_json(raw)))
    }

    /// Find or aggregate, selected by whether `aggregate` is set
    pub async fn query(&self, request: &DbRequest) -> Result<Value> {
        if request.is_aggregate() {
            self.aggregate(request).await
        } else {
            self.find(request).await?.to_value()
        }
    }

    /// Release the pool reference; later calls fail with [`BusError::Closed`]
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != GatewayState::Connected {
                return Ok(());
            }
            *state = GatewayState::Closing;
        }

        let released = self.registry.release(&self.pool_name).await;
        *self.state.write().await = GatewayState::Closed;
        info!(pool = %self.pool_name, "Database gateway closed");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn gateway_on(registry: Arc<PoolRegistry>, store: Arc<MemoryStore>) -> DatabaseGateway {
        DatabaseGateway::connect(registry, "d2Pool", TimestampFormat::Legacy, || async move {
            Ok(store as Arc<dyn DocumentStore>)
        })
        .await
        .unwrap()
    }

    async fn gateway() -> DatabaseGateway {
        gateway_on(Arc::new(PoolRegistry::new()), Arc::new(MemoryStore::new())).await
    }

    fn envelope(value: Value) -> SaveEnvelope {
        SaveEnvelope::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_save_stamps_datetime() {
        let gw = gateway().await;
        let ack = gw
            .save(envelope(json!({ "typeName": "Position", "payload": { "x": 1 } })))
            .await
            .unwrap();
        assert_eq!(ack.collection, "Position");
        assert!(!ack.updated);

        let found = gw.find(&DbRequest::new("Position")).await.unwrap();
        let stamp = found.result[0]["datetime"]["$date"].as_str().unwrap();
        assert!(timestamp::parse(stamp).is_ok());
    }

    #[tokio::test]
    async fn test_save_twice_with_same_id_keeps_one_document() {
        let gw = gateway().await;
        gw.save(envelope(json!({ "typeName": "Position", "payload": { "_id": "p1", "x": 1 } })))
            .await
            .unwrap();
        let ack = gw
            .save(envelope(json!({ "typeName": "Position", "payload": { "_id": "p1", "x": 2 } })))
            .await
            .unwrap();
        assert!(ack.updated);

        let found = gw.find(&DbRequest::new("Position")).await.unwrap();
        assert_eq!(found.result.len(), 1);
        assert_eq!(found.result[0]["x"], 2);
        assert!(found.result[0]["datetime"]["$date"].is_string());
    }

    #[tokio::test]
    async fn test_find_empty_query_returns_all_in_order() {
        let gw = gateway().await;
        for x in [3, 1, 2] {
            gw.save(envelope(json!({ "className": "Sample", "x": x })))
                .await
                .unwrap();
        }

        let found = gw.find(&DbRequest::new("Sample")).await.unwrap();
        let xs: Vec<_> = found.result.iter().map(|d| d["x"].as_i64().unwrap()).collect();
        assert_eq!(xs, vec![3, 1, 2]);

        let again = gw.find(&DbRequest::new("Sample")).await.unwrap();
        assert_eq!(found, again);
    }

    #[tokio::test]
    async fn test_find_translates_options() {
        let gw = gateway().await;
        for x in [3, 1, 2] {
            gw.save(envelope(json!({ "className": "Sample", "x": x, "y": x * 10 })))
                .await
                .unwrap();
        }

        let request = DbRequest::new("Sample")
            .with_query(r#"{"x": {"$gte": 2}}"#)
            .with_fields(vec!["x".into()])
            .with_sort(vec!["x".into()])
            .with_limit(1);
        let found = gw.find(&request).await.unwrap();
        assert_eq!(found.result.len(), 1);
        assert_eq!(found.result[0]["x"], 3);
        assert!(found.result[0].get("y").is_none());
    }

    #[tokio::test]
    async fn test_malformed_query_matches_all() {
        let gw = gateway().await;
        gw.save(envelope(json!({ "className": "Sample", "x": 1 })))
            .await
            .unwrap();
        let found = gw
            .find(&DbRequest::new("Sample").with_query("{broken"))
            .await
            .unwrap();
        assert_eq!(found.result.len(), 1);
    }

    #[tokio::test]
    async fn test_find_without_collection_fails() {
        let gw = gateway().await;
        let err = gw.find(&DbRequest::default()).await.unwrap_err();
        assert!(matches!(err, BusError::BadRequest(ref m) if m == "Find requires a collection"));
    }

    #[tokio::test]
    async fn test_query_routes_aggregate() {
        let gw = gateway().await;
        gw.save(envelope(json!({ "className": "Sample", "x": 4 })))
            .await
            .unwrap();

        let reply = gw
            .query(&DbRequest::new("Sample").with_aggregate("x"))
            .await
            .unwrap();
        let batch = reply["cursor"]["firstBatch"].as_array().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["max"], 4);
        assert!(batch[0]["time"].is_i64());

        let reply = gw.query(&DbRequest::new("Sample")).await.unwrap();
        assert_eq!(reply["result"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_requires_field() {
        let gw = gateway().await;
        let err = gw.aggregate(&DbRequest::new("Sample")).await.unwrap_err();
        assert!(matches!(err, BusError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_closed_gateway_rejects_calls() {
        let gw = gateway().await;
        assert_eq!(gw.state().await, GatewayState::Connected);
        gw.close().await.unwrap();
        assert_eq!(gw.state().await, GatewayState::Closed);
        assert!(matches!(
            gw.find(&DbRequest::new("Sample")).await,
            Err(BusError::Closed)
        ));
        gw.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_gateways_share_pool() {
        let registry = Arc::new(PoolRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let first = gateway_on(registry.clone(), store.clone()).await;
        let second = gateway_on(registry.clone(), Arc::new(MemoryStore::new())).await;

        first
            .save(envelope(json!({ "className": "Sample", "x": 1 })))
            .await
            .unwrap();
        assert_eq!(second.find(&DbRequest::new("Sample")).await.unwrap().result.len(), 1);

        first.close().await.unwrap();
        assert!(!store.is_closed());
        second.close().await.unwrap();
        assert!(store.is_closed());
    }
}
