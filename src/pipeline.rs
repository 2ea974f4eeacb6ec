//! Data manipulation pipeline
//!
//! Fetch the latest rows of a collection through the gateway, then hand them
//! to a transformation address. Two request/reply hops, strictly in order;
//! a failure on the first hop never reaches the second.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::bus::MessageBus;
use crate::messages::{DataOperation, DataRequest, DbRequest};
use crate::types::{BusError, Result};

/// Composes a gateway find with an optional transformation hop
pub struct DataPipeline {
    bus: Arc<dyn MessageBus>,
    /// Gateway address answering finds
    find_address: String,
}

impl DataPipeline {
    pub fn new(bus: Arc<dyn MessageBus>, find_address: impl Into<String>) -> Self {
        Self {
            bus,
            find_address: find_address.into(),
        }
    }

    /// Run the request.
    ///
    /// With an empty `collection` the raw find reply is returned and
    /// `operation` is ignored. Otherwise the reply is wrapped as
    /// `{data: {data: reply}, params}` and sent to `operation`, whose reply is
    /// returned as-is.
    pub async fn dispatch(&self, request: DataRequest) -> Result<Value> {
        let find = DbRequest::new(request.collection.clone()).with_query(request.query.clone());
        let latest = self.bus.request(&self.find_address, find.to_value()?).await?;

        if request.collection.is_empty() {
            return Ok(latest);
        }
        if request.operation.is_empty() {
            return Err(BusError::BadRequest(format!(
                "No operation given for collection {}",
                request.collection
            )));
        }

        debug!(
            collection = %request.collection,
            operation = %request.operation,
            "Forwarding data to transformation"
        );
        let operation = DataOperation::wrap(latest, request.operation_params);
        self.bus.request(&request.operation, operation.to_value()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{handler_fn, LocalBus};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn bus_with_find(reply: Value) -> Arc<LocalBus> {
        let bus = Arc::new(LocalBus::new());
        bus.serve(
            "db.find",
            handler_fn(move |_| {
                let reply = reply.clone();
                async move { Ok(reply) }
            }),
        )
        .await
        .unwrap();
        bus
    }

    /// Doubles `params.field` of every fetched row
    async fn serve_double(bus: &LocalBus, calls: Arc<AtomicUsize>) {
        bus.serve(
            "double",
            handler_fn(move |body| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    let field = body["params"]["field"].as_str().unwrap_or("value").to_string();
                    let doubled: Vec<Value> = body["data"]["data"]["result"]
                        .as_array()
                        .cloned()
                        .unwrap_or_default()
                        .iter()
                        .map(|row| {
                            let mut out = serde_json::Map::new();
                            out.insert(
                                field.clone(),
                                json!(row[field.as_str()].as_f64().unwrap_or(0.0) * 2.0),
                            );
                            Value::Object(out)
                        })
                        .collect();
                    Ok(json!({ "result": doubled }))
                }
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_operation_receives_wrapped_data() {
        let bus = bus_with_find(json!({ "result": [{ "x": 21 }] })).await;
        let calls = Arc::new(AtomicUsize::new(0));
        serve_double(&bus, calls.clone()).await;

        let pipeline = DataPipeline::new(bus.clone(), "db.find");
        let mut params = serde_json::Map::new();
        params.insert("field".into(), json!("x"));
        let reply = pipeline
            .dispatch(DataRequest::new("Position").with_operation("double", params))
            .await
            .unwrap();

        assert_eq!(reply, json!({ "result": [{ "x": 42.0 }] }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_collection_returns_find_reply() {
        let raw = json!({ "result": [{ "x": 1 }] });
        let bus = bus_with_find(raw.clone()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        serve_double(&bus, calls.clone()).await;

        let pipeline = DataPipeline::new(bus.clone(), "db.find");
        let reply = pipeline
            .dispatch(DataRequest::default().with_operation("double", Default::default()))
            .await
            .unwrap();

        assert_eq!(reply, raw);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_find_failure_short_circuits() {
        let bus = Arc::new(LocalBus::new());
        bus.serve(
            "db.find",
            handler_fn(|_| async { Err(BusError::Database("unreachable".into())) }),
        )
        .await
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        serve_double(&bus, calls.clone()).await;

        let pipeline = DataPipeline::new(bus.clone(), "db.find");
        let err = pipeline
            .dispatch(DataRequest::new("Position").with_operation("double", Default::default()))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Database error: unreachable");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_operation_is_bad_request() {
        let bus = bus_with_find(json!({ "result": [] })).await;
        let pipeline = DataPipeline::new(bus, "db.find");
        let err = pipeline.dispatch(DataRequest::new("Position")).await.unwrap_err();
        assert!(matches!(err, BusError::BadRequest(_)));
    }
}
