//! Request dispatcher
//!
//! Binds inbound addresses to operations. Every address takes one request
//! type and answers each message with exactly one reply or failure.
//!
//! - Gateway endpoints: `save`, `find`, `aggregate` straight onto [`DatabaseGateway`]
//! - Data service endpoints: `save` forwarded to the gateway, `find` through [`DataPipeline`]

use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::bus::{handler_fn, MessageBus};
use crate::gateway::DatabaseGateway;
use crate::messages::{DataRequest, DbRequest, SaveEnvelope};
use crate::pipeline::DataPipeline;
use crate::types::Result;

/// Inbound addresses of the database gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAddresses {
    pub save: String,
    pub find: String,
    pub aggregate: String,
}

/// Inbound addresses of the data service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataServiceAddresses {
    pub save: String,
    pub find: String,
}

async fn save(gateway: Arc<DatabaseGateway>, body: Value) -> Result<Value> {
    let envelope = SaveEnvelope::from_value(body)?;
    let ack = gateway.save(envelope).await?;
    Ok(serde_json::to_value(ack)?)
}

async fn find(gateway: Arc<DatabaseGateway>, body: Value) -> Result<Value> {
    gateway.query(&DbRequest::from_value(body)?).await
}

async fn aggregate(gateway: Arc<DatabaseGateway>, body: Value) -> Result<Value> {
    gateway.aggregate(&DbRequest::from_value(body)?).await
}

async fn data_find(pipeline: Arc<DataPipeline>, body: Value) -> Result<Value> {
    let request: DataRequest = serde_json::from_value(body)?;
    pipeline.dispatch(request).await
}

/// Serve the gateway addresses.
///
/// A request on `find` carrying an `aggregate` field runs the aggregation.
pub async fn register_gateway(
    bus: &dyn MessageBus,
    gateway: Arc<DatabaseGateway>,
    addresses: &GatewayAddresses,
) -> Result<()> {
    let gw = gateway.clone();
    bus.serve(&addresses.save, handler_fn(move |body| save(gw.clone(), body)))
        .await?;

    let gw = gateway.clone();
    bus.serve(&addresses.find, handler_fn(move |body| find(gw.clone(), body)))
        .await?;

    bus.serve(
        &addresses.aggregate,
        handler_fn(move |body| aggregate(gateway.clone(), body)),
    )
    .await?;

    info!(
        save = %addresses.save,
        find = %addresses.find,
        aggregate = %addresses.aggregate,
        "Gateway endpoints registered"
    );
    Ok(())
}

/// Serve the data service addresses.
///
/// Saves are relayed to `gateway_save` and its reply returned unchanged.
pub async fn register_data_service(
    bus: Arc<dyn MessageBus>,
    pipeline: Arc<DataPipeline>,
    addresses: &DataServiceAddresses,
    gateway_save: &str,
) -> Result<()> {
    let relay = bus.clone();
    let target = gateway_save.to_string();
    bus.serve(
        &addresses.save,
        handler_fn(move |body: Value| {
            let relay = relay.clone();
            let target = target.clone();
            async move { relay.request(&target, body).await }
        }),
    )
    .await?;

    bus.serve(
        &addresses.find,
        handler_fn(move |body| data_find(pipeline.clone(), body)),
    )
    .await?;

    info!(save = %addresses.save, find = %addresses.find, "Data service endpoints registered");
    Ok(())
}
