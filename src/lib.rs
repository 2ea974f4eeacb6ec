//! docbus - message-bus facade over a document store
//!
//! Structured requests arrive on named addresses, are translated into
//! document-store operations (save, find, aggregate), and the results are
//! replied or republished, optionally on a timer.
//!
//! ## Components
//!
//! - **translator**: filter/projection/sort and the aggregation pipeline
//! - **gateway**: the store connection and its save/find/aggregate operations
//! - **dispatcher**: binds inbound addresses to gateway and data-service operations
//! - **pipeline**: fetch-then-transform over two request/reply hops
//! - **poller**: periodic "newer than the watermark" polling and republishing
//! - **listener**: fan-in of producer addresses into the gateway save address

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod listener;
pub mod logging;
pub mod messages;
pub mod pipeline;
pub mod poller;
pub mod store;
pub mod timestamp;
pub mod translator;
pub mod types;

pub use bus::{LocalBus, MessageBus, NatsBus};
pub use config::Args;
pub use gateway::DatabaseGateway;
pub use types::{BusError, Result};
