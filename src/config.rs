//! Configuration for docbus
//!
//! CLI arguments and environment variable handling using clap. Every address
//! a component talks to is configured here and passed in explicitly.

use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

use crate::dispatcher::{DataServiceAddresses, GatewayAddresses};
use crate::poller::PollerConfig;
use crate::store::MongoConfig;
use crate::timestamp::TimestampFormat;
use crate::types::{BusError, Result};

/// docbus - message-bus facade over a MongoDB document store
#[derive(Parser, Debug, Clone)]
#[command(name = "docbus")]
#[command(about = "Save, find and aggregate documents over message-bus addresses")]
pub struct Args {
    /// Unique node identifier for this instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Enable development mode (fall back to in-process store and bus)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// MongoDB configuration
    #[command(flatten)]
    pub mongo: MongoArgs,

    /// Gateway save address
    #[arg(long, env = "GATEWAY_SAVE_ADDRESS", default_value = "docbus.gateway.save")]
    pub gateway_save_address: String,

    /// Gateway find address (also aggregates when the request names a field)
    #[arg(long, env = "GATEWAY_FIND_ADDRESS", default_value = "docbus.gateway.find")]
    pub gateway_find_address: String,

    /// Gateway aggregate address
    #[arg(
        long,
        env = "GATEWAY_AGGREGATE_ADDRESS",
        default_value = "docbus.gateway.aggregate"
    )]
    pub gateway_aggregate_address: String,

    /// Data service save address
    #[arg(long, env = "DATA_SAVE_ADDRESS", default_value = "docbus.data.save")]
    pub data_save_address: String,

    /// Data service find address
    #[arg(long, env = "DATA_FIND_ADDRESS", default_value = "docbus.data.find")]
    pub data_find_address: String,

    /// Comma-separated addresses whose messages are saved
    #[arg(long, env = "LISTEN_ADDRESSES", value_delimiter = ',')]
    pub listen_addresses: Vec<String>,

    /// JSON file with an array of poller definitions
    #[arg(long, env = "POLLERS_FILE")]
    pub pollers_file: Option<PathBuf>,

    /// Canonical timestamp format of saved documents
    #[arg(long, env = "TIMESTAMP_FORMAT", value_enum, default_value = "legacy")]
    pub timestamp_format: TimestampFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,

    /// Time to wait for a reply, in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Queue group for served addresses; instances in one group split the requests
    #[arg(long, env = "NATS_QUEUE_GROUP", default_value = "docbus")]
    pub nats_queue_group: String,
}

/// MongoDB connection configuration
#[derive(Parser, Debug, Clone)]
pub struct MongoArgs {
    #[arg(long, env = "MONGODB_HOST", default_value = "127.0.0.1")]
    pub mongodb_host: String,

    #[arg(long, env = "MONGODB_PORT", default_value = "27017")]
    pub mongodb_port: u16,

    /// Database name
    #[arg(long, env = "MONGODB_DB", default_value = "daedalus2")]
    pub mongodb_db: String,

    /// Username (optional, no authentication when unset)
    #[arg(long, env = "MONGODB_USER")]
    pub mongodb_user: Option<String>,

    #[arg(long, env = "MONGODB_PASSWORD")]
    pub mongodb_password: Option<String>,

    /// Gateways with the same pool name share one connection
    #[arg(long, env = "MONGODB_POOL", default_value = "d2Pool")]
    pub mongodb_pool: String,
}

impl MongoArgs {
    pub fn to_config(&self, app_name: &str) -> MongoConfig {
        MongoConfig {
            host: self.mongodb_host.clone(),
            port: self.mongodb_port,
            db_name: self.mongodb_db.clone(),
            username: self.mongodb_user.clone(),
            password: self.mongodb_password.clone(),
            app_name: app_name.to_string(),
        }
    }
}

impl Args {
    pub fn gateway_addresses(&self) -> GatewayAddresses {
        GatewayAddresses {
            save: self.gateway_save_address.clone(),
            find: self.gateway_find_address.clone(),
            aggregate: self.gateway_aggregate_address.clone(),
        }
    }

    pub fn data_service_addresses(&self) -> DataServiceAddresses {
        DataServiceAddresses {
            save: self.data_save_address.clone(),
            find: self.data_find_address.clone(),
        }
    }

    /// Listening addresses with blanks dropped
    pub fn listen_address_list(&self) -> Vec<String> {
        self.listen_addresses
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Read the poller definitions; none when no file is configured
    pub fn load_pollers(&self) -> Result<Vec<PollerConfig>> {
        let Some(ref path) = self.pollers_file else {
            return Ok(Vec::new());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BusError::Config(format!("Cannot read pollers file {}: {}", path.display(), e))
        })?;
        parse_pollers(&raw)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let inbound = [
            ("GATEWAY_SAVE_ADDRESS", &self.gateway_save_address),
            ("GATEWAY_FIND_ADDRESS", &self.gateway_find_address),
            ("GATEWAY_AGGREGATE_ADDRESS", &self.gateway_aggregate_address),
            ("DATA_SAVE_ADDRESS", &self.data_save_address),
            ("DATA_FIND_ADDRESS", &self.data_find_address),
        ];

        let mut seen = HashSet::new();
        for (name, address) in inbound {
            if address.trim().is_empty() {
                return Err(BusError::Config(format!("{} must not be empty", name)));
            }
            if !seen.insert(address.as_str()) {
                return Err(BusError::Config(format!(
                    "{} reuses address {}",
                    name, address
                )));
            }
        }
        for address in self.listen_address_list() {
            if seen.contains(address.as_str()) {
                return Err(BusError::Config(format!(
                    "Listening address {} is also an inbound address",
                    address
                )));
            }
        }

        if self.mongo.mongodb_pool.is_empty() {
            return Err(BusError::Config("MONGODB_POOL must not be empty".into()));
        }
        if self.nats.request_timeout_ms == 0 {
            return Err(BusError::Config("REQUEST_TIMEOUT_MS must be greater than zero".into()));
        }
        if self.nats.nats_queue_group.trim().is_empty() {
            return Err(BusError::Config("NATS_QUEUE_GROUP must not be empty".into()));
        }

        for poller in self.load_pollers()? {
            poller.validate()?;
        }
        Ok(())
    }
}

/// Parse a JSON array of poller definitions
pub fn parse_pollers(raw: &str) -> Result<Vec<PollerConfig>> {
    serde_json::from_str(raw)
        .map_err(|e| BusError::Config(format!("Invalid poller definitions: {}", e)))
}
