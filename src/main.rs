//! docbus - message-bus facade over a MongoDB document store

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use docbus::{
    bus::{LocalBus, MessageBus, NatsBus},
    config::Args,
    dispatcher::{register_data_service, register_gateway},
    gateway::DatabaseGateway,
    listener::DataListener,
    logging,
    pipeline::DataPipeline,
    poller::{PollMode, Poller},
    store::{DocumentStore, MemoryStore, MongoStore, PoolRegistry},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    logging::init(&args.log_level, &args.log_format);

    if let Err(e) = args.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    let client_name = format!("docbus-{}", args.node_id);
    let listen_addresses = args.listen_address_list();

    info!("======================================");
    info!("  docbus - document store over the bus");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("NATS: {}", args.nats.nats_url);
    info!(
        "MongoDB: {}:{}/{} (pool {})",
        args.mongo.mongodb_host, args.mongo.mongodb_port, args.mongo.mongodb_db, args.mongo.mongodb_pool
    );
    info!("Timestamps: {:?}", args.timestamp_format);
    info!("Listening addresses: {}", listen_addresses.len());
    info!("======================================");

    // Connect to MongoDB (in-process store in dev mode)
    let registry = Arc::new(PoolRegistry::new());
    let mongo_config = args.mongo.to_config(&client_name);
    let dev_mode = args.dev_mode;
    let gateway = DatabaseGateway::connect(
        registry,
        &args.mongo.mongodb_pool,
        args.timestamp_format,
        || async move {
            match MongoStore::connect(&mongo_config).await {
                Ok(store) => Ok(Arc::new(store) as Arc<dyn DocumentStore>),
                Err(e) if dev_mode => {
                    warn!("MongoDB connection failed (dev mode, using in-memory store): {}", e);
                    Ok(Arc::new(MemoryStore::new()) as Arc<dyn DocumentStore>)
                }
                Err(e) => Err(e),
            }
        },
    )
    .await;
    let gateway = match gateway {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!("MongoDB connection failed: {}", e);
            std::process::exit(1);
        }
    };

    // Connect to NATS (in-process bus in dev mode)
    let bus: Arc<dyn MessageBus> = match NatsBus::connect(&args.nats, &client_name).await {
        Ok(bus) => {
            info!("NATS connected successfully");
            Arc::new(bus)
        }
        Err(e) => {
            if args.dev_mode {
                warn!("NATS connection failed (dev mode, using local bus): {}", e);
                Arc::new(
                    LocalBus::new().with_timeout(Duration::from_millis(args.nats.request_timeout_ms)),
                )
            } else {
                error!("NATS connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let gateway_addresses = args.gateway_addresses();
    register_gateway(bus.as_ref(), gateway.clone(), &gateway_addresses).await?;

    let pipeline = Arc::new(DataPipeline::new(bus.clone(), gateway_addresses.find.clone()));
    register_data_service(
        bus.clone(),
        pipeline,
        &args.data_service_addresses(),
        &gateway_addresses.save,
    )
    .await?;

    let listener = DataListener::start(bus.clone(), &listen_addresses, &gateway_addresses.save).await?;

    let mut pollers = Vec::new();
    for config in args.load_pollers()? {
        let address = match config.mode {
            PollMode::Aggregate { .. } => gateway_addresses.aggregate.clone(),
            PollMode::Find { .. } => gateway_addresses.find.clone(),
        };
        let poller = Poller::new(config, bus.clone(), address, args.timestamp_format)?;
        pollers.push(Arc::new(poller).start().await?);
    }
    info!("docbus ready with {} poller(s)", pollers.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    for poller in pollers {
        poller.stop().await;
    }
    listener.stop();
    if let Err(e) = bus.shutdown().await {
        warn!("Bus shutdown failed: {}", e);
    }
    if let Err(e) = gateway.close().await {
        error!("Closing the gateway failed: {}", e);
    }

    info!("docbus stopped");
    Ok(())
}
