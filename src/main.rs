//! botpool - bot instance pool manager

use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use botpool::{
    address::resolve_server_address,
    backend::{BackendStore, MemoryBackend, MongoBackend},
    config::Args,
    directory::{Directory, DirectoryStore, MemoryDirectory, NatsDirectory},
    logging::{self, LogTarget},
    pool::{GarbageCollector, PoolConfig, PoolManager},
    retry::RetryPolicy,
    server::{self, AppState},
    worker::ProcessSpawner,
};

/// Address published in dev mode when neither ADVERTISE_ADDR nor metadata is available
const DEV_SERVER_ADDR: &str = "127.0.0.1";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(
        &format!("botpool={},info", args.log_level),
        args.json_logs(),
        LogTarget::Stdout,
    );

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  botpool - bot instance pool manager");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("NATS: {} (bucket {})", args.nats.nats_url, args.nats.kv_bucket);
    info!("MongoDB: {} ({}.{})", args.mongodb_uri, args.mongodb_db, args.mongodb_bots_collection);
    info!("Worker: {} {:?}", args.worker_bin.display(), args.worker_args);
    info!("GC interval: {:?}, idle threshold: {:?}", args.gc_interval(), args.idle_threshold());
    match args.ask_timeout() {
        Some(limit) => info!("Ask timeout: {:?}", limit),
        None => info!("Ask timeout: none"),
    }
    info!("======================================");

    // Placement directory (in-memory fallback in dev mode)
    let store: Arc<dyn DirectoryStore> = match NatsDirectory::connect(&args.nats, "botpool").await {
        Ok(directory) => {
            info!("NATS directory connected (bucket {})", directory.bucket());
            Arc::new(directory)
        }
        Err(e) => {
            if args.dev_mode {
                warn!("NATS connection failed (dev mode, using in-memory directory): {}", e);
                Arc::new(MemoryDirectory::new())
            } else {
                error!("NATS connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    // Bot definitions (in-memory fallback in dev mode)
    let backend: Arc<dyn BackendStore> = match MongoBackend::connect(
        &args.mongodb_uri,
        &args.mongodb_db,
        &args.mongodb_bots_collection,
    )
    .await
    {
        Ok(backend) => {
            info!("MongoDB connected successfully");
            Arc::new(backend)
        }
        Err(e) => {
            if args.dev_mode {
                warn!("MongoDB connection failed (dev mode, using empty in-memory backend): {}", e);
                Arc::new(MemoryBackend::new())
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let server_addr = match resolve_server_address(args.advertise_addr.as_deref(), &args.metadata_url).await {
        Ok(addr) => addr,
        Err(e) => {
            if args.dev_mode {
                warn!("{} (dev mode, publishing as {})", e, DEV_SERVER_ADDR);
                DEV_SERVER_ADDR.to_string()
            } else {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    };

    let retry = RetryPolicy {
        max_attempts: args.store_retry_attempts,
        base_delay: args.store_retry_base(),
    };
    let directory = Directory::new(store, server_addr, retry);
    let spawner = ProcessSpawner::new(args.worker_bin.clone(), args.worker_args.clone())
        .with_startup_timeout(args.worker_startup_timeout());

    let pool = Arc::new(PoolManager::new(
        PoolConfig::from_args(&args),
        directory,
        backend,
        Arc::new(spawner),
    ));

    pool.register_server().await?;

    let collector = GarbageCollector::new(Arc::clone(&pool));
    collector.start().await;

    let listener = TcpListener::bind(args.listen).await?;
    let state = Arc::new(AppState::new(Arc::clone(&pool), args.dev_mode));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    if let Err(e) = server::run(state, listener, shutdown).await {
        error!("Server error: {}", e);
    }

    collector.stop().await;
    let stopped = pool.shutdown().await;
    info!(stopped, "botpool stopped");

    Ok(())
}
