//! schema-transformer - derives routing state from network config
//!
//! Mirrors the config store, follows change notifications from the bus and
//! writes the derived state of every affected object back to the store.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vnc_schema_transformer::{
    build_engine, DaemonConfig, TracingUvePublisher, TransformerContext, DEFAULT_CONFIG_PATH,
};
use vnc_sync_common::{
    ChangeNotificationConsumer, ConfigStore, LoggingConfig, MemoryBus, MemoryStore,
    NotificationBus, RedisBus, RedisConfig, RedisStore, ResyncCoordinator,
};

/// Contrail schema transformer
#[derive(Parser, Debug)]
#[command(name = "schema-transformer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter (overrides the config file; RUST_LOG overrides both)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Run against empty in-memory backends instead of Redis
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match DaemonConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("schema-transformer: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.sync.logging, args.log_level.as_deref());

    info!("--- Starting schema-transformer ---");
    match run(&args, config).await {
        Ok(()) => {
            info!("schema-transformer stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("schema-transformer failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(logging: &LoggingConfig, cli_level: Option<&str>) {
    let level = cli_level.unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: &Args, config: DaemonConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;

    let cx = TransformerContext::new(&config.transformer, Arc::new(TracingUvePublisher));
    let engine = build_engine(&config, &cx).context("failed to register resource types")?;

    let (store, bus): (Arc<dyn ConfigStore>, Box<dyn NotificationBus>) = if args.in_memory {
        warn!("Running on in-memory backends; no config will be received");
        (Arc::new(MemoryStore::new()), Box::new(MemoryBus::new()))
    } else {
        let redis = RedisConfig::from_config(&config.sync.database);
        info!(uri = %redis.uri(), "Using Redis backends");
        (
            Arc::new(RedisStore::new(redis.clone())),
            Box::new(RedisBus::new(redis)),
        )
    };

    let resync = ResyncCoordinator::new().with_yield_interval(config.sync.resync_yield_interval());
    let mut consumer =
        ChangeNotificationConsumer::new(engine, store, bus, config.sync.consumer_options())
            .with_resync(resync);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, shutting down");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    consumer.run(shutdown).await.context("consumer failed")?;
    info!(
        route_targets_in_use = cx.allocator.in_use(),
        "Consumer drained"
    );
    Ok(())
}
