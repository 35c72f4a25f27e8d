use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use kestrel_adapter::{
    event_channel, get_connector_factory, spawn_adapter, BrokerAdapter, RuntimeSettings,
};
use kestrel_config::{load_config, AppConfig};
use kestrel_engine::{EngineHandle, ShutdownSignal, TradeManager, TradeManagerConfig};
use kestrel_gateway::{spawn_gateway, GatewaySettings};
use kestrel_store::Store;
use kestrel_strategy::{register_builtin_strategies, registered_strategy_names};

mod telemetry;

#[derive(Parser)]
#[command(author, version, about = "Kestrel trading engine")]
struct Cli {
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine for the configured account
    Run,
    /// List the registered strategy identifiers
    Strategies,
    /// Load and print the effective configuration, then exit
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(Some(&cli.env)).context("failed to load configuration")?;

    match cli.command {
        Commands::Run => run(config),
        Commands::Strategies => {
            register_builtin_strategies();
            for name in registered_strategy_names() {
                println!("{name}");
            }
            Ok(())
        }
        Commands::CheckConfig => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

fn run(config: AppConfig) -> Result<()> {
    let log_file = config.log.dir.join("kestrel.json");
    telemetry::init_tracing(&config.log.level, Some(&log_file))?;
    telemetry::announce(
        &config.account_id,
        config.log.shipper.enable,
        &config.log.shipper.host,
        config.log.shipper.port,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(run_async(config))
}

async fn run_async(config: AppConfig) -> Result<()> {
    register_builtin_strategies();
    kestrel_paper::register_factory();

    let store = Arc::new(
        Store::open(&config.store.path)
            .with_context(|| format!("cannot open store at {}", config.store.path.display()))?,
    );

    let factory = get_connector_factory(&config.broker.driver)
        .ok_or_else(|| anyhow!("broker driver '{}' is not registered", config.broker.driver))?;
    let (events_tx, events_rx) = event_channel();
    let mut adapter = factory
        .build(&config.broker.params, events_tx.clone())
        .map_err(|err| anyhow!("failed to build broker adapter: {err}"))?;

    // Authentication failures are fatal for the session: the engine comes up
    // idle and waits for an operator restart with corrected credentials.
    let init = match adapter.init().await {
        Ok(init) => {
            info!(
                account = %init.account.account_id,
                broker = %config.broker.driver,
                "broker adapter initialized"
            );
            Some(init)
        }
        Err(err) if err.code.is_fatal() => {
            error!(error = %err, severity = "CRITICAL", "broker authentication failed");
            None
        }
        Err(err) => {
            return Err(anyhow!("broker adapter initialization failed: {err}"));
        }
    };

    let adapter_handle = spawn_adapter(
        adapter,
        events_tx,
        events_rx,
        RuntimeSettings {
            tick_interval: Duration::from_millis(100),
            submit_timeout: Duration::from_secs(config.broker.order_submit_timeout_secs),
            submit_retry_delay: Duration::from_secs(config.broker.order_submit_retry_delay_secs),
        },
    );

    let (command_tx, command_rx) = mpsc::channel(256);
    let (alert_tx, _) = broadcast::channel(1024);
    let engine_handle = EngineHandle::new(command_tx, alert_tx.clone());
    let shutdown = ShutdownSignal::with_ctrl_c();

    let gateway_task = spawn_gateway(
        GatewaySettings {
            listen_addr: config.gateway.listen_addr.clone(),
            max_clients: config.gateway.max_clients,
            log_dir: config.log.dir.clone(),
            log_query: config.log.query,
        },
        engine_handle,
        shutdown.clone(),
    );

    let manager = TradeManager::new(
        TradeManagerConfig::from_app(&config),
        store,
        adapter_handle,
        init,
        command_rx,
        alert_tx,
        shutdown.clone(),
    )?;

    info!(
        account = %config.account_id,
        gateway = %config.gateway.listen_addr,
        strategies = config.strategies.len(),
        "engine starting"
    );
    manager.run().await?;

    shutdown.trigger();
    let _ = gateway_task.await;
    info!("engine stopped");
    Ok(())
}
