#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod config;
mod logging;
mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use dt_management::domain::address::{AddressTranslator, Topology};
use dt_management::infra::bridge::EventBridge;
use dt_management::infra::broker::EmbeddedBroker;
use dt_management::infra::catalog::HttpServiceCatalog;
use dt_management::infra::connector::{ContainerConnector, Connectors, ProcessConnector};
use dt_management::infra::docker::{BollardEngine, ContainerEngine, ContainerManager};
use dt_management::infra::forwarder::EventForwarder;
use dt_management::infra::kafka::KafkaPublisher;
use dt_management::infra::mqtt::spawn_module_listener;
use dt_management::infra::readiness::HttpReadinessChecker;
use dt_management::{DeploymentOrchestrator, Module, ModuleService};

use crate::config::AppConfig;

/// DT Management Server - deploys digital twin modules and relays their events
#[derive(Parser)]
#[command(name = "dt-management-server")]
#[command(about = "DT Management Server - deploys digital twin modules and relays their events")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Module definition (JSON) to deploy on startup; may be repeated
    #[arg(short, long = "module", value_name = "FILE")]
    modules: Vec<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and module definitions, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // defaults -> YAML -> env (APP__*) -> CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(cli.verbose);

    if cli.print_config {
        println!("Effective configuration:\n{}", config.to_yaml()?);
        return Ok(());
    }

    logging::init(&config.logging)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config, &cli.modules).await,
        Commands::Check => check_config(&config, &cli.modules),
    }
}

fn check_config(config: &AppConfig, module_files: &[PathBuf]) -> Result<()> {
    tracing::info!("Checking configuration...");
    let modules = load_modules(module_files)?;
    println!("Configuration is valid");
    if !modules.is_empty() {
        println!("Module definitions are valid: {}", modules.len());
    }
    println!("{}", config.to_yaml()?);
    Ok(())
}

fn load_modules(paths: &[PathBuf]) -> Result<Vec<Module>> {
    paths.iter().map(|path| load_module(path)).collect()
}

fn load_module(path: &Path) -> Result<Module> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read module definition {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("invalid module definition {}", path.display()))
}

async fn connect_engine(
    config: &dt_management::DtManagementConfig,
    cancel: CancellationToken,
) -> ContainerManager {
    let engine: Option<Arc<dyn ContainerEngine>> = match BollardEngine::connect() {
        Ok(engine) => Some(Arc::new(engine)),
        Err(e) => {
            tracing::warn!(error = %e, "failed to create container engine client");
            None
        }
    };
    let own_container = (config.host_deployment == Topology::Container)
        .then_some(config.docker.container_name.as_str());
    ContainerManager::connect(engine, &config.docker, own_container, cancel).await
}

async fn run_server(config: AppConfig, module_files: &[PathBuf]) -> Result<()> {
    let modules = load_modules(module_files)?;
    let mut cfg = config.dt_management;
    tracing::info!(
        hostname = %cfg.hostname,
        host_deployment = %cfg.host_deployment,
        "DT Management Server starting"
    );

    let broker = if cfg.events.embedded_broker {
        let broker = EmbeddedBroker::start(&cfg.events)
            .await
            .context("failed to start embedded MQTT broker")?;
        cfg.events.mqtt_port = broker.port();
        Some(broker)
    } else {
        tracing::info!(
            host = %cfg.events.mqtt_host,
            port = cfg.events.mqtt_port,
            "using external MQTT broker"
        );
        None
    };

    let cancel = CancellationToken::new();
    let containers = Arc::new(connect_engine(&cfg, cancel.child_token()).await);

    let publisher = Arc::new(KafkaPublisher::new(cfg.kafka.bootstrap_servers.clone()));
    let bridge = Arc::new(EventBridge::started(publisher, &cfg.kafka));
    let forwarder = Arc::new(EventForwarder::new(Arc::clone(&bridge), &cfg.events));
    forwarder.start();
    let listener = cfg.events.listen.then(|| {
        spawn_module_listener(&cfg.events, Arc::clone(&forwarder), cancel.child_token())
    });

    let translator = AddressTranslator::new(&cfg);
    let connectors = Connectors::new(
        Arc::new(ProcessConnector::new(cfg.runtime.clone(), cancel.child_token())),
        Arc::new(ContainerConnector::new(
            Arc::clone(&containers),
            translator.clone(),
            &cfg.docker,
        )),
    );
    let orchestrator = Arc::new(DeploymentOrchestrator::new(
        translator,
        connectors,
        containers,
        Arc::new(HttpReadinessChecker::new()),
        Arc::clone(&forwarder),
        cfg.readiness.clone(),
    ));
    let mut service = ModuleService::new(Arc::clone(&orchestrator), Arc::clone(&bridge));
    if let Some(catalog) = HttpServiceCatalog::from_config(&cfg.catalog) {
        service = service.with_catalog(Arc::new(catalog));
    }

    for module in modules {
        let module_id = module.id.clone();
        match service.create_module(module).await {
            Ok(deployed) => tracing::info!(
                module_id = %deployed.id,
                endpoint = deployed.external_endpoint.as_deref().unwrap_or_default(),
                "module deployed"
            ),
            Err(e) => tracing::error!(module_id = %module_id, error = %e, "failed to deploy module"),
        }
    }

    tracing::info!(modules = service.list_modules().len(), "DT Management Server running");
    signals::wait_for_shutdown().await?;

    orchestrator.shutdown().await;
    cancel.cancel();
    if let Some(listener) = listener
        && let Err(e) = listener.await
    {
        tracing::warn!(error = %e, "module event listener terminated abnormally");
    }
    let pending_forwards = forwarder.shutdown().await;
    let pending_events = bridge.shutdown().await;
    if let Some(broker) = broker {
        tracing::debug!(addr = %broker.addr(), "embedded MQTT broker stops with the process");
    }
    tracing::info!(pending_forwards, pending_events, "DT Management Server stopped");
    Ok(())
}
