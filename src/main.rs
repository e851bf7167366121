//! blipmq-delivery – runs the configured queues with their dispatchers and
//! expiry sweepers until interrupted.
//
//  $ blipmq-delivery --config blipmq.toml
use std::sync::Arc;

use blipmq_delivery::config::Config;
use blipmq_delivery::core::routing::AlternateQueue;
use blipmq_delivery::logging::init_logging;
use blipmq_delivery::{load_config, QueueRegistry};

use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "blipmq-delivery", version, about = "BlipMQ delivery daemon")]
struct Cli {
    /// Path to config TOML (env BLIPMQ_CONFIG overrides); defaults apply when absent.
    #[arg(short, long)]
    config: Option<String>,
}

fn declare_queues(registry: &QueueRegistry, config: &Config) {
    for declaration in &config.queues.declare {
        registry.declare(&declaration.name, config.queue_config(Some(declaration)));
    }
    for declaration in &config.queues.declare {
        let Some(alternate) = declaration.alternate.as_deref() else {
            continue;
        };
        let (target, created) = registry.declare(alternate, config.queue_config(None));
        if created {
            warn!(queue = %alternate, "alternate queue not declared; created with defaults");
        }
        if let Some(queue) = registry.get(&declaration.name) {
            queue.set_alternate(Arc::new(AlternateQueue::new(&target)));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config: Config = match std::env::var("BLIPMQ_CONFIG").ok().or(cli.config) {
        Some(path) => load_config(&path)?,
        None => Config::default(),
    };
    init_logging(&config.logging);

    let registry = QueueRegistry::new();
    declare_queues(&registry, &config);

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    for queue in registry.queues() {
        tasks.push(queue.spawn_dispatcher());
        tasks.push(queue.spawn_expiry_sweeper(config.expiry_sweep_interval()));
    }
    info!(queues = ?registry.names(), "📡 BlipMQ delivery core running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    for queue in registry.queues() {
        info!(stats = ?queue.stats(), "final queue stats");
    }
    registry.close();
    for task in tasks {
        task.abort();
        let _ = task.await;
    }
    info!("👋 BlipMQ delivery core stopped");
    Ok(())
}
