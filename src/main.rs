//! tinyproxy-check - Tinyproxy Monitoring Check
//!
//! Runs the tinyproxy check on an interval and writes every report to stdout
//! as JSON lines. Logs go to stderr.

use tinyproxy_check::config::AgentConfig;
use tinyproxy_check::probe::TinyproxyCheck;
use tinyproxy_check::report::JsonLinesSink;
use tinyproxy_check::scheduler::Scheduler;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("tinyproxy_check=info".parse()?))
        .init();

    // Load configuration
    let cfg = AgentConfig::load()?;
    tracing::info!("Loaded {} instance(s)", cfg.instances.len());
    for instance in &cfg.instances {
        tracing::info!(
            "Instance {} (Host: {}, timeout {}s)",
            instance.target_url(),
            instance.stat_host,
            instance.timeout
        );
    }

    let check = TinyproxyCheck::new()?;
    let scheduler = Scheduler::new(check, Arc::new(JsonLinesSink::stdout()), cfg.interval);

    if cfg.run_once {
        scheduler.run_once(&cfg.instances).await;
        return Ok(());
    }

    let handles = scheduler.start(cfg.instances);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.stop();
    for handle in handles {
        handle.await?;
    }

    Ok(())
}
