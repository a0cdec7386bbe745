use settlement::{Config, MockPaymentRail, SettlementEngine};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("ATC_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::from_env()?,
    };

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("ATC settlement engine starting...");
    info!(
        "Configuration loaded - storage: {:?}, currency: {}, tick: {}s",
        config.core.storage,
        config.core.currency.code(),
        config.scheduler_tick_secs
    );

    // Settlement updates go to the log as JSON alongside structured logs
    let log_events = config.log_json;
    let engine = SettlementEngine::new(config, Arc::new(MockPaymentRail::new()))?;
    let mut handles = engine.start()?;
    if log_events {
        handles.push(engine.log_events());
    }

    info!("ATC settlement engine initialized successfully");

    tokio::signal::ctrl_c().await?;
    engine.shutdown();
    for handle in handles {
        handle.abort();
    }

    info!("ATC settlement engine stopped");
    Ok(())
}
