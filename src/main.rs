use anyhow::Result;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use walkpad_ftms_bridge::{Bridge, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "walkpad_ftms_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting WalkPad FTMS bridge");

    // Load configuration
    let config = Config::from_file_or_default("config.toml");
    config.validate()?;
    info!(
        "Configuration loaded: adapter={}, ftms_name={}, stats_interval={}ms, auto_mode={}",
        config.ble_adapter.as_deref().unwrap_or("default"),
        config.ftms_device_name,
        config.stats_interval_ms,
        config.auto_mode
    );

    // Save default config if it doesn't exist
    if !std::path::Path::new("config.toml").exists() {
        config.save("config.toml")?;
        info!("Created default config.toml");
    }

    let (bridge, handle) = Bridge::new(config);
    let mut supervisor = tokio::spawn(bridge.run());

    info!("Bridge is running, press Ctrl+C to stop");

    tokio::select! {
        res = &mut supervisor => {
            if let Err(e) = res {
                error!("Supervisor task failed: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully");
            handle.shutdown().await;
            let _ = supervisor.await;
        }
    }

    info!("WalkPad FTMS bridge stopped");
    Ok(())
}
