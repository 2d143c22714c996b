/// Poll a CASA unit and log every datapoint change
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use swegon_casa::{registers, DeviceCoordinator, UnitConfig, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
struct Args {
    /// TOML file with the unit settings; `SWEGON_*` variables override it.
    #[arg(long, env = "SWEGON_CONFIG")]
    config: Option<PathBuf>,
    /// Switch the operating mode once connected, e.g. `3` for boost.
    #[arg(long)]
    op_mode: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = UnitConfig::load(args.config.as_deref())?;
    tracing::info!(name = %config.name, host = %config.host, port = config.port, "polling unit");

    let coordinator = Arc::new(DeviceCoordinator::from_config(&config)?);
    let mut changes = coordinator.subscribe();
    let polling = coordinator.spawn_polling();

    if let Some(op_mode) = args.op_mode {
        coordinator
            .write_value(registers::COMMANDS, "Op_Mode", Value::EnumIndex(op_mode))
            .await?;
    }

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => {
                    let unit = coordinator
                        .register(&change.group, &change.key)
                        .ok()
                        .and_then(|register| register.unit)
                        .unwrap_or_default();
                    tracing::info!("{}/{} = {} {}", change.group, change.key, change.value, unit);
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "missed changes"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    polling.abort();
    coordinator.link().disconnect().await;
    Ok(())
}
