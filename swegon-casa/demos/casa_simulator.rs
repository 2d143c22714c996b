/// Swegon CASA TCP Modbus simulator
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use swegon_casa::simulator::{spawn_tcp_simulator, CasaUnit, Simulator};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "CASA_SIM_ADDR", default_value = "127.0.0.1:5020")]
    addr: SocketAddr,
    #[arg(long, default_value = "CASA R5H")]
    model: String,
    #[arg(long, default_value = "SN12345678")]
    serial: String,
    /// Milliseconds between state updates.
    #[arg(long, default_value_t = 1000)]
    update_period_ms: u64,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let simulator = Simulator::new(CasaUnit::new(&args.model, &args.serial, (1, 0, 0)));
    let updates = simulator.spawn_state_updates(Duration::from_millis(args.update_period_ms));

    let (local_addr, server) = spawn_tcp_simulator(args.addr, simulator).await?;
    tracing::info!(%local_addr, model = %args.model, "serving CASA unit");

    tokio::select! {
        _ = server => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    updates.abort();
    Ok(())
}
