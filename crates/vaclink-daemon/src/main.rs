//! vaclink-daemon - robot vacuum gateway daemon.
//!
//! Binds the three protocol listeners, wires the standard handler set onto
//! the dispatch bus, and runs until SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use vaclink_core::repository::{InMemoryConnectionStore, InMemoryDeviceRepository};
use vaclink_daemon::handlers::register_handlers;
use vaclink_daemon::protocol::server::{
    ProtocolServer, ServerConfig, DEFAULT_COMMAND_PORT, DEFAULT_MAP_PORT, DEFAULT_TIME_SYNC_PORT,
};
use vaclink_daemon::protocol::{PacketBus, UnhandledPolicy};

/// vaclink daemon - robot vacuum protocol gateway
#[derive(Parser, Debug)]
#[command(name = "vaclink-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Bind host for all three listeners
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Command channel port
    #[arg(long, default_value_t = DEFAULT_COMMAND_PORT)]
    command_port: u16,

    /// Map-data channel port
    #[arg(long, default_value_t = DEFAULT_MAP_PORT)]
    map_port: u16,

    /// Time-sync channel port
    #[arg(long, default_value_t = DEFAULT_TIME_SYNC_PORT)]
    time_sync_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log and skip unhandled opcodes instead of failing the connection
    #[arg(long)]
    lenient_opcodes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let devices = Arc::new(InMemoryDeviceRepository::new());
    let connections = Arc::new(InMemoryConnectionStore::new());

    let bus = Arc::new(PacketBus::new());
    register_handlers(&bus, devices.clone());

    let policy = if args.lenient_opcodes {
        UnhandledPolicy::Warn
    } else {
        UnhandledPolicy::Fatal
    };
    let config = ServerConfig::default()
        .with_host(args.host.clone())
        .with_ports(args.command_port, args.map_port, args.time_sync_port)
        .with_unhandled_policy(policy);

    let server = ProtocolServer::bind(config, bus, devices, connections)
        .await
        .context("failed to bind protocol listeners")?;

    info!(pid = std::process::id(), "vaclink daemon started");

    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    server.close().await;
    info!("vaclink daemon stopped");
    Ok(())
}
