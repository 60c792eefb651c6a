//! # Courier: standalone execution core
//!
//! Wires the in-memory lane sink, command registry and channel transmitter
//! into a dispatcher and scheduler, then polls until ctrl-c.
//!
//! Usage:
//!   courier                         # ~/.courier/config.toml or defaults
//!   courier --config courier.toml   # Explicit config file
//!   courier --heartbeat-secs 5 -v   # Faster heartbeat, debug logging

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use courier_core::CourierConfig;
use courier_runtime::{
    ChannelTransmitter, CommandRegistry, Dispatcher, LaneSink, MessageHeader, Routing, Scheduler,
    ServiceMessage, TimerConfig,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "courier", version, about = "📬 Courier: envelope dispatcher and polling scheduler")]
struct Cli {
    /// Config file (default: ~/.courier/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the scheduler poll interval
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Heartbeat schedule interval
    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "courier=debug,courier_runtime=debug"
    } else {
        "courier=info,courier_runtime=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => CourierConfig::load_from(path)?,
        None => CourierConfig::load()?,
    };
    if let Some(poll_ms) = cli.poll_ms {
        config.scheduler.poll_interval_ms = poll_ms;
    }
    config.validate()?;

    let sink = Arc::new(LaneSink::new(&config.lanes)?);

    let registry = Arc::new(CommandRegistry::new());
    registry.register(MessageHeader::new("courier", "system", "ping"), |msg: ServiceMessage| async move {
        Ok(Some(serde_json::json!({ "pong": msg.id, "received": msg.created_at })))
    });

    let transmitter = Arc::new(ChannelTransmitter::new());
    let mut console = transmitter.open("console", 64);
    tokio::spawn(async move {
        while let Some(msg) = console.recv().await {
            tracing::info!(
                "💬 console ← {} status={} payload={}",
                msg.header,
                msg.status.as_deref().unwrap_or("-"),
                msg.payload
            );
        }
    });

    let dispatcher = Dispatcher::builder(config.dispatcher.clone())
        .resolver(registry)
        .transmitter(transmitter)
        .sink(sink.clone())
        .build()?;

    let scheduler = Scheduler::new(config.scheduler.clone(), sink.clone());
    let heartbeat = dispatcher.clone();
    scheduler.register_internal(
        move |_token: CancellationToken| {
            let dispatcher = heartbeat.clone();
            async move {
                let ping = ServiceMessage::new(MessageHeader::new("courier", "system", "ping"), serde_json::Value::Null)
                    .with_response(MessageHeader::new("console", "system", "pong"));
                let outcome = dispatcher.process_message(ping, Routing::Unrouted).await;
                match outcome.error {
                    Some(e) => Err(anyhow::anyhow!("heartbeat failed: {e}")),
                    None => Ok(()),
                }
            }
        },
        TimerConfig::delayed(Duration::ZERO, Duration::from_secs(cli.heartbeat_secs.max(1))),
        "heartbeat",
    )?;

    println!("📬 Courier v{}", env!("CARGO_PKG_VERSION"));
    println!("   ⏰ Poll:      every {}ms", config.scheduler.poll_interval_ms);
    println!("   💓 Heartbeat: every {}s", cli.heartbeat_secs.max(1));
    println!("   🚦 Lanes:     {:?}", config.lanes);
    println!("   Press Ctrl+C to stop\n");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("🛑 Shutdown requested");
        }
        trigger.cancel();
    });

    scheduler.run(shutdown).await?;

    tokio::time::timeout(Duration::from_secs(5), sink.wait_idle())
        .await
        .map_err(|_| anyhow::anyhow!("in-flight work did not finish within 5s"))?;

    let stats = dispatcher.stats();
    tracing::info!(
        "📊 processed={} succeeded={} failed={} unresolved={}",
        stats.processed,
        stats.succeeded,
        stats.failed,
        stats.unresolved
    );
    Ok(())
}
