//! Layer-4 TCP/UDP port forwarder
//!
//! Architecture:
//! - `config`: CLI parsing and bind-specification syntax
//! - `tcp`: per-connection bidirectional byte pump
//! - `udp`: NAT-style session relay over an LRU table
//! - `cache` / `pool`: the LRU session table and object recycling
//! - `stats`: byte/request counters behind the periodic status line

mod cache;
mod config;
mod error;
mod logger;
mod pool;
mod stats;
mod tcp;
mod udp;

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use logger::log;

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::stats::RelayStats;
use crate::tcp::{TcpConfig, TcpEngine};
use crate::udp::UdpConfig;

// All relay state is mutated on the loop thread; worker threads buy nothing
// for a forwarder that is syscall-bound.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = config::CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(logger::LogLevel::from_str(&cli.log_level), cli.log_timestamps);

    log::info!(
        rules = cli.bindings.len(),
        tcp = cli.tcp_enabled(),
        udp = cli.udp_enabled(),
        "Starting port forwarder"
    );

    let mut engines = JoinSet::new();

    if cli.tcp_enabled() {
        let stats = Arc::new(RelayStats::new());
        let engine = TcpEngine::new(
            TcpConfig {
                buffer_size: cli.buffer_size,
                connect_timeout: cli.connect_timeout,
                stats_interval: cli.stats_interval,
            },
            stats,
        );
        let bindings = cli.bindings.clone();
        engines.spawn(async move { engine.run(bindings).await });
    }

    if cli.udp_enabled() {
        let stats = Arc::new(RelayStats::new());
        let cfg = UdpConfig {
            buffer_size: cli.udp_buffer_size,
            idle_timeout: cli.idle_timeout,
            idle_check_interval: cli.idle_check_interval,
            stats_interval: cli.stats_interval,
            conn_track_max: cli.conn_track_max,
        };
        let bindings = cli.bindings.clone();
        engines.spawn(async move { udp::run(cfg, stats, bindings).await });
    }

    // Run until a shutdown signal, or until an engine fails to start.
    tokio::select! {
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received, closing listeners");
        }
        Some(result) = engines.join_next() => {
            // Engines only return early on a startup failure (unbindable
            // address); surface it as a fatal error.
            result??;
        }
    }

    engines.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return std::future::pending().await,
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
