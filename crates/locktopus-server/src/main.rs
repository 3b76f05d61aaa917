// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Locktopus service binary: CLI/env configuration, logging setup, HTTP
//! listener with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use locktopus_server::{app, AppState, DEFAULT_ABANDON_TIMEOUT_MS, DEFAULT_HOST, DEFAULT_PORT};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Locktopus lock service")]
struct Args {
    /// Hostname for listening.
    #[arg(short = 'H', long, env = "LOCKTOPUS_HOST", default_value = DEFAULT_HOST)]
    host: String,
    /// Port to listen on.
    #[arg(short = 'p', long, env = "LOCKTOPUS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Default abandon timeout (ms) used for releasing locks of connections
    /// closed without a release.
    #[arg(
        long,
        env = "LOCKTOPUS_DEFAULT_ABANDON_TIMEOUT",
        default_value_t = DEFAULT_ABANDON_TIMEOUT_MS
    )]
    default_abandon_timeout: u64,
    /// Log usage statistics of every namespace each N > 0 seconds.
    #[arg(long, env = "LOCKTOPUS_STATS_INTERVAL", default_value_t = 0)]
    stats_interval: u64,
    /// Log client sessions.
    #[arg(long, env = "LOCKTOPUS_LOG_CLIENTS")]
    log_clients: bool,
    /// Log locks caused by client sessions.
    #[arg(long, env = "LOCKTOPUS_LOG_LOCKS")]
    log_locks: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    if !args.log_clients {
        filter = filter.add_directive("locktopus_server::session=off".parse()?);
    }
    if !args.log_locks {
        filter = filter.add_directive("locktopus_server::locks=off".parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state = Arc::new(AppState::new(Duration::from_millis(
        args.default_abandon_timeout,
    )));

    if args.stats_interval > 0 {
        let stats_state = Arc::clone(&state);
        let period = Duration::from_secs(args.stats_interval);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; there is nothing to report
            // yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for (name, stats) in stats_state.namespaces.snapshot_all() {
                    info!("multilocker namespace {name}: {stats:?}");
                }
            }
        });
    }

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("cannot listen on {}:{}", args.host, args.port))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP listener error")?;

    info!("closing namespaces");
    state.namespaces.close_all().await;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
}
