// Palisade - JSON-RPC admission gateway
// Copyright (C) 2026 Palisade Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Palisade gateway server
//!
//! A JSON-RPC admission gateway that sits in front of a blockchain
//! execution node, enforcing method allow-lists, transaction admission
//! rules and distributed rate limits before forwarding, and proxying
//! duplex WebSocket sessions to the upstream node.

use clap::{Parser, Subcommand};
use eyre::Result;
use palisade_common::init_logging;
use palisade_gateway::{GatewayServerBuilder, LimiterSettings, RulesConfig, StoreConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

/// Palisade JSON-RPC Admission Gateway
#[derive(Parser, Debug)]
#[command(name = "palisade-gateway")]
#[command(about = "Palisade JSON-RPC Admission Gateway")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (repeat for more: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway server
    Server(ServerArgs),
}

/// Server mode arguments
#[derive(Parser, Debug)]
struct ServerArgs {
    // ========== General Configuration ==========
    /// Address to bind to
    /// Example: --host 0.0.0.0
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "8545")]
    port: u16,

    /// Upstream node HTTP endpoint
    /// Example: --upstream-http http://localhost:8551
    #[arg(long)]
    upstream_http: String,

    /// Upstream node WebSocket endpoint; duplex sessions are rejected when unset
    /// Example: --upstream-ws ws://localhost:8552
    #[arg(long)]
    upstream_ws: Option<String>,

    /// Rule file with the admission policy (JSON)
    #[arg(long)]
    rules_file: Option<PathBuf>,

    // ========== Backing Store Configuration ==========
    /// Redis URL for the shared counter store
    /// Example: --redis-url redis://127.0.0.1/
    #[arg(long, conflicts_with = "database_url")]
    redis_url: Option<String>,

    /// SQL database URL for the shared counter store
    /// Example: --database-url sqlite:///var/lib/palisade.db?mode=rwc
    #[arg(long)]
    database_url: Option<String>,

    // ========== Rate Limiter Configuration ==========
    /// Optimistic-transaction attempts before a rate-limit check fails
    #[arg(long, default_value = "5")]
    store_max_retries: u32,

    /// Fraction of a stock slice kept back when returning surplus
    #[arg(long, default_value = "0.2")]
    surplus_stock_rate: f64,

    /// Fraction of the ideal TPS below which surplus stock is returned
    #[arg(long, default_value = "0.2")]
    surplus_tps_rate: f64,

    /// Worker heartbeat cadence in seconds
    #[arg(long, default_value = "10")]
    heartbeat_interval: u64,

    // ========== Session Configuration ==========
    /// Dead-session sweep cadence in seconds
    #[arg(long, default_value = "30")]
    sweep_interval: u64,

    /// Session stats log cadence in seconds
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    // ========== Upstream Configuration ==========
    /// Upstream HTTP timeout in seconds
    #[arg(long, default_value = "10")]
    upstream_timeout: u64,

    /// Block-number cache TTL in seconds
    #[arg(long, default_value = "5")]
    block_number_ttl: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set RUST_LOG based on verbosity
    if std::env::var("RUST_LOG").is_err() {
        let level = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
    }
}

/// Run the gateway server
async fn run_server(args: ServerArgs) -> Result<()> {
    init_logging("palisade-gateway", true)?;

    let rules = match &args.rules_file {
        Some(path) => RulesConfig::load(path)?,
        None => RulesConfig::default(),
    };

    let store = if let Some(url) = args.redis_url {
        StoreConfig::Redis(url)
    } else if let Some(url) = args.database_url {
        StoreConfig::Sql(url)
    } else {
        info!("No shared store configured; rate-limit counters stay process-local");
        StoreConfig::Memory
    };

    let settings = LimiterSettings {
        max_retries: args.store_max_retries,
        surplus_stock_rate: args.surplus_stock_rate,
        surplus_tps_rate: args.surplus_tps_rate,
        ..LimiterSettings::default()
    };

    let mut builder = GatewayServerBuilder::new(&args.upstream_http)
        .rules(rules)
        .store(store)
        .limiter_settings(settings)
        .upstream_timeout(args.upstream_timeout)
        .heartbeat_interval(args.heartbeat_interval)
        .sweep_interval(args.sweep_interval)
        .stats_interval(args.stats_interval)
        .block_number_ttl(args.block_number_ttl);

    if let Some(url) = args.upstream_ws {
        builder = builder.upstream_ws_url(url);
    }

    let server = builder.build().await?;

    let ip = IpAddr::from_str(&args.host)?;
    let addr = SocketAddr::from((ip, args.port));
    info!("Starting Palisade gateway on {}", addr);

    let shutdown_handle = server.clone();
    tokio::select! {
        result = server.serve(addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            shutdown_handle.shutdown();
        }
    }

    Ok(())
}
