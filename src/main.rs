//! Ember server binary
//!
//! Thin shell around the library: parse flags, initialize logging, bind
//! the listener, and hand control to the event loop.

use clap::Parser;
use ember::config::Config;
use ember::server::{net, Server};
use tracing::{error, info};

/// Ember version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ember-server", version, about = "Ember: in-memory key-value database server")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Listen port
    #[arg(short, long, default_value = "6379")]
    port: u16,

    /// Number of databases
    #[arg(long, default_value = "16")]
    databases: usize,

    /// Housekeeping frequency (cron ticks per second)
    #[arg(long, default_value = "10")]
    hz: u32,

    /// Quicklist fill: >0 entries per node, -1..-5 byte ladder 4k..64k
    #[arg(long, default_value = "-2")]
    list_max_packed_size: i32,

    /// Quicklist nodes kept raw at each end (0 disables compression)
    #[arg(long, default_value = "0")]
    list_compress_depth: u32,

    /// Hash stays packed up to this many fields
    #[arg(long, default_value = "128")]
    hash_max_packed_entries: usize,

    /// Hash stays packed while fields/values fit this many bytes
    #[arg(long, default_value = "64")]
    hash_max_packed_value: usize,

    /// Run as a read-only replica (expires wait for the primary)
    #[arg(long)]
    replica: bool,

    /// Maximum simultaneous connections
    #[arg(long, default_value = "10000")]
    max_clients: usize,
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ember=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = Config {
        bind: args.bind,
        port: args.port,
        databases: args.databases.max(1),
        hz: args.hz.clamp(1, 500),
        list_fill: args.list_max_packed_size,
        list_compress_depth: args.list_compress_depth,
        hash_max_packed_entries: args.hash_max_packed_entries,
        hash_max_packed_value: args.hash_max_packed_value,
        replica: args.replica,
        max_clients: args.max_clients,
    };

    info!("════════════════════════════════════════════════════════════");
    info!("  Ember v{VERSION} — in-memory key-value server");
    info!("════════════════════════════════════════════════════════════");
    info!(
        "Port: {} | DBs: {} | hz: {} | replica: {}",
        config.port, config.databases, config.hz, config.replica
    );

    let mut server = Server::new(config);
    if let Err(e) = net::run(&mut server) {
        error!("fatal: {e}");
        std::process::exit(1);
    }
    info!("bye");
}
