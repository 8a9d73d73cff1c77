//! codepair relay: hosts the shared session bus over WebSocket.
//!
//! Clients connect with `WsBus` and exchange bincode `RelayFrame`s. Set
//! `RUST_LOG=debug` to see per-connection traffic.

use std::time::Duration;

use clap::Parser;
use codepair_sync::{BusRelay, RelayConfig};
use log::info;

/// Relay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "codepair-relay")]
#[command(about = "WebSocket bus relay for codepair sessions")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090", value_name = "ADDR")]
    bind: String,

    /// Events buffered per channel before slow subscribers lag
    #[arg(long, default_value_t = 256)]
    capacity: usize,

    /// Drop presence not refreshed within this many seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    presence_ttl_secs: u64,

    /// How often stale presence is swept
    #[arg(long, default_value_t = 5)]
    sweep_interval_secs: u64,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.bind,
            broadcast_capacity: self.capacity,
            presence_ttl: (self.presence_ttl_secs > 0).then(|| Duration::from_secs(self.presence_ttl_secs)),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let config = Args::parse().into_config();

    info!(
        "Starting codepair relay on {} (presence ttl {:?})",
        config.bind_addr, config.presence_ttl
    );
    BusRelay::new(config).run().await
}
