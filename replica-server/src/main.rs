//! Standalone sync server.
//!
//! ```text
//! RUST_LOG=info replica-server --bind 0.0.0.0:9090 --debounce-ms 50
//! ```

use clap::Parser;
use replica_sync::server::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(version, about = "Serve replicated observable stores over WebSocket")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Debounce window for value writes, in milliseconds (0 = off)
    #[arg(long, default_value_t = 0)]
    debounce_ms: u64,

    /// Seconds before a departed peer's values are removed
    #[arg(long, default_value_t = 30)]
    orphan_grace_secs: u64,

    /// Never remove values of departed peers
    #[arg(long, conflicts_with = "orphan_grace_secs")]
    keep_orphans: bool,

    /// Pushes buffered per connection before it is dropped as lagging
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// WebSocket ping interval, in seconds
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            broadcast_capacity: self.broadcast_capacity,
            debounce_ms: self.debounce_ms,
            orphan_grace_secs: (!self.keep_orphans).then_some(self.orphan_grace_secs),
            heartbeat_interval_secs: self.heartbeat_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let cli = Cli::parse();
    log::debug!("{cli:?}");

    let server = SyncServer::new(cli.server_config());
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            log::info!(
                "Shutting down after {} connections, {} messages",
                stats.total_connections,
                stats.total_messages
            );
        }
    }
    Ok(())
}
