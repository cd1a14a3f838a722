//! tilelog server — hosts one shared tile map over WebSocket.
//!
//! Configuration comes from the environment (`TILELOG_BIND` or `PORT`,
//! `TILELOG_BROADCAST_CAPACITY`, `TILELOG_WORLD`, `TILELOG_SEED`); log
//! verbosity from `RUST_LOG`, defaulting to `info`.

use log::info;

use tilelog_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!("Starting tilelog server on {}...", config.bind_addr);

    let server = SyncServer::bootstrap(config)?;
    let (last_entry_id, state) = server.snapshot().await;
    info!(
        "World {}x{}, {} layers, log at entry {last_entry_id}",
        state.world.width,
        state.world.height,
        state.world.layers.len()
    );

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            let fan_out = server.broadcast_stats().await;
            info!(
                "Shutting down: {} connections served, {} entries committed, {} rejected, {} undos",
                stats.total_connections,
                stats.committed_entries,
                stats.rejected_entries,
                stats.undos_applied
            );
            info!(
                "Broadcast: {} messages sent, {} dropped, {} lagged connections",
                fan_out.messages_sent, fan_out.messages_dropped, stats.lagged_connections
            );
        }
    }
    Ok(())
}
