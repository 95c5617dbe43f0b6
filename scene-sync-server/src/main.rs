use std::str::FromStr;
use std::time::Duration;

use log::{info, warn};
use scene_sync::{ServerConfig, SyncServer};

/// Read `name`, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {name}={raw}");
                default
            }
        },
        Err(_) => default,
    }
}

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.bind_addr = env_or("SCENE_SYNC_ADDR", config.bind_addr);
    config.max_clients = env_or("SCENE_SYNC_MAX_CLIENTS", config.max_clients);

    let lock_timeout_ms = env_or("SCENE_SYNC_LOCK_TIMEOUT_MS", config.engine.lock_timeout.as_millis() as u64);
    config.engine.lock_timeout = Duration::from_millis(lock_timeout_ms);
    config.engine.client_queue_capacity =
        env_or("SCENE_SYNC_QUEUE_CAPACITY", config.engine.client_queue_capacity).max(1);
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = config_from_env();
    info!(
        "Starting scene-sync server (max {} clients, queue capacity {}, lock timeout {:?})",
        config.max_clients, config.engine.client_queue_capacity, config.engine.lock_timeout
    );

    let server = SyncServer::new(config);
    server.run().await
}
