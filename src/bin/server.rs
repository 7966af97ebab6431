use std::net::SocketAddr;
use std::sync::Arc;

use dotenv::dotenv;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

use minefleet_backend::server::command_dispatcher::CommandDispatcher;
use minefleet_backend::server::config::ServerConfig;
use minefleet_backend::server::core_services::{NodeStreamContext, spawn_reaper};
use minefleet_backend::server::node_broadcaster::NodeEventBroadcaster;
use minefleet_backend::server::registry::ConnectionRegistry;
use minefleet_backend::store::{MemoryStore, NodeStore};
use minefleet_backend::web::{AppState, create_router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let store: Arc<dyn NodeStore> = Arc::new(MemoryStore::new());
    reset_connection_state(&store).await?;

    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = NodeEventBroadcaster::new(256);
    let configs = Arc::new(RwLock::new(serde_json::json!({})));

    let node_context = Arc::new(NodeStreamContext {
        registry: registry.clone(),
        store: store.clone(),
        broadcaster: broadcaster.clone(),
        configs: configs.clone(),
        hashrate_retention: config.hashrate_retention,
    });
    spawn_reaper(
        node_context.clone(),
        config.reap_interval,
        config.stale_threshold,
    );

    let dispatcher = Arc::new(CommandDispatcher::new(
        registry,
        store,
        configs,
        broadcaster,
    ));
    let app_state = Arc::new(AppState {
        node_context,
        dispatcher,
    });

    let router = create_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("MineFleet coordinator listening on {}", config.listen_addr);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// No connection can exist at boot; any persisted `connectionId` is a
/// leftover from an unclean shutdown and the derived status must follow.
async fn reset_connection_state(
    store: &Arc<dyn NodeStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    for node in store.list_nodes().await? {
        if node.connected() {
            store
                .update_node(
                    &node.system_id,
                    Box::new(|node| {
                        node.connection_id = None;
                        node.recompute_status();
                    }),
                )
                .await?;
        }
    }
    Ok(())
}
