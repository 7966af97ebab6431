use std::sync::Arc;

use axum::{
    Router,
    http::Method,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use crate::server::command_dispatcher::CommandDispatcher;
use crate::server::core_services::NodeStreamContext;

pub mod error;
pub mod routes;
pub mod websocket_handler;
pub mod ws_node_handler;

#[derive(Clone)]
pub struct AppState {
    pub node_context: Arc<NodeStreamContext>,
    pub dispatcher: Arc<CommandDispatcher>,
}

async fn health_check_handler() -> &'static str {
    "OK"
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check_handler))
        .route("/api/nodes", get(routes::node_routes::list_nodes))
        .route(
            "/api/nodes/connected",
            get(routes::node_routes::list_connected_nodes),
        )
        .route("/api/nodes/{id}", get(routes::node_routes::get_node))
        .route(
            "/api/nodes/{id}/hashrate",
            get(routes::node_routes::hashrate_history),
        )
        .route("/api/nodes/{id}/restart", post(routes::node_routes::restart_node))
        .route("/api/nodes/{id}/stop", post(routes::node_routes::stop_node))
        .route("/api/nodes/{id}/start", post(routes::node_routes::start_node))
        .route(
            "/api/nodes/{id}/toggle-device",
            post(routes::node_routes::toggle_device),
        )
        .route(
            "/api/configs",
            get(routes::node_routes::get_configs).post(routes::node_routes::update_configs),
        )
        .route("/ws/nodes", get(ws_node_handler::ws_node_handler))
        .route("/ws/dashboard", get(websocket_handler::ws_dashboard_handler))
        .with_state(app_state)
        .layer(cors)
}
