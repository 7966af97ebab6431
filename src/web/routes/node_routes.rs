//! Administrative command surface. Each command route resolves to one
//! dispatcher call and returns the delivered count; zero delivered surfaces
//! as an HTTP error, never as a silent success.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

use crate::store::{DeviceType, FleetNode, HashrateSample};
use crate::web::{AppState, error::AppError};

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredResponse {
    pub delivered: usize,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub device_type: Option<DeviceType>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ToggleDeviceRequest {
    pub device_type: DeviceType,
    pub enabled: bool,
    #[serde(default)]
    pub gpu_id: Option<usize>,
}

pub async fn list_nodes(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<FleetNode>>, AppError> {
    let nodes = app_state.node_context.store.list_nodes().await?;
    Ok(Json(nodes))
}

/// Nodes with a live connection only. A reaped node drops out of this list
/// within one sweep interval.
pub async fn list_connected_nodes(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<FleetNode>>, AppError> {
    let nodes = app_state
        .node_context
        .store
        .list_nodes()
        .await?
        .into_iter()
        .filter(FleetNode::connected)
        .collect();
    Ok(Json(nodes))
}

pub async fn get_node(
    State(app_state): State<Arc<AppState>>,
    Path(system_id): Path<String>,
) -> Result<Json<FleetNode>, AppError> {
    let node = app_state
        .node_context
        .store
        .get_node(&system_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Node {system_id}")))?;
    Ok(Json(node))
}

pub async fn hashrate_history(
    State(app_state): State<Arc<AppState>>,
    Path(system_id): Path<String>,
) -> Result<Json<Vec<HashrateSample>>, AppError> {
    let samples = app_state
        .node_context
        .store
        .hashrate_history(&system_id)
        .await?;
    Ok(Json(samples))
}

pub async fn restart_node(
    State(app_state): State<Arc<AppState>>,
    Path(system_id): Path<String>,
) -> Result<Json<DeliveredResponse>, AppError> {
    let delivered = app_state.dispatcher.restart(&system_id).await?;
    Ok(Json(DeliveredResponse { delivered }))
}

pub async fn stop_node(
    State(app_state): State<Arc<AppState>>,
    Path(system_id): Path<String>,
) -> Result<Json<DeliveredResponse>, AppError> {
    let delivered = app_state.dispatcher.stop(&system_id).await?;
    Ok(Json(DeliveredResponse { delivered }))
}

pub async fn start_node(
    State(app_state): State<Arc<AppState>>,
    Path(system_id): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<DeliveredResponse>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let delivered = app_state
        .dispatcher
        .start(&system_id, request.device_type)
        .await?;
    Ok(Json(DeliveredResponse { delivered }))
}

pub async fn toggle_device(
    State(app_state): State<Arc<AppState>>,
    Path(system_id): Path<String>,
    Json(request): Json<ToggleDeviceRequest>,
) -> Result<Json<DeliveredResponse>, AppError> {
    let delivered = app_state
        .dispatcher
        .toggle_device(
            &system_id,
            request.device_type,
            request.enabled,
            request.gpu_id,
        )
        .await?;
    Ok(Json(DeliveredResponse { delivered }))
}

pub async fn get_configs(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let configs = app_state.node_context.configs.read().await.clone();
    Ok(Json(configs))
}

/// Replaces the global configuration set and pushes a `config-update` to
/// every bound node.
pub async fn update_configs(
    State(app_state): State<Arc<AppState>>,
    Json(configs): Json<serde_json::Value>,
) -> Result<Json<DeliveredResponse>, AppError> {
    {
        let mut current = app_state.node_context.configs.write().await;
        *current = configs;
    }
    let delivered = app_state.dispatcher.push_configs().await?;
    Ok(Json(DeliveredResponse { delivered }))
}
