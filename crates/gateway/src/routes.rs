//! `/api/v1` handlers.

use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{Path, State},
        http::StatusCode,
        response::IntoResponse,
    },
    serde::Deserialize,
    serde_json::json,
    tracing::info,
    wagate_sessions::{
        BulkItemResult, CreatedSession, OutboundText, SentMessage, Session, StatusReport,
        TenantBinding,
    },
};

use crate::{error::ApiError, state::GatewayState};

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub owner_id: String,
    pub instance_key: String,
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub messages: Vec<OutboundText>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInstanceRequest {
    pub owner_id: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    pub webhook_url: Option<String>,
}

fn required(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} is required")));
    }
    Ok(())
}

fn check_webhook_url(raw: &str) -> ApiResult<()> {
    let url = url::Url::parse(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid webhook url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::BadRequest(format!(
            "webhook url must be http or https, got '{}'",
            url.scheme()
        )));
    }
    Ok(())
}

/// 32 random bytes, hex encoded.
pub fn generate_instance_key() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

// ── Sessions ─────────────────────────────────────────────────────────────────

pub async fn create_session(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreatedSession>> {
    required("ownerId", &req.owner_id)?;
    required("instanceKey", &req.instance_key)?;
    let created = state
        .manager
        .create_session(&req.owner_id, &req.instance_key)
        .await?;
    Ok(Json(created))
}

pub async fn list_sessions(State(state): State<Arc<GatewayState>>) -> Json<Vec<Session>> {
    Json(state.manager.list())
}

pub async fn session_status(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatusReport>> {
    Ok(Json(state.manager.get_status(&session_id).await?))
}

pub async fn send_message(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
    Json(req): Json<OutboundText>,
) -> ApiResult<Json<SentMessage>> {
    required("to", &req.to)?;
    let sent = state
        .manager
        .send_message(&session_id, &req.to, &req.message)
        .await?;
    Ok(Json(sent))
}

pub async fn send_bulk(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
    Json(req): Json<BulkRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".into()));
    }
    let results: Vec<BulkItemResult> = state.manager.send_bulk(&session_id, req.messages).await?;
    let sent = results.iter().filter(|r| r.success).count();
    Ok(Json(json!({
        "sent": sent,
        "failed": results.len() - sent,
        "results": results,
    })))
}

// ── Instances ────────────────────────────────────────────────────────────────

pub async fn disconnect_instance(
    State(state): State<Arc<GatewayState>>,
    Path(instance_key): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let disconnected = state.manager.disconnect_session(&instance_key).await?;
    Ok(Json(json!({
        "status": "ok",
        "disconnected": disconnected,
    })))
}

pub async fn register_instance(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<RegisterInstanceRequest>,
) -> ApiResult<impl IntoResponse> {
    required("ownerId", &req.owner_id)?;
    if let Some(url) = &req.webhook_url {
        check_webhook_url(url)?;
    }
    let key = match req.key {
        Some(key) if !key.trim().is_empty() => key.trim().to_string(),
        _ => generate_instance_key(),
    };
    let binding: TenantBinding = state
        .instances
        .register_instance(&req.owner_id, &key, req.webhook_url.as_deref())
        .await?;
    info!(owner_id = %req.owner_id, instance_key = %key, "instance registered");
    Ok((StatusCode::CREATED, Json(binding)))
}

pub async fn set_webhook(
    State(state): State<Arc<GatewayState>>,
    Path(instance_key): Path<String>,
    Json(req): Json<WebhookRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let url = req.webhook_url.as_deref().filter(|u| !u.trim().is_empty());
    if let Some(url) = url {
        check_webhook_url(url)?;
    }
    if !state.instances.set_webhook(&instance_key, url).await? {
        return Err(ApiError::NotFound(format!(
            "instance '{instance_key}' not found"
        )));
    }
    Ok(Json(json!({
        "status": "ok",
        "instanceKey": instance_key,
        "webhookUrl": url,
    })))
}
