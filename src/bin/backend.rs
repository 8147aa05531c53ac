#![forbid(unsafe_code)]

//! Axum API in front of the VOD catalog.
//!
//! Authentication happens upstream: the session layer forwards the signed-in
//! user's id in the `x-user-id` header and every route is scoped to it.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path as AxumPath, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use clap::Parser;
use serde::Deserialize;
use tokio::signal;
use tracing::{error, info};
use vod_commander::{
    catalog::{Catalog, ChannelSummary, VodPage},
    config::{RuntimeOverrides, resolve_runtime_config},
    error::Error,
    logging::init_logging,
    metadata::{ChannelRecord, MetadataStore, UserSettings},
    twitch::TwitchClient,
};

const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Serve the VOD command API")]
struct BackendArgs {
    /// SQLite database file (VOD_COMMANDER_DB).
    #[arg(long)]
    db: Option<PathBuf>,
    /// Listen address (VOD_COMMANDER_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Listen port (VOD_COMMANDER_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Alternative .env file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            database_path: self.db,
            host: self.host,
            port: self.port,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    catalog: Arc<Catalog>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Configuration(_) | Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Id of the signed-in user, taken from [`USER_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct AuthUser(String);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| AuthUser(value.to_string()))
            .ok_or_else(|| ApiError::unauthorized("authentication required"))
    }
}

#[derive(Debug, Deserialize)]
struct AddChannelRequest {
    username: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RefreshRequest {
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoadMoreRequest {
    limit: Option<i64>,
    offset: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config = resolve_runtime_config(BackendArgs::parse().overrides())?;
    let host: IpAddr = config
        .host
        .parse()
        .context("expected a valid IPv4 or IPv6 address for --host/VOD_COMMANDER_HOST")?;

    let store = MetadataStore::open(&config.database_path)
        .await
        .context("initializing database")?;
    let platform = Arc::new(TwitchClient::new(config.twitch.clone()));
    let state = AppState {
        catalog: Arc::new(Catalog::new(store, platform)),
    };

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, database = %config.database_path.display(), "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/channels", get(list_channels).post(add_channel))
        .route("/api/channels/{id}", delete(remove_channel))
        .route("/api/channels/{id}/refresh", post(refresh_channel))
        .route("/api/channels/{id}/vods", post(load_more_vods))
        .route("/api/settings", get(get_settings).put(update_settings))
        .fallback(api_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {}", err);
    }
}

async fn api_fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn list_channels(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Vec<ChannelSummary>>> {
    Ok(Json(state.catalog.list_channels(&user).await?))
}

async fn add_channel(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<AddChannelRequest>,
) -> ApiResult<(StatusCode, Json<ChannelRecord>)> {
    let channel = state.catalog.add_channel(&user, &payload.username).await?;
    Ok((StatusCode::CREATED, Json(channel)))
}

async fn remove_channel(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    state.catalog.remove_channel(&user, id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Pulls the newest VODs from Twitch using the caller's page size and chat
/// settings unless the request overrides the limit. The body is optional.
async fn refresh_channel(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AxumPath(id): AxumPath<i64>,
    payload: Option<Json<RefreshRequest>>,
) -> ApiResult<Json<VodPage>> {
    let Json(payload) = payload.unwrap_or_default();
    let settings = state.catalog.get_settings(&user).await?;
    let limit = payload.limit.unwrap_or(settings.vods_per_load);
    let page = state
        .catalog
        .refresh(&user, id, limit, Some(&settings.render()))
        .await?;
    Ok(Json(page))
}

async fn load_more_vods(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AxumPath(id): AxumPath<i64>,
    payload: Option<Json<LoadMoreRequest>>,
) -> ApiResult<Json<VodPage>> {
    let Json(payload) = payload.unwrap_or_default();
    let settings = state.catalog.get_settings(&user).await?;
    let limit = payload.limit.unwrap_or(settings.vods_per_load);
    let page = state
        .catalog
        .load_more(&user, id, limit, payload.offset, Some(&settings.render()))
        .await?;
    Ok(Json(page))
}

async fn get_settings(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<UserSettings>> {
    Ok(Json(state.catalog.get_settings(&user).await?))
}

async fn update_settings(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<UserSettings>,
) -> ApiResult<Json<UserSettings>> {
    Ok(Json(state.catalog.update_settings(&user, payload).await?))
}
