//! HTTP surface
//!
//! - `GET /`: home page
//! - `GET /channels`: identities of all registered connections (JSON)
//! - `GET /connect`: WebSocket upgrade, the connection becomes a channel
//! - `GET /subscribe?ip=<identity>`: subscribe the caller to a channel

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::{self, Connection};
use crate::hub::{HubError, HubHandle};
use crate::identity::{self, SESSION_COOKIE};
use crate::transport;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(hub: HubHandle, config: Config) -> Self {
        Self {
            hub,
            config: Arc::new(config),
        }
    }
}

/// Build the router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/channels", get(channels))
        .route("/connect", get(connect))
        .route("/subscribe", get(subscribe))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn home(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    match tokio::fs::read_to_string(&state.config.home_page).await {
        Ok(page) => Ok(Html(page)),
        Err(e) => {
            warn!(path = %state.config.home_page.display(), error = %e, "failed to read home page");
            Err(ApiError::NotFound)
        }
    }
}

async fn channels(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.hub.list_identities().await?))
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    ip: Option<String>,
}

async fn subscribe(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<SubscribeQuery>,
) -> Result<StatusCode, ApiError> {
    let channel = query
        .ip
        .filter(|ip| !ip.is_empty())
        .ok_or(ApiError::MissingChannel)?;
    let subscriber = jar
        .get(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_owned())
        .ok_or(ApiError::MissingSession)?;

    state.hub.subscribe(&subscriber, &channel).await?;
    Ok(StatusCode::OK)
}

async fn connect(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let upgrade = upgrade?;
    let identity = identity::from_request(&headers, peer);
    let cookie = Cookie::build((SESSION_COOKIE, identity.clone())).path("/");
    let limit = state.config.max_message_size;

    let failed_identity = identity.clone();
    let response = upgrade
        .max_message_size(limit)
        .max_frame_size(limit)
        .on_failed_upgrade(move |e| {
            warn!(identity = %failed_identity, error = %e, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| accept(socket, identity, state));

    Ok((jar.add(cookie), response))
}

/// Register an upgraded socket and pump it until it closes
async fn accept(socket: WebSocket, identity: String, state: AppState) {
    let (connection, outbound) = Connection::new(identity, state.config.queue_capacity);
    if let Err(e) = state.hub.register(connection.clone()).await {
        warn!(identity = %connection.identity(), error = %e, "failed to register connection");
        return;
    }
    debug!(identity = %connection.identity(), "connection accepted");

    let (sink, source) = transport::split(socket);
    connection::run(
        connection,
        outbound,
        source,
        sink,
        state.hub.clone(),
        state.config.timing(),
    )
    .await;
}

/// Errors returned by non-streaming requests
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Handshake(#[from] WebSocketUpgradeRejection),
    #[error("pass ip")]
    MissingChannel,
    #[error("missing ws-ip cookie")]
    MissingSession,
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error("not found")]
    NotFound,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Handshake(rejection) => rejection.status(),
            ApiError::MissingChannel | ApiError::MissingSession => StatusCode::BAD_REQUEST,
            ApiError::Hub(HubError::UnknownSubscriber(_) | HubError::UnknownChannel(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Hub(HubError::Stopped) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
