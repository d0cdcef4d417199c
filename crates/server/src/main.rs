use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use shared::{
    domain::{GroupId, TokenId, TokenSnapshot, TokenState},
    error::{ApiError, ErrorCode},
    protocol::{
        CoordinationEntry, CreateGroupRequest, EnqueueTokenRequest, GroupSummary, QueueEvent,
        ReorderRequest, ReorderResponse, SetGroupStateRequest, SetStateRequest, TokenSummary,
        TransferRequest,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

mod api;
mod app_state;
mod config;

use api::ApiContext;
use app_state::AppState;
use config::{load_settings, prepare_database_url};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct ListTokensQuery {
    state: Option<TokenState>,
}

#[derive(Debug, Deserialize)]
struct CoordinationLogQuery {
    limit: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let (events, _) = broadcast::channel(settings.event_buffer);

    let state = AppState {
        api: ApiContext { storage },
        events,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "queue server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/groups", get(http_list_groups).post(http_create_group))
        .route("/groups/:group_id/state", post(http_set_group_state))
        .route(
            "/groups/:group_id/tokens",
            get(http_list_tokens).post(http_enqueue_token),
        )
        .route(
            "/groups/:group_id/coordination_log",
            get(http_coordination_log),
        )
        .route("/tokens/:token_id", get(http_read_token))
        .route("/tokens/:token_id/reorder", post(http_reorder_token))
        .route("/tokens/:token_id/state", post(http_set_token_state))
        .route("/tokens/:token_id/transfer", post(http_transfer_token))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    if err.code == ErrorCode::Internal {
        error!(message = %err.message, "request failed");
    }
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            warn!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

async fn http_list_groups(State(state): State<Arc<AppState>>) -> ApiResult<Vec<GroupSummary>> {
    let groups = api::list_groups(&state.api).await.map_err(reject)?;
    Ok(Json(groups))
}

async fn http_create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<GroupSummary> {
    let group = api::create_group(&state.api, &req.name)
        .await
        .map_err(reject)?;
    info!(group_id = group.group_id.0, name = %group.name, "group created");
    state.publish(QueueEvent::GroupCreated {
        group: group.clone(),
    });
    Ok(Json(group))
}

async fn http_set_group_state(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Json(req): Json<SetGroupStateRequest>,
) -> ApiResult<GroupSummary> {
    let (group, event) = api::set_group_state(&state.api, GroupId(group_id), req.state)
        .await
        .map_err(reject)?;
    info!(group_id, state = %group.state, "group state changed");
    state.publish(event);
    Ok(Json(group))
}

async fn http_list_tokens(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Query(q): Query<ListTokensQuery>,
) -> ApiResult<Vec<TokenSummary>> {
    let tokens = api::list_tokens(&state.api, GroupId(group_id), q.state)
        .await
        .map_err(reject)?;
    Ok(Json(tokens))
}

async fn http_enqueue_token(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Json(req): Json<EnqueueTokenRequest>,
) -> ApiResult<TokenSummary> {
    let (token, event) = api::enqueue_token(&state.api, GroupId(group_id), &req.label)
        .await
        .map_err(reject)?;
    info!(
        token_id = token.token_id.0,
        group_id,
        position = token.position,
        "token enqueued"
    );
    state.publish(event);
    Ok(Json(token))
}

async fn http_coordination_log(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Query(q): Query<CoordinationLogQuery>,
) -> ApiResult<Vec<CoordinationEntry>> {
    let entries = api::coordination_log(&state.api, GroupId(group_id), q.limit)
        .await
        .map_err(reject)?;
    Ok(Json(entries))
}

async fn http_read_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<i64>,
) -> ApiResult<TokenSnapshot> {
    let snapshot = api::read_token(&state.api, TokenId(token_id))
        .await
        .map_err(reject)?;
    Ok(Json(snapshot))
}

async fn http_reorder_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<i64>,
    Json(req): Json<ReorderRequest>,
) -> ApiResult<ReorderResponse> {
    let (response, event) = api::reorder_token(
        &state.api,
        TokenId(token_id),
        req.new_position,
        req.old_position,
    )
    .await
    .map_err(reject)?;
    if response.accepted {
        info!(
            token_id,
            old_position = req.old_position,
            new_position = req.new_position,
            "token reordered"
        );
    } else {
        warn!(
            token_id,
            old_position = req.old_position,
            new_position = req.new_position,
            "reorder rejected"
        );
    }
    if let Some(event) = event {
        state.publish(event);
    }
    Ok(Json(response))
}

async fn http_set_token_state(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<i64>,
    Json(req): Json<SetStateRequest>,
) -> ApiResult<TokenSummary> {
    let (token, event) = api::set_token_state(&state.api, TokenId(token_id), req.state)
        .await
        .map_err(reject)?;
    info!(token_id, state = %token.state, "token state changed");
    state.publish(event);
    Ok(Json(token))
}

async fn http_transfer_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<i64>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<ReorderResponse> {
    let (response, event) = api::transfer_token(
        &state.api,
        TokenId(token_id),
        req.target_group_id,
        req.reason.as_deref(),
    )
    .await
    .map_err(reject)?;
    if let Some(event) = event {
        info!(
            token_id,
            target_group_id = req.target_group_id.0,
            "token transferred"
        );
        state.publish(event);
    }
    Ok(Json(response))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "queue event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
