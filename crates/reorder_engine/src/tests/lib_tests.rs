use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode as HttpStatus,
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::TokenState,
    protocol::{Notification, Severity},
};
use std::sync::Mutex as StdMutex;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct StubState {
    commits: Arc<StdMutex<Vec<(i64, i64, i64)>>>,
}

async fn stub_read(
    Path(token_id): Path<i64>,
) -> Result<Json<TokenSnapshot>, HttpStatus> {
    match token_id {
        10 => Ok(Json(TokenSnapshot {
            position: 3,
            state: TokenState::Waiting,
            group_id: GroupId(1),
        })),
        500 => Err(HttpStatus::INTERNAL_SERVER_ERROR),
        _ => Err(HttpStatus::NOT_FOUND),
    }
}

async fn stub_reorder(
    State(state): State<StubState>,
    Path(token_id): Path<i64>,
    Json(req): Json<ReorderRequest>,
) -> Json<ReorderResponse> {
    state
        .commits
        .lock()
        .expect("commits")
        .push((token_id, req.new_position, req.old_position));
    Json(ReorderResponse {
        accepted: req.old_position == 3,
    })
}

async fn spawn_stub() -> (String, StubState) {
    let state = StubState::default();
    let app = Router::new()
        .route("/tokens/:token_id", get(stub_read))
        .route("/tokens/:token_id/reorder", post(stub_reorder))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}/"), state)
}

#[derive(Default)]
struct SilentView {
    notifications: StdMutex<Vec<Notification>>,
}

#[async_trait]
impl QueueView for SilentView {
    async fn reload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        self.notifications
            .lock()
            .expect("notifications")
            .push(notification);
    }
}

#[tokio::test]
async fn http_accessor_reads_token_snapshot() {
    let (server_url, _) = spawn_stub().await;
    let accessor = HttpQueueAccessor::new(server_url);

    let snapshot = accessor.fetch_token(TokenId(10)).await.expect("fetch");
    assert_eq!(snapshot.position, 3);
    assert_eq!(snapshot.group_id, GroupId(1));
    assert_eq!(snapshot.state, TokenState::Waiting);
}

#[tokio::test]
async fn http_accessor_maps_404_to_not_found() {
    let (server_url, _) = spawn_stub().await;
    let accessor = HttpQueueAccessor::new(server_url);

    let err = accessor
        .fetch_token(TokenId(77))
        .await
        .expect_err("should be missing");
    assert!(matches!(err, AccessorError::NotFound(TokenId(77))));
}

#[tokio::test]
async fn http_accessor_reports_server_errors_as_transport() {
    let (server_url, _) = spawn_stub().await;
    let accessor = HttpQueueAccessor::new(server_url);

    let err = accessor
        .fetch_token(TokenId(500))
        .await
        .expect_err("should fail");
    assert!(matches!(err, AccessorError::Transport(_)));
}

#[tokio::test]
async fn http_accessor_commit_returns_backend_verdict() {
    let (server_url, state) = spawn_stub().await;
    let accessor = HttpQueueAccessor::new(server_url);

    assert!(accessor
        .commit_reorder(TokenId(10), 1, 3)
        .await
        .expect("commit"));
    assert!(!accessor
        .commit_reorder(TokenId(10), 1, 2)
        .await
        .expect("commit"));
    assert_eq!(
        state.commits.lock().expect("commits").clone(),
        vec![(10, 1, 3), (10, 1, 2)]
    );
}

#[tokio::test]
async fn storage_accessor_drives_engine_end_to_end() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let group = storage.create_group("Room 3").await.expect("group");
    let mut ids = Vec::new();
    for label in ["A", "B", "C", "D"] {
        let token = storage
            .enqueue_token(group, label)
            .await
            .expect("enqueue")
            .expect("group exists");
        ids.push(token.token_id);
    }

    let view = Arc::new(SilentView::default());
    let engine = ReorderEngine::new(
        Arc::new(StorageQueueAccessor::new(storage.clone())),
        view.clone(),
    );

    let outcome = engine
        .handle_drop(DropEvent::within(group, ids[3], Some(ids[0])))
        .await;
    assert_eq!(
        outcome,
        ReorderOutcome::Moved {
            token_id: ids[3],
            old_position: 4,
            new_position: 2,
        }
    );

    let outcome = engine.handle_drop(DropEvent::within(group, ids[0], None)).await;
    assert!(matches!(outcome, ReorderOutcome::Unchanged { position: 1, .. }));

    let labels: Vec<String> = storage
        .list_tokens(group, Some(TokenState::Waiting))
        .await
        .expect("list")
        .into_iter()
        .map(|t| t.label)
        .collect();
    assert_eq!(labels, vec!["A", "D", "B", "C"]);

    let notifications = view.notifications.lock().expect("notifications").clone();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].severity, Severity::Success);
}

#[tokio::test]
async fn storage_accessor_reports_missing_token() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let accessor = StorageQueueAccessor::new(storage);

    let err = accessor
        .fetch_token(TokenId(1))
        .await
        .expect_err("should be missing");
    assert!(matches!(err, AccessorError::NotFound(TokenId(1))));

    let err = accessor
        .commit_reorder(TokenId(1), 1, 2)
        .await
        .expect_err("should be missing");
    assert!(matches!(err, AccessorError::NotFound(TokenId(1))));
}

#[derive(Default)]
struct CountingView {
    reloads: StdMutex<u32>,
}

#[async_trait]
impl QueueView for CountingView {
    async fn reload(&self) -> anyhow::Result<()> {
        *self.reloads.lock().expect("reloads") += 1;
        Ok(())
    }

    fn notify(&self, _notification: Notification) {}
}

async fn stub_ws(ws: WebSocketUpgrade) -> axum::response::Response {
    ws.on_upgrade(|mut socket| async move {
        let events = [
            QueueEvent::TokenReordered {
                token_id: TokenId(10),
                group_id: GroupId(1),
                old_position: 3,
                new_position: 1,
            },
            QueueEvent::TokenReordered {
                token_id: TokenId(20),
                group_id: GroupId(2),
                old_position: 2,
                new_position: 1,
            },
            QueueEvent::TokenTransferred {
                token_id: TokenId(30),
                from_group_id: GroupId(2),
                to_group_id: GroupId(1),
            },
        ];
        for event in events {
            let text = serde_json::to_string(&event).expect("event json");
            if socket.send(WsMessage::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = socket.send(WsMessage::Text("not json".into())).await;
        let _ = socket.send(WsMessage::Close(None)).await;
    })
}

#[tokio::test]
async fn queue_listener_reloads_only_for_its_group() {
    let app = Router::new().route("/ws", get(stub_ws));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let view = Arc::new(CountingView::default());
    let handle = spawn_queue_listener(&format!("http://{addr}"), GroupId(1), view.clone())
        .await
        .expect("listener");
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("listener finishes on close")
        .expect("join");

    assert_eq!(*view.reloads.lock().expect("reloads"), 2);
}

#[test]
fn websocket_url_follows_http_scheme() {
    assert_eq!(
        websocket_url("http://127.0.0.1:8443/").expect("ws url"),
        "ws://127.0.0.1:8443/ws"
    );
    assert_eq!(
        websocket_url("https://queue.example").expect("ws url"),
        "wss://queue.example/ws"
    );
    assert!(websocket_url("queue.example").is_err());
}
