use anyhow::{Context, Result};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{Sink, SinkExt, Stream, StreamExt};
use pdf_chat_core::{
    JsonDocumentStore, OpenOutcome, Principal, PrincipalResolver, ServerEvent, Session,
    SessionHandler, CLOSE_SETUP_FAILED,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 16;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionHandler<JsonDocumentStore>>,
    pub principals: Arc<dyn PrincipalResolver>,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/chat/", get(chat_socket))
        .with_state(state)
}

pub async fn serve(bind: &str, state: AppState) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "chat server listening");
    axum::serve(listener, router(state))
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn chat_socket(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let principal = state.principals.resolve(params.token.as_deref()).await;
    ws.on_upgrade(move |socket| run_session(socket, state, principal))
}

async fn run_session(socket: WebSocket, state: AppState, principal: Principal) {
    let (sender, receiver) = socket.split();
    drive_session(sender, receiver, state, principal).await;
}

async fn send_event<S>(sender: &mut S, event: &ServerEvent) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let payload = serde_json::to_string(event)?;
    sender.send(Message::Text(payload.into())).await?;
    Ok(())
}

async fn send_close<S>(sender: &mut S, code: u16, reason: &str)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_owned().into(),
    };
    if let Err(close_error) = sender.send(Message::Close(Some(frame))).await {
        warn!(code, error = %close_error, "close frame not delivered");
    }
}

/// Runs one connection: a writer task for outbound events, a worker that handles queries one at
/// a time, and the reader loop below. A disconnect cancels the query in flight, if any.
async fn drive_session<S, R, E>(
    mut sender: S,
    mut receiver: R,
    state: AppState,
    principal: Principal,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut session = Session::new(principal);
    let session_id = session.id();

    match state.sessions.open(&mut session) {
        OpenOutcome::Rejected { event, close_code } => {
            if let Err(send_error) = send_event(&mut sender, &event).await {
                warn!(session = %session_id, error = %send_error, "rejection not delivered");
            }
            send_close(&mut sender, close_code, "authentication failed").await;
            return;
        }
        OpenOutcome::Accepted(event) => {
            if let Err(send_error) = send_event(&mut sender, &event).await {
                warn!(session = %session_id, error = %send_error, "session setup failed");
                state.sessions.close(&mut session);
                send_close(&mut sender, CLOSE_SETUP_FAILED, "setup failed").await;
                return;
            }
        }
    }

    let (events_tx, mut events_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if send_event(&mut sender, &event).await.is_err() {
                break;
            }
        }
    });

    let (queries_tx, mut queries_rx) = mpsc::channel::<String>(INBOUND_BUFFER);
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    let sessions = Arc::clone(&state.sessions);
    let worker = tokio::spawn(async move {
        loop {
            let raw = tokio::select! {
                biased;
                _ = &mut cancel_rx => break,
                next = queries_rx.recv() => match next {
                    Some(raw) => raw,
                    None => break,
                },
            };

            let handled = tokio::select! {
                biased;
                _ = &mut cancel_rx => {
                    info!(session = %session_id, "query abandoned on disconnect");
                    break;
                }
                handled = sessions.handle_message(&mut session, &raw, &events_tx) => handled,
            };
            if handled.is_err() {
                break;
            }
        }
        sessions.close(&mut session);
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if queries_tx.send(text.as_str().to_owned()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(receive_error) => {
                warn!(session = %session_id, error = %receive_error, "websocket receive failed");
                break;
            }
        }
    }

    drop(cancel_tx);
    drop(queries_tx);
    if let Err(join_error) = worker.await {
        warn!(session = %session_id, error = %join_error, "session worker failed");
    }
    writer.abort();
}
