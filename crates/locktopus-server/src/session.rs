// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `/v1` WebSocket endpoint: one session per connection, JSON messages,
//! one at a time.
//!
//! Client protocol violations (wrong action for the current state, malformed
//! JSON, unknown mode strings) send a textual diagnostic and close the
//! connection with code 3000; the engine is unaffected because no lock is
//! created for a rejected message. When the transport closes while a lock is
//! still held, the lock is kept for the abandon timeout (measured from the
//! close) and released afterwards.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use locktopus_core::{Lock, MultiLocker};
use locktopus_proto::{
    check_action, resource_locks, Action, ProtocolError, RequestMessage, ResponseMessage,
    SessionState, INVALID_INPUT_CLOSE_CODE,
};
use thiserror::Error;
use tracing::info;

use crate::{AppState, ABANDON_TIMEOUT_PARAM, NAMESPACE_PARAM};

/// Target for lock-level logging, toggled by `--log-locks`.
const LOCKS_TARGET: &str = "locktopus_server::locks";

#[derive(Debug, Error)]
enum SessionError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("cannot read message: {0}")]
    Transport(#[from] axum::Error),
    #[error("cannot send JSON message: {0}")]
    Send(axum::Error),
    #[error("only text frames are supported")]
    NonText,
}

pub async fn api_v1_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(namespace) = params.get(NAMESPACE_PARAM) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("URL parameter '{NAMESPACE_PARAM}' is required"),
        )
            .into_response();
    };

    let abandon_timeout = match params.get(ABANDON_TIMEOUT_PARAM) {
        None => state.default_abandon_timeout,
        Some(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!(
                        "URL parameter '{ABANDON_TIMEOUT_PARAM}' should be an integer value >= 0 \
                         representing broken connection timeout (in milliseconds)"
                    ),
                )
                    .into_response();
            }
        },
    };

    let (engine, created) = state.namespaces.get_or_create(namespace);
    if created {
        info!("created new multilocker namespace {namespace}");
    }

    let conn_id = state.next_conn_id();

    ws.on_upgrade(move |socket| handle_session(socket, engine, conn_id, abandon_timeout, peer))
}

async fn handle_session(
    mut socket: WebSocket,
    engine: MultiLocker,
    conn_id: u64,
    abandon_timeout: Duration,
    peer: SocketAddr,
) {
    info!("new connection from {peer} [id = {conn_id}]");

    let mut current: Option<Lock> = None;
    let result = run_session(&mut socket, &engine, &mut current, conn_id).await;

    // The lock of a session that went away without releasing is held for
    // the abandon timeout, measured from transport close.
    if let Some(lock) = current.take() {
        tokio::time::sleep(abandon_timeout).await;
        lock.acquire().await.unlock().await;
        info!(
            target: LOCKS_TARGET,
            "released abandoned resources of connection [id = {conn_id}]"
        );
    }

    match result {
        Ok(()) => {
            info!("closing connection [id = {conn_id}]");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "".into(),
                })))
                .await;
        }
        Err(err) => {
            info!("connection closed [id = {conn_id}]: {err}");
            let _ = socket
                .send(Message::Text(format!("communication error: {err}").into()))
                .await;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: INVALID_INPUT_CLOSE_CODE,
                    reason: "".into(),
                })))
                .await;
        }
    }
}

enum Event {
    LockReady,
    Frame(Option<Result<Message, axum::Error>>),
}

async fn run_session(
    socket: &mut WebSocket,
    engine: &MultiLocker,
    current: &mut Option<Lock>,
    conn_id: u64,
) -> Result<(), SessionError> {
    let mut state = SessionState::Ready;
    let mut last_id: u64 = 0;

    loop {
        // While a lock is enqueued, race its readiness against client input
        // so the unsolicited `acquired` update goes out promptly.
        let event = if state == SessionState::Enqueued {
            let lock = current.as_ref().expect("enqueued session holds a lock");
            tokio::select! {
                _ = lock.ready() => Event::LockReady,
                frame = socket.recv() => Event::Frame(frame),
            }
        } else {
            Event::Frame(socket.recv().await)
        };

        let incoming = match event {
            Event::LockReady => {
                state = SessionState::Acquired;
                send_response(socket, last_id, Action::Lock, state).await?;
                continue;
            }
            Event::Frame(incoming) => incoming,
        };

        let Some(frame) = incoming else {
            return Ok(());
        };

        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => return Ok(()),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => return Err(SessionError::NonText),
        };

        let request: RequestMessage = serde_json::from_str(&text)?;
        check_action(request.action, state)?;

        match request.action {
            Action::Lock => {
                let resources = resource_locks(&request.resources)?;

                info!(
                    target: LOCKS_TARGET,
                    "locking resources for connection [id = {conn_id}]: {resources:?}"
                );

                let lock = engine.lock(resources, None);
                last_id = lock.id();

                state = if lock.is_ready() {
                    SessionState::Acquired
                } else {
                    SessionState::Enqueued
                };
                *current = Some(lock);

                send_response(socket, last_id, Action::Lock, state).await?;
            }
            Action::Release => {
                let lock = current.take().expect("non-ready session holds a lock");

                // Release in the background: an enqueued lock must still
                // acquire before it can unlock.
                tokio::spawn(async move {
                    lock.acquire().await.unlock().await;
                });

                info!(
                    target: LOCKS_TARGET,
                    "released resources for connection [id = {conn_id}]"
                );

                state = SessionState::Ready;
                send_response(socket, last_id, Action::Release, state).await?;
            }
        }
    }
}

async fn send_response(
    socket: &mut WebSocket,
    id: u64,
    action: Action,
    state: SessionState,
) -> Result<(), SessionError> {
    let response = ResponseMessage {
        id: id.to_string(),
        action,
        state,
    };
    let text = serde_json::to_string(&response)?;

    socket
        .send(Message::Text(text.into()))
        .await
        .map_err(SessionError::Send)
}
