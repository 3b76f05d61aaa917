// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! locktopus-server: the HTTP/WebSocket surface of the lock service.
//!
//! Routes:
//! - `GET /v1?namespace=<name>&abandon-timeout-ms=<int>` — WebSocket lock
//!   sessions (see `session`).
//! - `GET /stats_v1?namespace=<name>` — engine statistics snapshot.
//! - `GET /` — greeting listing the available API versions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;

pub mod namespaces;
pub mod session;
pub mod stats;

pub use namespaces::NamespaceRegistry;

pub const NAMESPACE_PARAM: &str = "namespace";
pub const ABANDON_TIMEOUT_PARAM: &str = "abandon-timeout-ms";

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9009;
pub const DEFAULT_ABANDON_TIMEOUT_MS: u64 = 60_000;

/// Shared state of the server process.
pub struct AppState {
    pub namespaces: NamespaceRegistry,
    pub default_abandon_timeout: Duration,
    last_conn_id: AtomicU64,
}

impl AppState {
    pub fn new(default_abandon_timeout: Duration) -> Self {
        Self {
            namespaces: NamespaceRegistry::new(),
            default_abandon_timeout,
            last_conn_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.last_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Builds the service router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(greeting_handler))
        .route("/v1", get(session::api_v1_handler))
        .route("/stats_v1", get(stats::stats_v1_handler))
        .with_state(state)
}

async fn greeting_handler() -> String {
    "Welcome to Locktopus service!\n\nAvailable API versions:\nv1\n".to_owned()
}
