// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `/stats_v1` endpoint: JSON snapshot of one namespace's engine.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::{AppState, NAMESPACE_PARAM};

pub async fn stats_v1_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(namespace) = params.get(NAMESPACE_PARAM) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("URL parameter '{NAMESPACE_PARAM}' is required"),
        )
            .into_response();
    };

    // A namespace that has never been opened is reported as missing rather
    // than being created as a side effect.
    match state.namespaces.statistics(namespace) {
        Some(stats) => Json(stats).into_response(),
        None => (StatusCode::NOT_FOUND, "Namespace not found").into_response(),
    }
}
