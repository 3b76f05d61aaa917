// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for the Locktopus v1 WebSocket API.
//!
//! Clients exchange JSON text frames, one message at a time. A session is a
//! small state machine: it starts *ready*, a `lock` moves it to *enqueued*
//! or *acquired*, the server pushes an unsolicited *acquired* update when a
//! pending group becomes ready, and `release` returns the session to
//! *ready*. Anything else is a protocol violation that terminates the
//! connection with close code [`INVALID_INPUT_CLOSE_CODE`].

use locktopus_core::{LockMode, ResourceLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// WebSocket close code sent on malformed or out-of-state client input.
pub const INVALID_INPUT_CLOSE_CODE: u16 = 3000;

/// Errors produced by client input. These are recoverable at the transport
/// (the offending connection is closed); engine state is never affected
/// because no lock is created for a rejected message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid lock type: {0}")]
    InvalidMode(String),
    #[error("invalid action [{action}] in state [{state}]")]
    InvalidAction {
        action: Action,
        state: SessionState,
    },
}

/// Client-initiated actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Lock,
    Release,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Lock => f.write_str("lock"),
            Action::Release => f.write_str("release"),
        }
    }
}

/// Server-side view of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No lock is held; `lock` is the only valid action.
    Ready,
    /// A lock was submitted but not yet acquired.
    Enqueued,
    /// The lock is held; `release` returns the session to `Ready`.
    Acquired,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Ready => f.write_str("ready"),
            SessionState::Enqueued => f.write_str("enqueued"),
            SessionState::Acquired => f.write_str("acquired"),
        }
    }
}

/// One resource inside a `lock` request. `type` accepts `read`/`r`/
/// `write`/`w`, case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub mode: String,
    #[serde(default)]
    pub path: Vec<String>,
}

impl ResourceSpec {
    pub fn new(mode: LockMode, path: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            mode: mode.to_string(),
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

/// Client request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceSpec>,
}

/// Server response frame. `id` is the decimal group id assigned by the
/// engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: String,
    pub action: Action,
    pub state: SessionState,
}

/// Parses a wire mode string into a [`LockMode`].
pub fn parse_mode(input: &str) -> Result<LockMode, ProtocolError> {
    match input.to_ascii_lowercase().as_str() {
        "r" | "read" => Ok(LockMode::Read),
        "w" | "write" => Ok(LockMode::Write),
        _ => Err(ProtocolError::InvalidMode(input.to_owned())),
    }
}

/// Converts request resources into engine resource locks, rejecting unknown
/// mode strings.
pub fn resource_locks(specs: &[ResourceSpec]) -> Result<Vec<ResourceLock>, ProtocolError> {
    specs
        .iter()
        .map(|spec| Ok(ResourceLock::new(parse_mode(&spec.mode)?, spec.path.iter().cloned())))
        .collect()
}

/// Validates an action against the session state machine: `lock` is only
/// legal in `Ready`, `release` everywhere else.
pub fn check_action(action: Action, state: SessionState) -> Result<(), ProtocolError> {
    match (action, state) {
        (Action::Lock, SessionState::Ready) => Ok(()),
        (Action::Release, SessionState::Enqueued | SessionState::Acquired) => Ok(()),
        _ => Err(ProtocolError::InvalidAction { action, state }),
    }
}
