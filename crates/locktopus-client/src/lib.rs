// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client for the Locktopus v1 WebSocket API.
//!
//! Mirrors the session state machine of the server: accumulate resources
//! with [`LocktopusClient::add_resource`], submit them with
//! [`LocktopusClient::lock`], wait with [`LocktopusClient::acquire`] when
//! the server answered `enqueued`, and free them with
//! [`LocktopusClient::release`].

use futures_util::{SinkExt, StreamExt};
use locktopus_core::LockMode;
use locktopus_proto::{Action, RequestMessage, ResourceSpec, ResponseMessage, SessionState};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} is required")]
    MissingOption(&'static str),
    #[error("cannot dial to Locktopus server: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("cannot decode server response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected state '{0}' returned from server")]
    UnexpectedState(SessionState),
    #[error("unexpected response action returned from server: {0}")]
    UnexpectedAction(Action),
    #[error("connection closed by server")]
    Closed,
}

/// How to reach the server. When `url` is provided the remaining options
/// are ignored.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub namespace: Option<String>,
    pub secure: bool,
}

const API_VERSION: &str = "v1";

fn build_url(options: &ConnectionOptions) -> Result<String, ClientError> {
    if let Some(url) = &options.url {
        return Ok(url.clone());
    }

    let host = options
        .host
        .as_deref()
        .ok_or(ClientError::MissingOption("host"))?;
    let port = options.port.ok_or(ClientError::MissingOption("port"))?;
    let namespace = options
        .namespace
        .as_deref()
        .ok_or(ClientError::MissingOption("namespace"))?;

    let scheme = if options.secure { "wss" } else { "ws" };

    Ok(format!(
        "{scheme}://{host}:{port}/{API_VERSION}?namespace={namespace}"
    ))
}

/// A connected Locktopus session.
pub struct LocktopusClient {
    ws: WsStream,
    pending: Vec<ResourceSpec>,
    acquired: bool,
    lock_id: String,
}

impl LocktopusClient {
    /// Establishes a connection to the server.
    pub async fn connect(options: ConnectionOptions) -> Result<Self, ClientError> {
        let url = build_url(&options)?;

        let (ws, _) = connect_async(&url).await.map_err(ClientError::Connect)?;

        Ok(Self {
            ws,
            pending: Vec::new(),
            acquired: false,
            lock_id: String::new(),
        })
    }

    /// Adds a resource to be submitted by the next [`LocktopusClient::lock`]
    /// call.
    pub fn add_resource(
        &mut self,
        mode: LockMode,
        path: impl IntoIterator<Item = impl Into<String>>,
    ) {
        self.pending.push(ResourceSpec::new(mode, path));
    }

    /// Submits the accumulated resources. Check
    /// [`LocktopusClient::is_acquired`] afterwards: when the server answered
    /// `enqueued`, use [`LocktopusClient::acquire`] to wait.
    pub async fn lock(&mut self) -> Result<(), ClientError> {
        let request = RequestMessage {
            action: Action::Lock,
            resources: std::mem::take(&mut self.pending),
        };
        self.send(&request).await?;

        let response = self.read_response().await?;

        if response.state == SessionState::Ready {
            return Err(ClientError::UnexpectedState(response.state));
        }
        if response.action != Action::Lock {
            return Err(ClientError::UnexpectedAction(response.action));
        }

        self.acquired = response.state == SessionState::Acquired;
        self.lock_id = response.id;

        Ok(())
    }

    /// Whether the last [`LocktopusClient::lock`] was granted immediately.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Decimal group id assigned by the server to the last lock.
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Waits for the pushed `acquired` update. No-op when the lock is
    /// already held.
    pub async fn acquire(&mut self) -> Result<(), ClientError> {
        if self.acquired {
            return Ok(());
        }

        let response = self.read_response().await?;

        if response.state != SessionState::Acquired {
            return Err(ClientError::UnexpectedState(response.state));
        }
        if response.action != Action::Lock {
            return Err(ClientError::UnexpectedAction(response.action));
        }

        self.acquired = true;

        Ok(())
    }

    /// Releases the held (or still enqueued) lock.
    pub async fn release(&mut self) -> Result<(), ClientError> {
        let request = RequestMessage {
            action: Action::Release,
            resources: Vec::new(),
        };
        self.send(&request).await?;

        let mut response = self.read_response().await?;

        // The pushed `acquired` update of the previous lock may race the
        // release response; skip it.
        if response.action == Action::Lock
            && response.state == SessionState::Acquired
            && response.id == self.lock_id
        {
            response = self.read_response().await?;
        }

        if response.state != SessionState::Ready {
            return Err(ClientError::UnexpectedState(response.state));
        }
        if response.action != Action::Release {
            return Err(ClientError::UnexpectedAction(response.action));
        }

        self.acquired = false;

        Ok(())
    }

    /// Closes the connection. Any lock still held starts the server's
    /// abandon timeout.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.ws.close(None).await?;
        Ok(())
    }

    async fn send(&mut self, request: &RequestMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(request)?;
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<ResponseMessage, ClientError> {
        loop {
            match self.ws.next().await {
                None => return Err(ClientError::Closed),
                Some(Err(err)) => return Err(ClientError::Transport(err)),
                Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
                Some(Ok(Message::Close(_))) => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
            }
        }
    }
}
