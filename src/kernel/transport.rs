//! Channel plumbing between the client and one kernel.
//!
//! A [`TransportSession`] owns the three sockets used by this client:
//!
//! | role    | socket | direction |
//! |---------|--------|-----------|
//! | shell   | DEALER | requests out |
//! | iopub   | SUB    | broadcast in (subscribed to everything) |
//! | control | DEALER | interrupts out |
//!
//! Sockets are created through a [`Connector`], which lets tests replace
//! ZeroMQ with an in-memory fake.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──all bound──► Connected
//!       ▲                          │                        │
//!       └──────── bind failure ────┘                        │
//!       └──────────────────────── close() ──────────────────┘
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::time::timeout;
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::connection::{ChannelRole, ConnectionDescriptor};
use crate::kernel::codec::Frames;

/// Transport-level failure on one channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket could not be created or connected.
    #[error("failed to bind {channel} channel to {address}: {cause}")]
    Bind {
        channel: ChannelRole,
        address: String,
        cause: String,
    },

    /// Operation attempted without a live session.
    #[error("transport session is not connected")]
    NotConnected,

    /// Sending or receiving failed.
    #[error("{channel} channel I/O failed: {cause}")]
    Io { channel: ChannelRole, cause: String },
}

/// One open socket.
#[async_trait]
pub trait Channel: Send {
    /// Send a multipart message as a single unit.
    async fn send(&mut self, frames: Frames) -> Result<(), TransportError>;

    /// Return a queued message, or `None` without waiting.
    async fn try_recv(&mut self) -> Result<Option<Frames>, TransportError>;

    /// Close the socket.
    async fn close(self: Box<Self>);
}

/// Opens channels for a session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        role: ChannelRole,
        address: &str,
    ) -> Result<Box<dyn Channel>, TransportError>;
}

/// Connector backed by the pure-Rust `zeromq` crate.
///
/// `zeromq` retries refused connections forever, so every connect (and the
/// IOPub subscribe) is bounded by `connect_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct ZmqConnector {
    connect_timeout: Duration,
}

impl ZmqConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for ZmqConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

enum ZmqSocket {
    Dealer(DealerSocket),
    Sub(SubSocket),
}

struct ZmqChannel {
    role: ChannelRole,
    socket: ZmqSocket,
    /// Set once a receive has panicked; the socket is not polled again.
    failed: bool,
}

/// Run one socket step under `limit`, mapping both failure modes to `Bind`.
async fn bounded<F, T>(
    role: ChannelRole,
    address: &str,
    limit: Duration,
    step: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, zeromq::ZmqError>>,
{
    let bind_error = |cause: String| TransportError::Bind {
        channel: role,
        address: address.to_string(),
        cause,
    };
    match timeout(limit, step).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(bind_error(e.to_string())),
        Err(_) => Err(bind_error(format!("timed out after {}ms", limit.as_millis()))),
    }
}

#[async_trait]
impl Connector for ZmqConnector {
    async fn open(
        &self,
        role: ChannelRole,
        address: &str,
    ) -> Result<Box<dyn Channel>, TransportError> {
        let limit = self.connect_timeout;

        let socket = match role {
            ChannelRole::Shell | ChannelRole::Control => {
                let mut socket = DealerSocket::new();
                bounded(role, address, limit, socket.connect(address)).await?;
                ZmqSocket::Dealer(socket)
            }
            ChannelRole::IoPub => {
                let mut socket = SubSocket::new();
                bounded(role, address, limit, socket.connect(address)).await?;
                bounded(role, address, limit, socket.subscribe("")).await?;
                ZmqSocket::Sub(socket)
            }
        };

        tracing::debug!("Opened {} channel at {}", role, address);
        Ok(Box::new(ZmqChannel {
            role,
            socket,
            failed: false,
        }))
    }
}

/// Poll a receive future exactly once.
///
/// `zeromq`'s DEALER socket panics when a peer connection breaks mid-read;
/// the panic is caught here and surfaces as an I/O error.
fn poll_once<F>(role: ChannelRole, recv: F) -> Result<Option<Frames>, TransportError>
where
    F: Future<Output = Result<ZmqMessage, zeromq::ZmqError>>,
{
    match AssertUnwindSafe(recv).catch_unwind().now_or_never() {
        None => Ok(None),
        Some(Ok(Ok(message))) => Ok(Some(message.into_vec())),
        Some(Ok(Err(e))) => Err(TransportError::Io {
            channel: role,
            cause: e.to_string(),
        }),
        Some(Err(_)) => Err(TransportError::Io {
            channel: role,
            cause: "connection to kernel lost".to_string(),
        }),
    }
}

#[async_trait]
impl Channel for ZmqChannel {
    async fn send(&mut self, frames: Frames) -> Result<(), TransportError> {
        let role = self.role;
        let io_error = |cause: String| TransportError::Io { channel: role, cause };

        if self.failed {
            return Err(io_error("connection to kernel lost".to_string()));
        }
        let message = ZmqMessage::try_from(frames).map_err(|e| io_error(e.to_string()))?;
        match &mut self.socket {
            ZmqSocket::Dealer(socket) => socket
                .send(message)
                .await
                .map_err(|e| io_error(e.to_string())),
            ZmqSocket::Sub(_) => Err(io_error("subscriber sockets cannot send".to_string())),
        }
    }

    async fn try_recv(&mut self) -> Result<Option<Frames>, TransportError> {
        if self.failed {
            return Err(TransportError::Io {
                channel: self.role,
                cause: "connection to kernel lost".to_string(),
            });
        }
        let received = match &mut self.socket {
            ZmqSocket::Dealer(socket) => poll_once(self.role, socket.recv()),
            ZmqSocket::Sub(socket) => poll_once(self.role, socket.recv()),
        };
        if received.is_err() {
            self.failed = true;
        }
        received
    }

    async fn close(self: Box<Self>) {
        let ZmqChannel { role, socket, .. } = *self;
        let errors = match socket {
            ZmqSocket::Dealer(socket) => socket.close().await,
            ZmqSocket::Sub(socket) => socket.close().await,
        };
        for error in errors {
            tracing::debug!("Error closing {} channel: {}", role, error);
        }
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

struct ChannelSet {
    shell: Box<dyn Channel>,
    iopub: Box<dyn Channel>,
    control: Box<dyn Channel>,
}

impl ChannelSet {
    fn get(&mut self, role: ChannelRole) -> &mut Box<dyn Channel> {
        match role {
            ChannelRole::Shell => &mut self.shell,
            ChannelRole::IoPub => &mut self.iopub,
            ChannelRole::Control => &mut self.control,
        }
    }

    async fn close(self) {
        self.shell.close().await;
        self.iopub.close().await;
        self.control.close().await;
    }
}

/// The three channels bound to one kernel.
pub struct TransportSession {
    connector: Box<dyn Connector>,
    state: SessionState,
    channels: Option<ChannelSet>,
}

impl TransportSession {
    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            state: SessionState::Disconnected,
            channels: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Open all three channels against `descriptor`.
    ///
    /// Any existing session is closed first. If one channel fails to bind,
    /// the channels already opened in this attempt are closed and the
    /// session stays `Disconnected`.
    pub async fn connect(&mut self, descriptor: &ConnectionDescriptor) -> Result<(), TransportError> {
        self.close().await;
        self.state = SessionState::Connecting;

        let mut opened: Vec<Box<dyn Channel>> = Vec::with_capacity(3);
        for role in [ChannelRole::Shell, ChannelRole::IoPub, ChannelRole::Control] {
            match self.connector.open(role, &descriptor.address(role)).await {
                Ok(channel) => opened.push(channel),
                Err(e) => {
                    for channel in opened {
                        channel.close().await;
                    }
                    self.state = SessionState::Disconnected;
                    return Err(e);
                }
            }
        }

        let mut opened = opened.into_iter();
        match (opened.next(), opened.next(), opened.next()) {
            (Some(shell), Some(iopub), Some(control)) => {
                self.channels = Some(ChannelSet { shell, iopub, control });
                self.state = SessionState::Connected;
                Ok(())
            }
            _ => {
                self.state = SessionState::Disconnected;
                Err(TransportError::NotConnected)
            }
        }
    }

    /// Close every open channel. Closing a closed session does nothing.
    pub async fn close(&mut self) {
        if let Some(channels) = self.channels.take() {
            channels.close().await;
            tracing::debug!("Transport session closed");
        }
        self.state = SessionState::Disconnected;
    }

    /// Send a framed message on one channel.
    pub async fn send(&mut self, role: ChannelRole, frames: Frames) -> Result<(), TransportError> {
        let channels = self.live_channels()?;
        channels.get(role).send(frames).await
    }

    /// Non-blocking read from one channel.
    pub async fn try_receive(&mut self, role: ChannelRole) -> Result<Option<Frames>, TransportError> {
        let channels = self.live_channels()?;
        channels.get(role).try_recv().await
    }

    fn live_channels(&mut self) -> Result<&mut ChannelSet, TransportError> {
        match (self.state, self.channels.as_mut()) {
            (SessionState::Connected, Some(channels)) => Ok(channels),
            _ => Err(TransportError::NotConnected),
        }
    }
}
