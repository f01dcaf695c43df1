//! Kernel client orchestrating codec, transport, tracker and demultiplexer.
//!
//! `KernelClient` is the single owner of one kernel connection. It offers
//! two ways to run code:
//!
//! - [`execute`](KernelClient::execute) sends the request and polls IOPub
//!   until the kernel goes idle or the wait bound runs out.
//! - [`execute_nonblocking`](KernelClient::execute_nonblocking) sends the
//!   request and returns its correlation id; output is collected by later
//!   [`check_execution`](KernelClient::check_execution) calls.
//!
//! Every method takes `&mut self`; callers sharing a client across tasks
//! wrap it in a `tokio::sync::Mutex`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::ClientConfig;
use crate::connection::{ChannelRole, ConnectionDescriptor, DescriptorError};
use crate::kernel::clock::{Clock, TokioClock};
use crate::kernel::codec::MessageCodec;
use crate::kernel::demux::{DrainReport, ReplyDemultiplexer};
use crate::kernel::outcome::{ConnectionStatus, ExecutionOutcome, PollOutcome};
use crate::kernel::tracker::ExecutionTracker;
use crate::kernel::transport::{Connector, TransportError, TransportSession, ZmqConnector};
use crate::launcher::{KernelLauncher, KernelProcess, LaunchError};

/// Readiness checks run by [`KernelClient::start_kernel`].
const STARTUP_READY_ATTEMPTS: u32 = 10;

/// Errors returned by [`KernelClient`] operations.
///
/// A timed-out blocking execution is not an error; see
/// [`ExecutionOutcome::TimedOut`].
#[derive(Debug, Error)]
pub enum KernelError {
    /// The connection descriptor is missing fields or unreadable.
    #[error("Invalid connection descriptor: {0}")]
    InvalidConnectionDescriptor(#[from] DescriptorError),

    /// One channel could not be bound; the session was left closed.
    #[error("Failed to connect to {channel} socket {address}: {cause}")]
    ChannelBind {
        channel: ChannelRole,
        address: String,
        cause: String,
    },

    /// No live session.
    #[error("Not connected to kernel. Connect first.")]
    NotConnected,

    /// The id is not (or no longer) tracked.
    #[error("Unknown execution id: {0}")]
    UnknownExecution(String),

    /// Send or receive failed on a live session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A message could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Not a valid Python identifier.
    #[error("Invalid variable name: {0:?}")]
    InvalidIdentifier(String),

    /// Starting the kernel process failed.
    #[error("Failed to start kernel: {0}")]
    Launch(#[from] LaunchError),

    /// The kernel never completed a readiness check.
    #[error("Kernel did not answer after {attempts} attempts")]
    Unresponsive { attempts: u32 },
}

impl From<TransportError> for KernelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Bind {
                channel,
                address,
                cause,
            } => KernelError::ChannelBind {
                channel,
                address,
                cause,
            },
            TransportError::NotConnected => KernelError::NotConnected,
            io @ TransportError::Io { .. } => KernelError::Transport(io.to_string()),
        }
    }
}

/// State that exists only while connected.
struct ActiveKernel {
    descriptor: ConnectionDescriptor,
    codec: MessageCodec,
    demux: ReplyDemultiplexer,
}

/// Client for one Jupyter kernel at a time.
///
/// # Example
///
/// ```ignore
/// use jupyter_kernel_client::{ClientConfig, KernelClient};
///
/// let mut client = KernelClient::new(ClientConfig::from_env());
/// client.connect_file(Path::new("kernel-1234.json")).await?;
///
/// let outcome = client.execute("1 + 1").await?;
/// println!("{}", outcome);
///
/// let id = client.execute_nonblocking("train_model()").await?;
/// let progress = client.check_execution(&id).await?;
/// ```
pub struct KernelClient {
    config: ClientConfig,
    session: TransportSession,
    active: Option<ActiveKernel>,
    tracker: ExecutionTracker,
    clock: Arc<dyn Clock>,
}

impl KernelClient {
    /// Client speaking ZeroMQ and sleeping on the tokio timer.
    pub fn new(config: ClientConfig) -> Self {
        let connector = ZmqConnector::new(config.connect_timeout);
        Self::with_transport(config, Box::new(connector), Arc::new(TokioClock))
    }

    /// Client with a custom transport and clock.
    pub fn with_transport(
        config: ClientConfig,
        connector: Box<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            session: TransportSession::new(connector),
            active: None,
            tracker: ExecutionTracker::new(),
            clock,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some() && self.session.is_connected()
    }

    /// Correlation ids of executions still awaiting collection.
    pub fn pending_executions(&self) -> Vec<String> {
        self.tracker.ids()
    }

    /// Connect to the kernel described by `descriptor`.
    ///
    /// An invalid descriptor fails before any socket is touched and leaves
    /// the current connection in place. Otherwise the current connection is
    /// closed first. Each channel gets `connect_timeout` to come up; an
    /// absent kernel yields [`KernelError::ChannelBind`].
    ///
    /// The IOPub subscription reaches the kernel some time after this
    /// returns, and output published before then is lost. Call
    /// [`wait_ready`](Self::wait_ready) before relying on the first replies
    /// from a freshly started kernel.
    pub async fn connect(
        &mut self,
        descriptor: ConnectionDescriptor,
    ) -> Result<ConnectionStatus, KernelError> {
        descriptor.validate()?;

        self.active = None;
        self.session.connect(&descriptor).await?;

        let codec = MessageCodec::new(self.config.username.clone(), descriptor.protocol_version.clone());
        let demux = if self.config.verify_signatures {
            ReplyDemultiplexer::verifying(descriptor.key.as_bytes().to_vec())
        } else {
            ReplyDemultiplexer::new()
        };

        tracing::info!(
            "Connected to kernel at {} (session {})",
            descriptor.endpoint(),
            codec.session()
        );
        self.active = Some(ActiveKernel {
            descriptor,
            codec,
            demux,
        });
        Ok(self.status())
    }

    /// Load a connection file and connect.
    pub async fn connect_file(&mut self, path: &Path) -> Result<ConnectionStatus, KernelError> {
        let descriptor = ConnectionDescriptor::from_file(path)?;
        self.connect(descriptor).await
    }

    /// Launch a kernel bound to `connection_file`, connect, and wait until
    /// it answers.
    ///
    /// A kernel that stays silent through the readiness checks is still
    /// returned, since its process is running; a warning is logged.
    pub async fn start_kernel(
        &mut self,
        launcher: &KernelLauncher,
        connection_file: &Path,
    ) -> Result<(KernelProcess, ConnectionStatus), KernelError> {
        let descriptor = ConnectionDescriptor::from_file(connection_file)?;
        let process = launcher.start(connection_file).await?;
        self.connect(descriptor).await?;

        match self.wait_ready(STARTUP_READY_ATTEMPTS).await {
            Ok(()) => {}
            Err(e @ KernelError::Unresponsive { .. }) => {
                tracing::warn!("Kernel {} connected but not ready: {}", process.pid, e);
            }
            Err(e) => return Err(e),
        }
        Ok((process, self.status()))
    }

    /// Run a no-op statement until the kernel completes one.
    ///
    /// Each attempt is a blocking execution bounded like
    /// [`execute`](Self::execute) and kept out of the kernel's history.
    ///
    /// # Errors
    ///
    /// [`KernelError::Unresponsive`] when all `attempts` time out.
    pub async fn wait_ready(&mut self, attempts: u32) -> Result<(), KernelError> {
        for attempt in 1..=attempts {
            let outcome = self.run_blocking("pass", false).await?;
            if !outcome.is_timed_out() {
                tracing::debug!("Kernel ready after {} attempt(s)", attempt);
                return Ok(());
            }
        }
        Err(KernelError::Unresponsive { attempts })
    }

    /// Close all channels. The kernel process keeps running.
    pub async fn disconnect(&mut self) {
        let was_connected = self.is_connected();
        self.session.close().await;
        self.active = None;
        if was_connected {
            tracing::info!("Disconnected from kernel");
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match &self.active {
            Some(active) if self.session.is_connected() => ConnectionStatus::Connected {
                endpoint: active.descriptor.endpoint(),
                key_preview: active.descriptor.key_preview(),
                pending: self.tracker.len(),
            },
            _ => ConnectionStatus::NotConnected,
        }
    }

    /// Run `code` and wait for it to finish.
    ///
    /// Returns [`ExecutionOutcome::TimedOut`] with any partial output when
    /// the kernel stays silent for `max_idle_wait`, or when the hard deadline
    /// passes while output is still arriving.
    pub async fn execute(&mut self, code: &str) -> Result<ExecutionOutcome, KernelError> {
        self.run_blocking(code, true).await
    }

    async fn run_blocking(
        &mut self,
        code: &str,
        store_history: bool,
    ) -> Result<ExecutionOutcome, KernelError> {
        let msg_id = self.submit(code, store_history).await?;
        self.tracker.register(msg_id.clone());

        let waited = self.wait_for_idle(&msg_id).await;
        let entry = self.tracker.remove(&msg_id).unwrap_or_default();
        let waited = waited?;

        let done = entry.done;
        let output = entry.into_output();
        if done {
            tracing::debug!("Execution {} completed", msg_id);
            Ok(ExecutionOutcome::Completed { msg_id, output })
        } else {
            tracing::debug!("Execution {} timed out after {:?}", msg_id, waited);
            Ok(ExecutionOutcome::TimedOut {
                msg_id,
                output,
                waited,
            })
        }
    }

    /// Send `code` for execution and return its correlation id at once.
    pub async fn execute_nonblocking(&mut self, code: &str) -> Result<String, KernelError> {
        let msg_id = self.submit(code, true).await?;
        self.tracker.register(msg_id.clone());
        Ok(msg_id)
    }

    /// Collect output for a non-blocking execution.
    ///
    /// A finished execution is removed from the tracker, so polling it again
    /// yields [`KernelError::UnknownExecution`].
    pub async fn check_execution(&mut self, msg_id: &str) -> Result<PollOutcome, KernelError> {
        if !self.tracker.contains(msg_id) {
            return Err(KernelError::UnknownExecution(msg_id.to_string()));
        }

        self.drain().await?;

        if let Some(entry) = self.tracker.take_if_done(msg_id) {
            return Ok(PollOutcome::Finished(entry.into_output()));
        }
        let output = self
            .tracker
            .get(msg_id)
            .map(|entry| entry.output())
            .unwrap_or_default();
        Ok(PollOutcome::Running(output))
    }

    /// Ask the kernel to interrupt whatever it is running.
    ///
    /// Only bookkeeping happens locally; whether the execution actually
    /// stops shows up in later [`check_execution`](Self::check_execution) calls.
    pub async fn interrupt(&mut self, msg_id: &str) -> Result<(), KernelError> {
        if !self.tracker.contains(msg_id) {
            return Err(KernelError::UnknownExecution(msg_id.to_string()));
        }

        let frames = match &self.active {
            Some(active) if self.session.is_connected() => active
                .codec
                .interrupt_request()
                .to_frames(active.descriptor.key.as_bytes())
                .map_err(|e| KernelError::Protocol(format!("Failed to encode interrupt: {}", e)))?,
            _ => return Err(KernelError::NotConnected),
        };
        self.session.send(ChannelRole::Control, frames).await?;
        self.tracker.mark_interrupted(msg_id);

        tracing::info!("Interrupt requested for execution {}", msg_id);
        Ok(())
    }

    /// Whether `name` is bound in the kernel's global namespace.
    ///
    /// `None` when the check timed out or printed something unexpected.
    pub async fn variable_exists(&mut self, name: &str) -> Result<Option<bool>, KernelError> {
        if !is_identifier(name) {
            return Err(KernelError::InvalidIdentifier(name.to_string()));
        }

        let code = format!("print('true' if '{}' in globals() else 'false')", name);
        let outcome = self.execute(&code).await?;
        if outcome.is_timed_out() {
            return Ok(None);
        }
        Ok(match outcome.output().streams.last().map(|s| s.trim()) {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        })
    }

    /// Encode, sign and send an execute request on the shell channel.
    async fn submit(&mut self, code: &str, store_history: bool) -> Result<String, KernelError> {
        let (msg_id, frames) = match &self.active {
            Some(active) if self.session.is_connected() => {
                let message = active.codec.execute_request(code, store_history);
                let frames = message
                    .to_frames(active.descriptor.key.as_bytes())
                    .map_err(|e| KernelError::Protocol(format!("Failed to encode request: {}", e)))?;
                (message.msg_id().to_string(), frames)
            }
            _ => return Err(KernelError::NotConnected),
        };

        self.session.send(ChannelRole::Shell, frames).await?;
        tracing::debug!("Sent execute_request {}", msg_id);
        Ok(msg_id)
    }

    /// One demultiplexer pass over IOPub. A no-op while disconnected.
    async fn drain(&mut self) -> Result<DrainReport, KernelError> {
        match &self.active {
            Some(active) if self.session.is_connected() => {
                Ok(active.demux.drain(&mut self.session, &mut self.tracker).await?)
            }
            _ => Ok(DrainReport::default()),
        }
    }

    /// Poll until `msg_id` is done or a wait bound is hit; returns time waited.
    ///
    /// Consecutive empty polls are counted against `idle_poll_limit`; any
    /// message for `msg_id` resets the count.
    async fn wait_for_idle(&mut self, msg_id: &str) -> Result<Duration, KernelError> {
        let limit = self.config.idle_poll_limit();
        let started = self.clock.now();
        let mut idle_polls = 0u32;

        loop {
            let report = self.drain().await?;
            let elapsed = self.clock.now().saturating_duration_since(started);

            if self.tracker.get(msg_id).is_some_and(|entry| entry.done) {
                return Ok(elapsed);
            }
            if elapsed >= self.config.hard_deadline {
                return Ok(elapsed);
            }

            if report.delivered_to(msg_id) > 0 {
                idle_polls = 0;
                continue;
            }
            if idle_polls >= limit {
                return Ok(elapsed);
            }
            idle_polls += 1;
            self.clock.sleep(self.config.poll_interval).await;
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_alphabetic() => {
            chars.all(|c| c == '_' || c.is_alphanumeric())
        }
        _ => false,
    }
}
