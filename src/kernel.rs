//! Jupyter kernel client over the ZeroMQ wire protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   shell   (DEALER)  execute_request   ┌──────────────┐
//! │                  │ ─────────────────────────────────────►│              │
//! │   KernelClient   │   control (DEALER)  interrupt_request │   Jupyter    │
//! │                  │ ─────────────────────────────────────►│   kernel     │
//! │  codec, tracker, │   iopub   (SUB)     status / stream / │  (ipykernel) │
//! │  demultiplexer   │ ◄─────────────────  result / error    │              │
//! └──────────────────┘                                       └──────────────┘
//! ```
//!
//! Every output of every execution arrives on the single IOPub stream.
//! Replies are matched to requests through `parent_header.msg_id`, so any
//! number of non-blocking executions can be in flight at once.
//!
//! # Protocol
//!
//! Outbound messages are seven frames:
//!
//! ```text
//! ""  <IDS|MSG>  hmac-sha256(hex)  header  parent_header  metadata  content
//! ```
//!
//! The signature covers the four JSON frames in order, keyed with the
//! connection file's `key`.
//!
//! # Usage
//!
//! ```ignore
//! use jupyter_kernel_client::kernel::{KernelClient, PollOutcome};
//!
//! let mut client = KernelClient::new(ClientConfig::default());
//! client.connect_file(Path::new("kernel.json")).await?;
//!
//! let id = client.execute_nonblocking("import time; time.sleep(5); 42").await?;
//! loop {
//!     if let PollOutcome::Finished(output) = client.check_execution(&id).await? {
//!         println!("{}", output.render());
//!         break;
//!     }
//! }
//! ```

mod client;
pub mod clock;
pub mod codec;
pub mod demux;
mod outcome;
pub mod tracker;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{KernelClient, KernelError};
pub use clock::{Clock, TokioClock};
pub use outcome::{ConnectionStatus, ExecutionOutcome, ExecutionOutput, PollOutcome, ERROR_PREFIX};
pub use transport::{Channel, Connector, TransportError, ZmqConnector};
