//! Jupyter kernel client library.
//!
//! Drives a running Jupyter (IPython) kernel over its ZeroMQ wire protocol:
//!
//! - `connection` - connection file loading and validation
//! - `config` - client and launcher tunables with environment overrides
//! - `kernel` - message codec, transport, reply routing and the client itself
//! - `launcher` - starting a local kernel process
//!
//! # Kernel Module
//!
//! `kernel::KernelClient` is the entry point:
//!
//! ```ignore
//! use jupyter_kernel_client::{ClientConfig, KernelClient};
//!
//! let mut client = KernelClient::new(ClientConfig::from_env());
//! client.connect_file(Path::new("/run/user/1000/kernel.json")).await?;
//! let outcome = client.execute("print('hello')").await?;
//! println!("{}", outcome);
//! ```

pub mod config;
pub mod connection;
pub mod kernel;
pub mod launcher;

pub use config::{ClientConfig, LauncherConfig};
pub use connection::{ChannelRole, ConnectionDescriptor, DescriptorError};
pub use kernel::{
    ConnectionStatus, ExecutionOutcome, ExecutionOutput, KernelClient, KernelError, PollOutcome,
};
pub use launcher::{KernelLauncher, KernelProcess, LaunchError};
