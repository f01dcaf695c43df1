//! Kernel connection descriptors.
//!
//! A running Jupyter kernel advertises how to reach it through a JSON
//! connection file:
//!
//! ```json
//! {
//!   "ip": "127.0.0.1",
//!   "transport": "tcp",
//!   "shell_port": 53794,
//!   "iopub_port": 53795,
//!   "stdin_port": 53796,
//!   "control_port": 53797,
//!   "hb_port": 53798,
//!   "key": "a0436f6c-1916-498b-8eb9-e81ab9368e84",
//!   "signature_scheme": "hmac-sha256"
//! }
//! ```
//!
//! Required keys are checked before anything else happens so a bad file never
//! results in half-opened sockets.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::kernel::codec::PROTOCOL_VERSION;

/// Keys every connection file must carry, in reporting order.
pub const REQUIRED_FIELDS: [&str; 7] = [
    "ip",
    "shell_port",
    "iopub_port",
    "stdin_port",
    "control_port",
    "hb_port",
    "key",
];

/// The only signature scheme this client speaks.
pub const SIGNATURE_SCHEME: &str = "hmac-sha256";

/// Problems with a connection descriptor.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The connection file could not be read.
    #[error("Connection file not found or unreadable: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not a JSON object or a field has the wrong type.
    #[error("Malformed connection descriptor: {0}")]
    Malformed(String),

    /// One or more required fields are absent or empty.
    #[error("Connection file missing required fields: {fields:?}")]
    MissingFields { fields: Vec<&'static str> },

    /// The kernel signs with something other than HMAC-SHA256.
    #[error("Unsupported signature scheme: {0}")]
    UnsupportedScheme(String),
}

/// Channel roles this client opens against a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Requests out, replies in (DEALER).
    Shell,
    /// Kernel-wide broadcast of outputs and status (SUB).
    IoPub,
    /// Out-of-band requests such as interrupts (DEALER).
    Control,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Shell => "shell",
            ChannelRole::IoPub => "iopub",
            ChannelRole::Control => "control",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_signature_scheme() -> String {
    SIGNATURE_SCHEME.to_string()
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Everything needed to reach one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub ip: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    /// Shared HMAC secret.
    pub key: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    #[serde(default)]
    pub kernel_name: Option<String>,
    /// Not part of the connection file; the wire protocol version we speak.
    #[serde(default = "default_protocol_version", skip_serializing)]
    pub protocol_version: String,
}

impl ConnectionDescriptor {
    /// Build a descriptor for a kernel on `ip` with explicit ports.
    ///
    /// Ports are given in the order shell, iopub, stdin, control, heartbeat.
    pub fn new(ip: impl Into<String>, ports: [u16; 5], key: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            shell_port: ports[0],
            iopub_port: ports[1],
            stdin_port: ports[2],
            control_port: ports[3],
            hb_port: ports[4],
            key: key.into(),
            transport: default_transport(),
            signature_scheme: default_signature_scheme(),
            kernel_name: None,
            protocol_version: default_protocol_version(),
        }
    }

    /// Read and validate a connection file.
    pub fn from_file(path: &Path) -> Result<Self, DescriptorError> {
        let raw = std::fs::read_to_string(path).map_err(|source| DescriptorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate connection-file JSON.
    ///
    /// Missing keys are reported together, in [`REQUIRED_FIELDS`] order.
    pub fn from_json(raw: &str) -> Result<Self, DescriptorError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| DescriptorError::Malformed(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| DescriptorError::Malformed("expected a JSON object".to_string()))?;

        let missing = missing_fields(object);
        if !missing.is_empty() {
            return Err(DescriptorError::MissingFields { fields: missing });
        }

        let descriptor: ConnectionDescriptor = serde_json::from_value(value)
            .map_err(|e| DescriptorError::Malformed(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check the invariants a hand-built descriptor must also satisfy.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let mut missing = Vec::new();
        if self.ip.trim().is_empty() {
            missing.push("ip");
        }
        for (name, port) in [
            ("shell_port", self.shell_port),
            ("iopub_port", self.iopub_port),
            ("stdin_port", self.stdin_port),
            ("control_port", self.control_port),
            ("hb_port", self.hb_port),
        ] {
            if port == 0 {
                missing.push(name);
            }
        }
        if self.key.is_empty() {
            missing.push("key");
        }
        if !missing.is_empty() {
            return Err(DescriptorError::MissingFields { fields: missing });
        }

        if !self.signature_scheme.eq_ignore_ascii_case(SIGNATURE_SCHEME) {
            return Err(DescriptorError::UnsupportedScheme(
                self.signature_scheme.clone(),
            ));
        }
        Ok(())
    }

    /// Port for a channel role.
    pub fn port(&self, role: ChannelRole) -> u16 {
        match role {
            ChannelRole::Shell => self.shell_port,
            ChannelRole::IoPub => self.iopub_port,
            ChannelRole::Control => self.control_port,
        }
    }

    /// Endpoint address for a channel role, e.g. `tcp://127.0.0.1:53794`.
    pub fn address(&self, role: ChannelRole) -> String {
        format!("{}://{}:{}", self.transport, self.ip, self.port(role))
    }

    /// `ip:shell_port`, the identity reported by status calls.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.shell_port)
    }

    /// First characters of the key, safe to show in status text.
    pub fn key_preview(&self) -> String {
        self.key.chars().take(8).collect()
    }
}

fn missing_fields(object: &Map<String, Value>) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| match object.get(*field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        })
        .collect()
}
