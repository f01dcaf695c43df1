//! Jupyter wire-protocol message framing and signing.
//!
//! Every message travels as a ZeroMQ multipart message. Outbound messages
//! from this client are exactly seven frames:
//!
//! ```text
//! [0] b""            empty routing prefix
//! [1] b"<IDS|MSG>"   delimiter
//! [2] signature      lowercase hex HMAC-SHA256
//! [3] header         JSON
//! [4] parent_header  JSON
//! [5] metadata       JSON
//! [6] content        JSON
//! ```
//!
//! The signature covers frames 3..=6, concatenated in that order, keyed by
//! the shared secret from the connection file.
//!
//! Inbound IOPub messages carry a topic frame in place of the empty prefix.
//! Anything shorter than seven frames, or without a delimiter, is dropped.

use std::sync::OnceLock;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Multipart frame sequence.
pub type Frames = Vec<Bytes>;

/// Separates routing identities from the signed message body.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Wire protocol version stamped into every header.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Minimum number of frames in a well-formed message.
pub const MIN_FRAMES: usize = 7;

type HmacSha256 = Hmac<Sha256>;

/// Message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Correlation id; replies echo it in their parent header.
    pub msg_id: String,
    pub username: String,
    pub session: String,
    /// ISO-8601 creation time.
    pub date: String,
    pub msg_type: String,
    pub version: String,
}

/// Compute the signature for the four signed segments.
///
/// Segments are fed to the MAC in order (header, parent header, metadata,
/// content); the result is the lowercase hex digest.
pub fn sign(segments: &[&[u8]], key: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    for segment in segments {
        mac.update(segment);
    }
    hex::encode(mac.finalize().into_bytes())
}

/// Check a received signature against the recomputed one in constant time.
pub fn verify(segments: &[&[u8]], key: &[u8], signature: &[u8]) -> bool {
    let expected = sign(segments, key);
    expected.as_bytes().ct_eq(signature).into()
}

/// An outbound message before framing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub header: Header,
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
}

impl OutboundMessage {
    /// Correlation id of this message.
    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    /// Serialize, sign and frame the message.
    pub fn to_frames(&self, key: &[u8]) -> serde_json::Result<Frames> {
        let header = serde_json::to_vec(&self.header)?;
        let parent_header = serde_json::to_vec(&self.parent_header)?;
        let metadata = serde_json::to_vec(&self.metadata)?;
        let content = serde_json::to_vec(&self.content)?;

        let signed: [&[u8]; 4] = [&header, &parent_header, &metadata, &content];
        let signature = sign(&signed, key);

        Ok(vec![
            Bytes::new(),
            Bytes::from_static(DELIMITER),
            Bytes::from(signature),
            Bytes::from(header),
            Bytes::from(parent_header),
            Bytes::from(metadata),
            Bytes::from(content),
        ])
    }
}

/// Builds headers for one client session.
///
/// The session id is fixed for the codec's lifetime; each message gets a
/// fresh correlation id.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    username: String,
    session: String,
    version: String,
}

impl MessageCodec {
    pub fn new(username: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            session: Uuid::new_v4().to_string(),
            version: version.into(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn header(&self, msg_type: &str) -> Header {
        Header {
            msg_id: Uuid::new_v4().to_string(),
            username: self.username.clone(),
            session: self.session.clone(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            msg_type: msg_type.to_string(),
            version: self.version.clone(),
        }
    }

    /// `execute_request` for `code`.
    pub fn execute_request(&self, code: &str, store_history: bool) -> OutboundMessage {
        OutboundMessage {
            header: self.header("execute_request"),
            parent_header: json!({}),
            metadata: json!({}),
            content: json!({
                "code": code,
                "silent": false,
                "store_history": store_history,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        }
    }

    /// `interrupt_request`, sent on the control channel.
    pub fn interrupt_request(&self) -> OutboundMessage {
        OutboundMessage {
            header: self.header("interrupt_request"),
            parent_header: json!({}),
            metadata: json!({}),
            content: json!({}),
        }
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub msg_type: String,
    /// `parent_header.msg_id`, when present.
    pub parent_id: Option<String>,
    pub content: Value,
}

/// Locate the signed body of a multipart message.
///
/// Returns the index of the delimiter, or `None` when the message is too
/// short or has no delimiter followed by five frames.
fn delimiter_index(frames: &[Bytes]) -> Option<usize> {
    if frames.len() < MIN_FRAMES {
        return None;
    }
    let index = frames.iter().position(|f| f.as_ref() == DELIMITER)?;
    if frames.len() < index + 6 {
        return None;
    }
    Some(index)
}

/// Check an inbound message's signature.
///
/// Malformed messages never verify.
pub fn verify_frames(frames: &[Bytes], key: &[u8]) -> bool {
    let Some(index) = delimiter_index(frames) else {
        return false;
    };
    let signed: Vec<&[u8]> = frames[index + 2..index + 6].iter().map(|f| f.as_ref()).collect();
    verify(&signed, key, &frames[index + 1])
}

/// Decode an inbound message, or `None` if it is malformed.
pub fn parse_frames(frames: &[Bytes]) -> Option<InboundMessage> {
    let index = delimiter_index(frames)?;

    let header: Value = serde_json::from_slice(&frames[index + 2]).ok()?;
    let parent_frame = &frames[index + 3];
    let parent_header: Value = if parent_frame.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(parent_frame).ok()?
    };
    let content: Value = serde_json::from_slice(&frames[index + 5]).ok()?;

    Some(InboundMessage {
        msg_type: header.get("msg_type")?.as_str()?.to_string(),
        parent_id: parent_header
            .get("msg_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        content,
    })
}

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // CSI sequences (colors, cursor movement) and OSC sequences.
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
            .expect("valid regex")
    })
}

/// Remove terminal escape sequences from kernel-rendered text.
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}
