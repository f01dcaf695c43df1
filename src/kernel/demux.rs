//! Routing of IOPub broadcasts to in-flight executions.
//!
//! The kernel publishes every output, error and status change for every
//! client on one IOPub stream. A drain pass reads that stream until it is
//! empty and folds each message into the [`PendingExecution`] whose
//! correlation id matches the message's parent header. Messages that are
//! malformed, unsigned (when verification is on), or addressed to an id the
//! tracker does not know are dropped.
//!
//! [`PendingExecution`]: crate::kernel::tracker::PendingExecution

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;

use crate::connection::ChannelRole;
use crate::kernel::codec::{parse_frames, verify_frames, InboundMessage};
use crate::kernel::tracker::{ExecutionState, ExecutionTracker, KernelEvent};
use crate::kernel::transport::{TransportError, TransportSession};

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Folded into the execution with this id.
    Delivered(String),
    /// Malformed, unverified, or for an untracked id.
    Discarded,
}

/// Tally of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages delivered per correlation id.
    pub delivered: HashMap<String, usize>,
    pub discarded: usize,
}

impl DrainReport {
    pub fn delivered_to(&self, msg_id: &str) -> usize {
        self.delivered.get(msg_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.delivered.values().sum::<usize>() + self.discarded
    }
}

/// Stateless apart from the optional verification key.
#[derive(Debug, Clone, Default)]
pub struct ReplyDemultiplexer {
    verify_key: Option<Vec<u8>>,
}

impl ReplyDemultiplexer {
    /// Route without checking inbound signatures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route only messages whose signature verifies under `key`.
    pub fn verifying(key: impl Into<Vec<u8>>) -> Self {
        Self {
            verify_key: Some(key.into()),
        }
    }

    /// Read IOPub until empty, routing everything into `tracker`.
    ///
    /// Shell and control replies are drained and dropped as well so the
    /// kernel's outbound queues never fill up.
    pub async fn drain(
        &self,
        session: &mut TransportSession,
        tracker: &mut ExecutionTracker,
    ) -> Result<DrainReport, TransportError> {
        let mut report = DrainReport::default();

        while let Some(frames) = session.try_receive(ChannelRole::IoPub).await? {
            match self.route(&frames, tracker) {
                Routed::Delivered(msg_id) => *report.delivered.entry(msg_id).or_default() += 1,
                Routed::Discarded => report.discarded += 1,
            }
        }

        for role in [ChannelRole::Shell, ChannelRole::Control] {
            while let Some(frames) = session.try_receive(role).await? {
                tracing::trace!("Dropped {} reply ({} frames)", role, frames.len());
            }
        }

        Ok(report)
    }

    /// Route one inbound message.
    pub fn route(&self, frames: &[Bytes], tracker: &mut ExecutionTracker) -> Routed {
        if let Some(key) = &self.verify_key {
            if !verify_frames(frames, key) {
                tracing::warn!("Discarding IOPub message with invalid signature");
                return Routed::Discarded;
            }
        }

        let Some(message) = parse_frames(frames) else {
            tracing::trace!("Discarding malformed IOPub message ({} frames)", frames.len());
            return Routed::Discarded;
        };

        let Some(parent_id) = message.parent_id.clone() else {
            return Routed::Discarded;
        };
        if !tracker.contains(&parent_id) {
            tracing::trace!("Ignoring {} for untracked request {}", message.msg_type, parent_id);
            return Routed::Discarded;
        }

        if let Some(event) = to_event(&message) {
            tracker.apply(&parent_id, event);
        }
        Routed::Delivered(parent_id)
    }
}

/// Translate a message into the event it contributes, if any.
pub fn to_event(message: &InboundMessage) -> Option<KernelEvent> {
    let content = &message.content;
    let text = |value: Option<&Value>| value.and_then(Value::as_str).unwrap_or("").to_string();

    match message.msg_type.as_str() {
        "execute_result" => Some(KernelEvent::Result(text(
            content.get("data").and_then(|d| d.get("text/plain")),
        ))),
        "stream" => Some(KernelEvent::Stream(text(content.get("text")))),
        "error" => {
            let ename = content
                .get("ename")
                .and_then(Value::as_str)
                .unwrap_or("Error")
                .to_string();
            let traceback = content
                .get("traceback")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(KernelEvent::Error {
                ename,
                evalue: text(content.get("evalue")),
                traceback,
            })
        }
        "status" => content
            .get("execution_state")
            .and_then(Value::as_str)
            .map(|state| KernelEvent::Status(ExecutionState::parse(state))),
        _ => None,
    }
}
