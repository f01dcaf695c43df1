//! In-memory kernel and clock for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::connection::ChannelRole;
use crate::kernel::clock::Clock;
use crate::kernel::codec::{sign, Frames, DELIMITER};
use crate::kernel::transport::{Channel, Connector, TransportError};

/// A request the fake kernel received on shell or control.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub role: ChannelRole,
    pub msg_type: String,
    pub msg_id: String,
    pub code: Option<String>,
    pub frames: Frames,
}

type Responder = Box<dyn FnMut(&Request) -> Vec<Frames> + Send>;

#[derive(Default)]
struct FakeState {
    opened: Vec<(ChannelRole, String)>,
    closed: Vec<ChannelRole>,
    open_channels: usize,
    fail_on: Option<ChannelRole>,
    requests: Vec<Request>,
    iopub: VecDeque<Frames>,
    responder: Option<Responder>,
}

/// Scripted stand-in for a kernel.
///
/// Requests are recorded; a responder closure may publish IOPub replies for
/// each one.
#[derive(Clone, Default)]
pub(crate) struct FakeKernel {
    state: Arc<Mutex<FakeState>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel that answers every execute request via `script(code, msg_id)`.
    pub fn scripted<F>(mut script: F) -> Self
    where
        F: FnMut(&str, &str) -> Vec<Frames> + Send + 'static,
    {
        let kernel = Self::new();
        kernel.respond_with(move |request| match (&request.code, request.msg_type.as_str()) {
            (Some(code), "execute_request") => script(code.as_str(), request.msg_id.as_str()),
            _ => Vec::new(),
        });
        kernel
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(FakeConnector {
            state: Arc::clone(&self.state),
        })
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&Request) -> Vec<Frames> + Send + 'static,
    {
        self.state.lock().unwrap().responder = Some(Box::new(responder));
    }

    pub fn fail_open(&self, role: ChannelRole) {
        self.state.lock().unwrap().fail_on = Some(role);
    }

    pub fn publish(&self, frames: Frames) {
        self.state.lock().unwrap().iopub.push_back(frames);
    }

    pub fn publish_all(&self, messages: Vec<Frames>) {
        self.state.lock().unwrap().iopub.extend(messages);
    }

    pub fn opened(&self) -> Vec<(ChannelRole, String)> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn closed(&self) -> Vec<ChannelRole> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().unwrap().open_channels
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_on(&self, role: ChannelRole) -> Vec<Request> {
        self.requests().into_iter().filter(|r| r.role == role).collect()
    }
}

struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        role: ChannelRole,
        address: &str,
    ) -> Result<Box<dyn Channel>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_on == Some(role) {
            return Err(TransportError::Bind {
                channel: role,
                address: address.to_string(),
                cause: "connection refused".to_string(),
            });
        }
        state.opened.push((role, address.to_string()));
        state.open_channels += 1;
        Ok(Box::new(FakeChannel {
            role,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeChannel {
    role: ChannelRole,
    state: Arc<Mutex<FakeState>>,
}

fn decode_request(role: ChannelRole, frames: &Frames) -> Request {
    let header: Value = frames
        .get(3)
        .and_then(|f| serde_json::from_slice(f).ok())
        .unwrap_or(Value::Null);
    let content: Value = frames
        .get(6)
        .and_then(|f| serde_json::from_slice(f).ok())
        .unwrap_or(Value::Null);
    Request {
        role,
        msg_type: header["msg_type"].as_str().unwrap_or_default().to_string(),
        msg_id: header["msg_id"].as_str().unwrap_or_default().to_string(),
        code: content["code"].as_str().map(str::to_string),
        frames: frames.clone(),
    }
}

#[async_trait]
impl Channel for FakeChannel {
    async fn send(&mut self, frames: Frames) -> Result<(), TransportError> {
        if self.role == ChannelRole::IoPub {
            return Err(TransportError::Io {
                channel: self.role,
                cause: "subscriber sockets cannot send".to_string(),
            });
        }
        let request = decode_request(self.role, &frames);
        let mut state = self.state.lock().unwrap();
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&request),
            None => Vec::new(),
        };
        state.requests.push(request);
        state.iopub.extend(replies);
        Ok(())
    }

    async fn try_recv(&mut self) -> Result<Option<Frames>, TransportError> {
        if self.role != ChannelRole::IoPub {
            return Ok(None);
        }
        Ok(self.state.lock().unwrap().iopub.pop_front())
    }

    async fn close(self: Box<Self>) {
        let mut state = self.state.lock().unwrap();
        state.closed.push(self.role);
        state.open_channels = state.open_channels.saturating_sub(1);
    }
}

fn iopub_frames(signature: Bytes, header: Vec<u8>, parent: Vec<u8>, content: Vec<u8>) -> Frames {
    vec![
        Bytes::from_static(b"kernel.fake.iopub"),
        Bytes::from_static(DELIMITER),
        signature,
        Bytes::from(header),
        Bytes::from(parent),
        Bytes::from_static(b"{}"),
        Bytes::from(content),
    ]
}

fn reply_parts(parent_id: &str, msg_type: &str, content: &Value) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let header = json!({
        "msg_id": Uuid::new_v4().to_string(),
        "msg_type": msg_type,
        "session": "fake-kernel",
        "username": "kernel",
        "date": "2026-01-01T00:00:00.000000Z",
        "version": "5.3",
    });
    let parent = json!({"msg_id": parent_id, "msg_type": "execute_request"});
    (
        serde_json::to_vec(&header).unwrap(),
        serde_json::to_vec(&parent).unwrap(),
        serde_json::to_vec(content).unwrap(),
    )
}

/// Unsigned IOPub message replying to `parent_id`.
pub(crate) fn iopub_message(parent_id: &str, msg_type: &str, content: Value) -> Frames {
    let (header, parent, content) = reply_parts(parent_id, msg_type, &content);
    iopub_frames(Bytes::new(), header, parent, content)
}

/// IOPub message signed with `key`.
pub(crate) fn signed_iopub_message(key: &[u8], parent_id: &str, msg_type: &str, content: Value) -> Frames {
    let (header, parent, content) = reply_parts(parent_id, msg_type, &content);
    let signed: [&[u8]; 4] = [&header, &parent, b"{}", &content];
    let signature = Bytes::from(sign(&signed, key));
    iopub_frames(signature, header, parent, content)
}

pub(crate) fn status(parent_id: &str, state: &str) -> Frames {
    iopub_message(parent_id, "status", json!({"execution_state": state}))
}

pub(crate) fn stream(parent_id: &str, text: &str) -> Frames {
    iopub_message(parent_id, "stream", json!({"name": "stdout", "text": text}))
}

pub(crate) fn execute_result(parent_id: &str, text: &str) -> Frames {
    iopub_message(
        parent_id,
        "execute_result",
        json!({"execution_count": 1, "data": {"text/plain": text}, "metadata": {}}),
    )
}

pub(crate) fn error(parent_id: &str, ename: &str, evalue: &str, traceback: &[&str]) -> Frames {
    iopub_message(
        parent_id,
        "error",
        json!({"ename": ename, "evalue": evalue, "traceback": traceback}),
    )
}

/// busy, the given outputs, then idle.
pub(crate) fn execution_flow(parent_id: &str, outputs: Vec<Frames>) -> Vec<Frames> {
    let mut flow = vec![status(parent_id, "busy")];
    flow.extend(outputs);
    flow.push(status(parent_id, "idle"));
    flow
}

/// Clock whose sleeps return immediately and advance virtual time.
#[derive(Clone)]
pub(crate) struct ManualClock {
    base: Instant,
    state: Arc<Mutex<(Duration, usize)>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            state: Arc::new(Mutex::new((Duration::ZERO, 0))),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().unwrap().0
    }

    pub fn sleeps(&self) -> usize {
        self.state.lock().unwrap().1
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.0 += duration;
        state.1 += 1;
    }
}
