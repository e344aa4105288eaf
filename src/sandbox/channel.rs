//! The single authenticated channel between a sandbox and the host.
//!
//! Sandbox → host frames carry a per-launch channel id, a sequence number and
//! an HMAC-SHA256 tag over both plus the payload. The host accepts a frame
//! only if the id matches, the tag verifies under the launch key and the
//! sequence number is exactly the next one expected, so frames can be neither
//! spoofed, replayed nor reordered.
//!
//! Host → sandbox traffic travels over a plain `mpsc` the host owns.

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::kernel::{CapDecision, InvocationMessage};
use crate::plan::{CapabilityRequest, ExecutionMode};

type HmacSha256 = Hmac<Sha256>;

/// Bound on in-flight frames in either direction.
pub const CHANNEL_CAPACITY: usize = 64;

/// One authenticated sandbox → host frame.
#[derive(Debug, Clone)]
pub struct ChannelEnvelope {
    pub channel_id: String,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub tag: Vec<u8>,
}

/// Exposed surface of a compartment, reported before anything runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceReport {
    /// Functions the host makes available, as `module::name`.
    pub host_exports: Vec<String>,
    /// Functions the guest code asks for, as `module::name`.
    pub guest_imports: Vec<String>,
}

/// Sandbox → host messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    SelfTest(SurfaceReport),
    Invoke(InvocationMessage),
    Done {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<i64>,
    },
}

/// Host → sandbox messages.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    /// Self-test accepted; call the entry export.
    Start,
    Decision { req_id: String, decision: CapDecision },
}

/// Binding fields the sandbox-side shim stamps onto every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingStamp {
    pub plan_digest: String,
    pub caller_block_hash: String,
    pub session_nonce: String,
    pub execution_mode: ExecutionMode,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Wrong channel id, bad tag, or out-of-order sequence number.
    #[error("untrusted channel frame: {0}")]
    Untrusted(String),
    /// Authenticated, but not a message this protocol knows.
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("channel closed")]
    Closed,
}

/// Per-launch channel identity and MAC key.
#[derive(Clone)]
pub struct ChannelKey {
    channel_id: String,
    key: [u8; 32],
}

impl ChannelKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            channel_id: uuid::Uuid::new_v4().to_string(),
            key,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn mac(&self, seq: u64, payload: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(self.channel_id.as_bytes());
        mac.update(&seq.to_be_bytes());
        mac.update(payload);
        mac
    }

    pub fn seal(&self, seq: u64, payload: Vec<u8>) -> ChannelEnvelope {
        let tag = self.mac(seq, &payload).finalize().into_bytes().to_vec();
        ChannelEnvelope {
            channel_id: self.channel_id.clone(),
            seq,
            payload,
            tag,
        }
    }

    /// Constant-time tag check.
    pub fn verify(&self, envelope: &ChannelEnvelope) -> bool {
        envelope.channel_id == self.channel_id
            && self
                .mac(envelope.seq, &envelope.payload)
                .verify_slice(&envelope.tag)
                .is_ok()
    }
}

/// What an authenticated frame turned out to contain.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(WorkerMessage),
    /// An `invoke` frame whose body is not a valid invocation. The raw body
    /// goes to the kernel, which denies it.
    MalformedInvoke { req_id: Option<String>, raw: Vec<u8> },
}

/// Host end of the channel.
pub struct HostLink {
    key: ChannelKey,
    expected_seq: u64,
    inbound: mpsc::Receiver<ChannelEnvelope>,
    outbound: mpsc::Sender<HostMessage>,
}

impl HostLink {
    pub async fn recv(&mut self) -> Option<ChannelEnvelope> {
        self.inbound.recv().await
    }

    /// Authenticates and decodes one frame.
    pub fn open(&mut self, envelope: &ChannelEnvelope) -> Result<Inbound, ChannelError> {
        if !self.key.verify(envelope) {
            return Err(ChannelError::Untrusted(format!(
                "frame from channel {} failed authentication",
                envelope.channel_id
            )));
        }
        if envelope.seq != self.expected_seq {
            return Err(ChannelError::Untrusted(format!(
                "sequence {} where {} was expected",
                envelope.seq, self.expected_seq
            )));
        }
        self.expected_seq += 1;
        debug!("Accepted frame {} ({} bytes)", envelope.seq, envelope.payload.len());
        decode(&envelope.payload)
    }

    pub async fn send(&self, msg: HostMessage) -> Result<(), ChannelError> {
        self.outbound.send(msg).await.map_err(|_| ChannelError::Closed)
    }
}

fn decode(payload: &[u8]) -> Result<Inbound, ChannelError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| ChannelError::Malformed(e.to_string()))?;
    let kind = value.get("kind").and_then(Value::as_str).map(str::to_string);
    match serde_json::from_value::<WorkerMessage>(value.clone()) {
        Ok(msg) => Ok(Inbound::Message(msg)),
        Err(_) if kind.as_deref() == Some("invoke") => {
            let mut body = value;
            if let Some(obj) = body.as_object_mut() {
                obj.remove("kind");
            }
            Ok(Inbound::MalformedInvoke {
                req_id: body.get("reqId").and_then(Value::as_str).map(str::to_string),
                raw: serde_json::to_vec(&body).map_err(|e| ChannelError::Malformed(e.to_string()))?,
            })
        }
        Err(e) => Err(ChannelError::Malformed(e.to_string())),
    }
}

/// Sandbox end of the channel. All methods block the calling thread and must
/// not be used from inside an async task.
pub struct WorkerPort {
    key: ChannelKey,
    next_seq: u64,
    inbound: mpsc::Sender<ChannelEnvelope>,
    outbound: mpsc::Receiver<HostMessage>,
    stamp: BindingStamp,
}

impl WorkerPort {
    pub fn stamp(&self) -> &BindingStamp {
        &self.stamp
    }

    pub fn send(&mut self, msg: &WorkerMessage) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(msg).map_err(|e| ChannelError::Malformed(e.to_string()))?;
        self.send_payload(payload)
    }

    /// Seals and sends an already-encoded payload.
    pub fn send_payload(&mut self, payload: Vec<u8>) -> Result<(), ChannelError> {
        let envelope = self.key.seal(self.next_seq, payload);
        self.next_seq += 1;
        self.inbound
            .blocking_send(envelope)
            .map_err(|_| ChannelError::Closed)
    }

    /// Blocks until the host accepts the self-test.
    pub fn wait_for_start(&mut self) -> Result<(), ChannelError> {
        match self.outbound.blocking_recv() {
            Some(HostMessage::Start) => Ok(()),
            Some(HostMessage::Decision { req_id, .. }) => Err(ChannelError::Malformed(format!(
                "decision for {req_id} before start"
            ))),
            None => Err(ChannelError::Closed),
        }
    }

    /// Sends one capability request, stamped with the binding and a fresh
    /// request id, and blocks for the kernel's decision.
    pub fn invoke(&mut self, request: CapabilityRequest) -> Result<CapDecision, ChannelError> {
        let req_id = uuid::Uuid::new_v4().to_string();
        let msg = InvocationMessage {
            req_id: req_id.clone(),
            cap_id: request.cap_id,
            execution_mode: self.stamp.execution_mode,
            plan_digest: self.stamp.plan_digest.clone(),
            session_nonce: self.stamp.session_nonce.clone(),
            caller_block_hash: self.stamp.caller_block_hash.clone(),
            params: request.params.map(Value::Object),
        };
        self.send(&WorkerMessage::Invoke(msg))?;
        self.wait_for_decision(&req_id)
    }

    pub fn wait_for_decision(&mut self, req_id: &str) -> Result<CapDecision, ChannelError> {
        match self.outbound.blocking_recv() {
            Some(HostMessage::Decision {
                req_id: answered,
                decision,
            }) if answered == req_id => Ok(decision),
            Some(other) => Err(ChannelError::Malformed(format!(
                "unexpected host message while waiting for {req_id}: {other:?}"
            ))),
            None => Err(ChannelError::Closed),
        }
    }

    /// Raw, unauthenticated access to the inbound queue. Anything pushed here
    /// without the launch key is rejected by the host.
    pub fn raw_sender(&self) -> mpsc::Sender<ChannelEnvelope> {
        self.inbound.clone()
    }
}

/// Creates both ends of a fresh channel.
pub fn channel_pair(stamp: BindingStamp) -> (HostLink, WorkerPort) {
    let key = ChannelKey::generate();
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        HostLink {
            key: key.clone(),
            expected_seq: 0,
            inbound: inbound_rx,
            outbound: outbound_tx,
        },
        WorkerPort {
            key,
            next_seq: 0,
            inbound: inbound_tx,
            outbound: outbound_rx,
            stamp,
        },
    )
}
