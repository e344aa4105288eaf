//! Capability kernel: the reference monitor.
//!
//! One `CapKernel` is bound to exactly one execution: one plan digest, one
//! caller block hash, one session nonce, one execution mode and one fixed
//! grant set. Every privileged call the sandboxed code makes arrives here as
//! an [`InvocationMessage`] and gets an ALLOW/DENY [`CapDecision`].
//!
//! All checks run on every message, so a single decision reports every
//! violation at once. The only mutable state is the replay ledger.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::plan::{is_valid_cap_id, ExecutionMode, ExecutionPlan};
use crate::reason::{self, ReasonCodes};

/// Default bound on distinct request ids one kernel remembers.
pub const DEFAULT_LEDGER_CAPACITY: usize = 65_536;

/// Maximum accepted length for `reqId`.
const MAX_REQ_ID_LEN: usize = 128;

/// The only message type the kernel accepts from the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMessage {
    pub req_id: String,
    pub cap_id: String,
    pub execution_mode: ExecutionMode,
    pub plan_digest: String,
    pub session_nonce: String,
    pub caller_block_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Outcome of one invocation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapDecision {
    pub ok: bool,
    /// Sorted ascending, deduplicated. Absent when `ok` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_codes: Option<Vec<String>>,
}

impl CapDecision {
    pub fn allow() -> Self {
        Self {
            ok: true,
            reason_codes: None,
        }
    }

    pub fn deny(codes: ReasonCodes) -> Self {
        Self {
            ok: false,
            reason_codes: Some(codes.into_vec()),
        }
    }

    fn from_codes(codes: ReasonCodes) -> Self {
        if codes.is_empty() {
            Self::allow()
        } else {
            Self::deny(codes)
        }
    }

    pub fn has_reason(&self, code: &str) -> bool {
        self.reason_codes
            .as_ref()
            .is_some_and(|codes| codes.iter().any(|c| c == code))
    }
}

/// Everything a kernel is bound to for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBinding {
    pub plan_digest: String,
    pub caller_block_hash: String,
    pub execution_mode: ExecutionMode,
    pub session_nonce: String,
    pub granted_caps: BTreeSet<String>,
    pub known_caps: BTreeSet<String>,
    pub disabled_caps: BTreeSet<String>,
}

impl KernelBinding {
    /// Binding for one node of an approved plan.
    ///
    /// The node's grants become the grant set; a node that is missing or not
    /// allowed to execute gets no binding at all.
    pub fn from_plan(
        plan: &ExecutionPlan,
        block_hash: &str,
        session_nonce: &str,
        execution_mode: ExecutionMode,
        known_caps: BTreeSet<String>,
        disabled_caps: BTreeSet<String>,
    ) -> Result<Self, KernelError> {
        let node = plan
            .node(block_hash)
            .ok_or_else(|| KernelError::NodeNotInPlan(block_hash.to_string()))?;
        if !node.allow_execute {
            return Err(KernelError::ExecutionNotAllowed(block_hash.to_string()));
        }
        Ok(Self {
            plan_digest: plan.plan_digest.clone(),
            caller_block_hash: block_hash.to_string(),
            execution_mode,
            session_nonce: session_nonce.to_string(),
            granted_caps: node.granted_cap_ids(),
            known_caps,
            disabled_caps,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("plan has no node for block {0}")]
    NodeNotInPlan(String),
    #[error("plan node {0} is not allowed to execute")]
    ExecutionNotAllowed(String),
    #[error("kernel binding field {0} is empty")]
    EmptyBinding(&'static str),
}

/// Request ids seen by one kernel. Grows monotonically, never shared.
#[derive(Debug)]
pub struct ReplayLedger {
    seen: HashSet<String>,
    capacity: usize,
}

/// Result of recording a request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntry {
    Fresh,
    Replayed,
    /// The ledger is at capacity; the id could not be recorded.
    Full,
}

impl ReplayLedger {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            capacity,
        }
    }

    /// Records `req_id`, reporting whether it was already present.
    pub fn observe(&mut self, req_id: &str) -> LedgerEntry {
        if self.seen.contains(req_id) {
            return LedgerEntry::Replayed;
        }
        if self.seen.len() >= self.capacity {
            return LedgerEntry::Full;
        }
        self.seen.insert(req_id.to_string());
        LedgerEntry::Fresh
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

pub struct CapKernel {
    binding: KernelBinding,
    ledger: ReplayLedger,
}

impl CapKernel {
    pub fn new(binding: KernelBinding) -> Result<Self, KernelError> {
        Self::with_ledger_capacity(binding, DEFAULT_LEDGER_CAPACITY)
    }

    pub fn with_ledger_capacity(
        binding: KernelBinding,
        capacity: usize,
    ) -> Result<Self, KernelError> {
        if binding.plan_digest.is_empty() {
            return Err(KernelError::EmptyBinding("planDigest"));
        }
        if binding.caller_block_hash.is_empty() {
            return Err(KernelError::EmptyBinding("callerBlockHash"));
        }
        if binding.session_nonce.is_empty() {
            return Err(KernelError::EmptyBinding("sessionNonce"));
        }
        Ok(Self {
            binding,
            ledger: ReplayLedger::with_capacity(capacity),
        })
    }

    /// Builds a kernel for one node of an approved plan, with the default
    /// ledger capacity.
    pub fn from_plan(
        plan: &ExecutionPlan,
        block_hash: &str,
        session_nonce: &str,
        execution_mode: ExecutionMode,
        known_caps: BTreeSet<String>,
        disabled_caps: BTreeSet<String>,
    ) -> Result<Self, KernelError> {
        Self::new(KernelBinding::from_plan(
            plan,
            block_hash,
            session_nonce,
            execution_mode,
            known_caps,
            disabled_caps,
        )?)
    }

    pub fn binding(&self) -> &KernelBinding {
        &self.binding
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    /// Authorizes or denies one invocation.
    pub fn handle_invoke(&mut self, msg: &InvocationMessage) -> CapDecision {
        let mut codes = ReasonCodes::new();
        let b = &self.binding;

        if !is_well_formed(msg) {
            codes.push(reason::INVOKE_SHAPE_INVALID);
        }
        if msg.plan_digest != b.plan_digest {
            codes.push(reason::BINDING_INVALID);
        }
        if msg.execution_mode != b.execution_mode {
            codes.push(reason::EXECUTION_MODE_MISMATCH);
        }
        if msg.caller_block_hash != b.caller_block_hash {
            codes.push(reason::CALLER_MISMATCH);
        }
        if msg.session_nonce != b.session_nonce {
            codes.push(reason::NONCE_MISMATCH);
        }
        if let Some(code) = grant_violation(b, &msg.cap_id) {
            codes.push(code);
        }
        match self.ledger.observe(&msg.req_id) {
            LedgerEntry::Fresh => {}
            LedgerEntry::Replayed => codes.push(reason::REPLAY_DETECTED),
            LedgerEntry::Full => codes.push(reason::REPLAY_LEDGER_FULL),
        }

        let decision = CapDecision::from_codes(codes);
        if decision.ok {
            debug!("Invoke {} ({}) allowed", msg.req_id, msg.cap_id);
        } else {
            warn!(
                "Invoke {} ({}) denied: {:?}",
                msg.req_id, msg.cap_id, decision.reason_codes
            );
        }
        decision
    }

    /// Handles bytes that are supposed to be an [`InvocationMessage`].
    ///
    /// Undecodable input is denied with `INVOKE_SHAPE_INVALID`; if a string
    /// `reqId` can still be read it is recorded in the ledger all the same.
    pub fn handle_raw(&mut self, bytes: &[u8]) -> CapDecision {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!("Invoke payload is not JSON: {e}");
                return CapDecision::deny(ReasonCodes::from_iter([reason::INVOKE_SHAPE_INVALID]));
            }
        };
        match serde_json::from_value::<InvocationMessage>(value.clone()) {
            Ok(msg) => self.handle_invoke(&msg),
            Err(e) => {
                warn!("Invoke payload has invalid shape: {e}");
                let mut codes = ReasonCodes::from_iter([reason::INVOKE_SHAPE_INVALID]);
                if let Some(req_id) = value.get("reqId").and_then(Value::as_str) {
                    match self.ledger.observe(req_id) {
                        LedgerEntry::Fresh => {}
                        LedgerEntry::Replayed => codes.push(reason::REPLAY_DETECTED),
                        LedgerEntry::Full => codes.push(reason::REPLAY_LEDGER_FULL),
                    }
                }
                CapDecision::deny(codes)
            }
        }
    }
}

fn is_well_formed(msg: &InvocationMessage) -> bool {
    !msg.req_id.is_empty()
        && msg.req_id.len() <= MAX_REQ_ID_LEN
        && is_valid_cap_id(&msg.cap_id)
        && !msg.plan_digest.is_empty()
        && !msg.session_nonce.is_empty()
        && !msg.caller_block_hash.is_empty()
        && msg.params.as_ref().map_or(true, Value::is_object)
}

/// Deny-by-default grant check, recomputed on every call:
/// authorized iff `cap ∈ granted ∩ known \ disabled`.
fn grant_violation(binding: &KernelBinding, cap_id: &str) -> Option<&'static str> {
    if !binding.granted_caps.contains(cap_id) {
        Some(reason::CAP_NOT_GRANTED)
    } else if !binding.known_caps.contains(cap_id) || binding.disabled_caps.contains(cap_id) {
        Some(reason::CAP_DENIED)
    } else {
        None
    }
}
