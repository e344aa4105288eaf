//! Reason codes.
//!
//! Every deny, downgrade or failure is explained by short stable strings.
//! They are always emitted sorted ascending and deduplicated, so two runs with
//! the same faults produce byte-identical diagnostics.

use std::collections::BTreeSet;

use serde::{Serialize, Serializer};

// ── Kernel ───────────────────────────────────────────────

pub const INVOKE_SHAPE_INVALID: &str = "INVOKE_SHAPE_INVALID";
pub const BINDING_INVALID: &str = "BINDING_INVALID";
pub const EXECUTION_MODE_MISMATCH: &str = "EXECUTION_MODE_MISMATCH";
pub const CALLER_MISMATCH: &str = "CALLER_MISMATCH";
pub const NONCE_MISMATCH: &str = "NONCE_MISMATCH";
pub const REPLAY_DETECTED: &str = "REPLAY_DETECTED";
pub const REPLAY_LEDGER_FULL: &str = "REPLAY_LEDGER_FULL";
pub const CAP_NOT_GRANTED: &str = "CAP_NOT_GRANTED";
pub const CAP_DENIED: &str = "CAP_DENIED";

// ── Executor / sandbox ───────────────────────────────────

pub const UNTRUSTED_CHANNEL: &str = "UNTRUSTED_CHANNEL";
pub const STRICT_COMPARTMENT_UNAVAILABLE: &str = "STRICT_COMPARTMENT_UNAVAILABLE";
pub const STRICT_SELFTEST_FAILED: &str = "STRICT_SELFTEST_FAILED";
pub const STRICT_EXECUTION_TIMEOUT: &str = "STRICT_EXECUTION_TIMEOUT";
pub const STRICT_TERMINATED: &str = "STRICT_TERMINATED";
pub const STRICT_LAUNCH_FAILED: &str = "STRICT_LAUNCH_FAILED";
pub const STRICT_ENTRY_FAILED: &str = "STRICT_ENTRY_FAILED";
pub const STRICT_CHANNEL_CLOSED: &str = "STRICT_CHANNEL_CLOSED";
pub const STRICT_PROTOCOL_VIOLATION: &str = "STRICT_PROTOCOL_VIOLATION";
pub const RELEASE_MAYBE_NOT_TOLERATED: &str = "RELEASE_MAYBE_NOT_TOLERATED";

// ── Release verification ─────────────────────────────────

pub const RELEASE_MANIFEST_INVALID: &str = "RELEASE_MANIFEST_INVALID";
pub const RELEASE_ID_MISMATCH: &str = "RELEASE_ID_MISMATCH";
pub const RELEASE_PLANDIGEST_MISMATCH: &str = "RELEASE_PLANDIGEST_MISMATCH";
pub const RELEASE_BLOCKSET_MISMATCH: &str = "RELEASE_BLOCKSET_MISMATCH";
pub const RELEASE_PATHDIGEST_MISMATCH: &str = "RELEASE_PATHDIGEST_MISMATCH";
pub const PATH_DIGEST_MISMATCH: &str = "PATH_DIGEST_MISMATCH";
pub const PATH_SUMMARY_INVALID: &str = "PATH_SUMMARY_INVALID";
pub const PLAN_SNAPSHOT_MISMATCH: &str = "PLAN_SNAPSHOT_MISMATCH";
pub const PLAN_SNAPSHOT_MISSING: &str = "PLAN_SNAPSHOT_MISSING";
pub const RELEASE_SIGNATURE_BAD: &str = "RELEASE_SIGNATURE_BAD";
pub const RELEASE_SIGNATURE_MISSING: &str = "RELEASE_SIGNATURE_MISSING";
pub const RELEASE_KEY_UNKNOWN: &str = "RELEASE_KEY_UNKNOWN";
pub const RELEASE_SIG_KIND_UNKNOWN: &str = "RELEASE_SIG_KIND_UNKNOWN";
pub const EVIDENCE_ID_MISMATCH: &str = "EVIDENCE_ID_MISMATCH";
pub const EVIDENCE_HEAD_MISMATCH: &str = "EVIDENCE_HEAD_MISMATCH";
pub const EVIDENCE_HEAD_UNCONFIRMED: &str = "EVIDENCE_HEAD_UNCONFIRMED";

// ── Artifacts ────────────────────────────────────────────

pub const ARTIFACT_DIGEST_MISMATCH: &str = "ARTIFACT_DIGEST_MISMATCH";
pub const ARTIFACT_TAMPERED: &str = "ARTIFACT_TAMPERED";
pub const ARTIFACT_MISSING: &str = "ARTIFACT_MISSING";
pub const ARTIFACT_STORE_IO: &str = "ARTIFACT_STORE_IO";

/// `STRICT_SELFTEST_FAILED:<code>`
pub fn selftest_failed(code: &str) -> String {
    format!("{STRICT_SELFTEST_FAILED}:{code}")
}

/// A sorted, deduplicated set of reason codes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReasonCodes(BTreeSet<String>);

impl ReasonCodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, code: impl Into<String>) {
        self.0.insert(code.into());
    }

    pub fn extend<I, S>(&mut self, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for code in codes {
            self.push(code);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Sorted ascending, no duplicates.
    pub fn into_vec(self) -> Vec<String> {
        self.0.into_iter().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for ReasonCodes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut codes = Self::new();
        codes.extend(iter);
        codes
    }
}

impl Serialize for ReasonCodes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}
