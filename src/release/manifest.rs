//! Release manifest, evidence bundle and plan snapshot types.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{canonical_digest, is_digest, CanonicalError};

/// Schema tag every release manifest must carry.
pub const RELEASE_SCHEMA: &str = "weftend.release/0";

/// A signed, hash-pinned description of a published block set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseManifest {
    pub schema: String,
    /// Canonical hash of `manifest_body`.
    pub release_id: String,
    pub manifest_body: ManifestBody,
    #[serde(default)]
    pub signatures: Vec<ReleaseSignature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestBody {
    pub plan_digest: String,
    pub policy_digest: String,
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_journal_head: Option<String>,
    pub path_digest: String,
}

impl ManifestBody {
    /// The release id this body must be published under.
    pub fn release_id(&self) -> Result<String, CanonicalError> {
        canonical_digest(self)
    }
}

/// Signature over the UTF-8 bytes of `release_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSignature {
    pub sig_kind: String,
    pub key_id: String,
    pub sig_b64: String,
}

impl ReleaseManifest {
    /// Structural checks. Returns `false` on the first violation.
    pub fn is_well_formed(&self) -> bool {
        let body = &self.manifest_body;
        self.schema == RELEASE_SCHEMA
            && is_digest(&self.release_id)
            && !body.plan_digest.is_empty()
            && !body.policy_digest.is_empty()
            && !body.path_digest.is_empty()
            && !body.blocks.is_empty()
            && body.blocks.iter().all(|b| !b.is_empty())
            && body
                .evidence_journal_head
                .as_deref()
                .map_or(true, is_digest)
            && self.signatures.iter().all(|s| {
                !s.sig_kind.is_empty() && !s.key_id.is_empty() && !s.sig_b64.is_empty()
            })
    }
}

/// Envelope of one evidence claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceEnvelope {
    pub kind: String,
    pub subject: String,
    #[serde(default)]
    pub payload: Value,
}

impl EvidenceEnvelope {
    pub fn evidence_id(&self) -> Result<String, CanonicalError> {
        canonical_digest(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRecord {
    /// Canonical hash of `envelope`.
    pub evidence_id: String,
    pub envelope: EvidenceEnvelope,
}

/// Ordered evidence records supporting a release.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceBundle {
    #[serde(default)]
    pub records: Vec<EvidenceRecord>,
}

impl EvidenceBundle {
    /// Journal head over the *claimed* evidence ids, in record order.
    ///
    /// `None` for an empty bundle.
    pub fn journal_head(&self) -> Result<Option<String>, CanonicalError> {
        let mut head: Option<String> = None;
        for record in &self.records {
            let link = json!({ "prev": head, "evidenceId": record.evidence_id });
            head = Some(canonical_digest(&link)?);
        }
        Ok(head)
    }
}

/// Summary of the approved execution path, hashed into `pathDigest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSummary {
    pub schema: String,
    pub graph_digest: String,
    #[serde(default)]
    pub anchors: Vec<String>,
}

impl PathSummary {
    pub fn path_digest(&self) -> Result<String, CanonicalError> {
        canonical_digest(self)
    }
}

/// Digest set captured when the plan was approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSnapshot {
    pub plan_digest: String,
    pub graph_digest: String,
    pub path_summary: PathSummary,
}
