//! Release provenance gate.
//!
//! Every check runs independently and reports its own reason codes, so one
//! verdict lists every problem with a release at once.

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::crypto::{CryptoPort, KeyAllowlist, B64};
use super::manifest::{EvidenceBundle, PlanSnapshot, ReleaseManifest};
use crate::reason::{self, ReasonCodes};

/// Verification status of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReleaseStatus {
    /// Every check passed.
    Ok,
    /// At least one check failed or required input was missing.
    Unverified,
    /// Nothing failed, but the evidence head could not be confirmed either way.
    Maybe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseVerdict {
    pub status: ReleaseStatus,
    /// Sorted ascending, deduplicated.
    pub reason_codes: Vec<String>,
}

impl ReleaseVerdict {
    pub fn is_ok(&self) -> bool {
        self.status == ReleaseStatus::Ok
    }
}

/// Everything one verification call looks at.
pub struct VerifyInput<'a> {
    pub manifest: &'a ReleaseManifest,
    pub expected_plan_digest: &'a str,
    pub expected_blocks: &'a [String],
    pub expected_path_digest: Option<&'a str>,
    pub plan_snapshot: Option<&'a PlanSnapshot>,
    pub evidence: Option<&'a EvidenceBundle>,
    pub key_allowlist: &'a KeyAllowlist,
    pub crypto: &'a dyn CryptoPort,
}

/// Release provenance gate. Stateless; every call recomputes from scratch.
pub struct ReleaseVerifier;

impl ReleaseVerifier {
    /// Runs every check independently and folds the results.
    ///
    /// `OK` only when nothing failed. Anything that cannot be computed counts
    /// as a failure.
    pub fn verify(input: &VerifyInput<'_>) -> ReleaseVerdict {
        let mut codes = ReasonCodes::new();
        let manifest = input.manifest;
        let body = &manifest.manifest_body;

        if !manifest.is_well_formed() {
            codes.push(reason::RELEASE_MANIFEST_INVALID);
        }
        match body.release_id() {
            Ok(id) if id == manifest.release_id => {}
            Ok(_) => codes.push(reason::RELEASE_ID_MISMATCH),
            Err(_) => codes.push(reason::RELEASE_MANIFEST_INVALID),
        }

        if body.plan_digest != input.expected_plan_digest {
            codes.push(reason::RELEASE_PLANDIGEST_MISMATCH);
        }

        if normalized(&body.blocks) != normalized(input.expected_blocks) {
            codes.push(reason::RELEASE_BLOCKSET_MISMATCH);
        }

        match (input.expected_path_digest, input.plan_snapshot) {
            (Some(expected_path), _) => check_path(input, expected_path, &mut codes),
            // Nothing pinned: the snapshot's own path summary is the reference
            (None, Some(snapshot)) => match snapshot.path_summary.path_digest() {
                Ok(derived) => check_path(input, &derived, &mut codes),
                Err(_) => codes.push(reason::PATH_SUMMARY_INVALID),
            },
            (None, None) => {}
        }

        check_signatures(input, &mut codes);

        let mut head_unconfirmed = false;
        match input.evidence {
            Some(bundle) => check_evidence(bundle, body.evidence_journal_head.as_deref(), &mut codes),
            None => head_unconfirmed = body.evidence_journal_head.is_some(),
        }

        let status = if !codes.is_empty() {
            ReleaseStatus::Unverified
        } else if head_unconfirmed {
            codes.push(reason::EVIDENCE_HEAD_UNCONFIRMED);
            ReleaseStatus::Maybe
        } else {
            ReleaseStatus::Ok
        };

        let verdict = ReleaseVerdict {
            status,
            reason_codes: codes.into_vec(),
        };
        if verdict.is_ok() {
            info!("Release {} verified", manifest.release_id);
        } else {
            warn!(
                "Release {} not verified ({:?}): {:?}",
                manifest.release_id, verdict.status, verdict.reason_codes
            );
        }
        verdict
    }
}

/// Stable-sorted, deduplicated copy.
fn normalized(blocks: &[String]) -> Vec<&str> {
    let mut out: Vec<&str> = blocks.iter().map(String::as_str).collect();
    out.sort_unstable();
    out.dedup();
    out
}

fn check_path(input: &VerifyInput<'_>, expected_path: &str, codes: &mut ReasonCodes) {
    if input.manifest.manifest_body.path_digest != expected_path {
        codes.push(reason::RELEASE_PATHDIGEST_MISMATCH);
    }

    let Some(snapshot) = input.plan_snapshot else {
        codes.push(reason::PLAN_SNAPSHOT_MISSING);
        return;
    };
    if snapshot.plan_digest != input.expected_plan_digest {
        codes.push(reason::PLAN_SNAPSHOT_MISMATCH);
    }
    if snapshot.path_summary.graph_digest != snapshot.graph_digest {
        codes.push(reason::PATH_SUMMARY_INVALID);
    }
    match snapshot.path_summary.path_digest() {
        Ok(recomputed) if recomputed == expected_path => {}
        Ok(_) => codes.push(reason::PATH_DIGEST_MISMATCH),
        Err(_) => codes.push(reason::PATH_SUMMARY_INVALID),
    }
}

/// At least one signature must verify under an allowlisted key of the same,
/// known kind. Per-signature problems are only reported when none verifies.
fn check_signatures(input: &VerifyInput<'_>, codes: &mut ReasonCodes) {
    let manifest = input.manifest;
    if manifest.signatures.is_empty() {
        codes.push(reason::RELEASE_SIGNATURE_MISSING);
        codes.push(reason::RELEASE_SIGNATURE_BAD);
        return;
    }

    let mut problems = ReasonCodes::new();
    let mut verified = false;
    for sig in &manifest.signatures {
        let Some(key) = input.key_allowlist.get(&sig.key_id) else {
            problems.push(reason::RELEASE_KEY_UNKNOWN);
            continue;
        };
        if !input.crypto.supports(&sig.sig_kind) || key.sig_kind != sig.sig_kind {
            problems.push(reason::RELEASE_SIG_KIND_UNKNOWN);
            continue;
        }
        let (Some(public_key), Ok(sig_bytes)) = (key.public_key_bytes(), B64.decode(&sig.sig_b64))
        else {
            continue;
        };
        if input.crypto.verify(
            &sig.sig_kind,
            &public_key,
            manifest.release_id.as_bytes(),
            &sig_bytes,
        ) {
            verified = true;
            break;
        }
    }

    if !verified {
        codes.extend(problems.into_vec());
        codes.push(reason::RELEASE_SIGNATURE_BAD);
    }
}

fn check_evidence(bundle: &EvidenceBundle, declared_head: Option<&str>, codes: &mut ReasonCodes) {
    for record in &bundle.records {
        match record.envelope.evidence_id() {
            Ok(id) if id == record.evidence_id => {}
            _ => codes.push(reason::EVIDENCE_ID_MISMATCH),
        }
    }
    if let Some(declared) = declared_head {
        match bundle.journal_head() {
            Ok(Some(head)) if head == declared => {}
            _ => codes.push(reason::EVIDENCE_HEAD_MISMATCH),
        }
    }
}
