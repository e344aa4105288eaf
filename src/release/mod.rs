//! Release provenance verification.
//!
//! Nothing runs in the sandbox until the release manifest it came from has
//! been checked against the plan it claims to implement:
//!
//! 1. Manifest shape and `releaseId` (canonical hash of the body)
//! 2. Plan digest and block set binding
//! 3. Path digest, recomputed from the plan snapshot
//! 4. At least one signature from an allowlisted key
//! 5. Evidence record ids and the evidence journal head

pub mod crypto;
pub mod manifest;
pub mod verifier;

pub use crypto::{AllowedKey, CryptoPort, Ed25519Port, KeyAllowlist, SIG_KIND_ED25519};
pub use manifest::{
    EvidenceBundle, EvidenceEnvelope, EvidenceRecord, ManifestBody, PathSummary, PlanSnapshot,
    ReleaseManifest, ReleaseSignature, RELEASE_SCHEMA,
};
pub use verifier::{ReleaseStatus, ReleaseVerdict, ReleaseVerifier, VerifyInput};
