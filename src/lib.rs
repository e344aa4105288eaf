//! WeftEnd execution governance core.
//!
//! Untrusted blocks run only inside a sandbox whose sole route to privileged
//! operations is a capability kernel bound to one approved plan, one caller
//! and one session. Before anything launches, the release the block belongs to
//! is verified and the block bytes are pinned to their digest.

pub mod artifact;
pub mod canonical;
pub mod config;
pub mod executor;
pub mod kernel;
pub mod plan;
pub mod reason;
pub mod release;
pub mod sandbox;

pub use artifact::{ArtifactError, ArtifactStore};
pub use executor::{
    ExecutionOutcome, ExecutionReport, ExecutorLimits, FailureReport, StrictExecutor,
    StrictExecutorParts, TerminateHandle, Verdict,
};
pub use kernel::{CapDecision, CapKernel, InvocationMessage, KernelBinding};
pub use plan::{ExecutionMode, ExecutionPlan};
pub use release::{ReleaseStatus, ReleaseVerdict, ReleaseVerifier};
