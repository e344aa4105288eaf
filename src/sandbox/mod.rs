//! Sandboxed compartments for untrusted blocks.
//!
//! The security model is layered:
//!
//! 1. Release gate: nothing launches unless the release verifies
//! 2. Self-test: the compartment proves only the mediated gate is reachable
//! 3. Capability kernel: every privileged call is checked against the binding
//! 4. Wasm runtime (wasmtime): fuel-metered, memory-capped, epoch-interruptible
//!
//! A [`SandboxLauncher`] starts one compartment per run and hands back a
//! [`SandboxControl`] for force-stop. All traffic from the compartment goes
//! through one authenticated [`channel`].

pub mod channel;
pub mod selftest;
pub mod wasm;

use async_trait::async_trait;
use thiserror::Error;

use crate::reason;

pub use channel::{
    channel_pair, BindingStamp, ChannelEnvelope, ChannelError, HostLink, HostMessage, Inbound,
    SurfaceReport, WorkerMessage, WorkerPort,
};
pub use wasm::WasmLauncher;

/// Resource limits applied to one compartment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub fuel: u64,
    pub max_memory_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            fuel: 1_000_000_000,
            max_memory_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Everything a launcher needs to start one compartment.
pub struct LaunchRequest {
    /// Verified block source, re-read from the artifact store.
    pub source: Vec<u8>,
    pub entry_export: String,
    pub limits: SandboxLimits,
    /// Sandbox end of the authenticated channel.
    pub port: WorkerPort,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// The isolation mechanism itself cannot be set up on this host.
    #[error("compartment unavailable: {0}")]
    Unavailable(String),
    #[error("invalid module: {0}")]
    InvalidModule(String),
    #[error("launch failed: {0}")]
    Launch(String),
}

impl SandboxError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            SandboxError::Unavailable(_) => reason::STRICT_COMPARTMENT_UNAVAILABLE,
            SandboxError::InvalidModule(_) | SandboxError::Launch(_) => {
                reason::STRICT_LAUNCH_FAILED
            }
        }
    }
}

/// Handle to a running compartment.
pub trait SandboxControl: Send + Sync {
    /// Force-stops the compartment. Idempotent.
    fn terminate(&self);
}

#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    fn name(&self) -> &str;

    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn SandboxControl>, SandboxError>;
}
