use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::executor::{ExecutorLimits, DEFAULT_TIMEOUT_MS};
use crate::kernel::DEFAULT_LEDGER_CAPACITY;
use crate::plan::ExecutionMode;
use crate::sandbox::SandboxLimits;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub run: RunConfig,
    #[serde(default)]
    pub caps: CapsConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ExecutorConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_fuel")]
    pub fuel: u64,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
    /// Run releases whose evidence head could not be confirmed
    #[serde(default)]
    pub tolerate_maybe: bool,
    #[serde(default = "default_ledger_capacity")]
    pub replay_ledger_capacity: usize,
    /// On-disk artifact store. In-memory when unset.
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            fuel: default_fuel(),
            max_memory_bytes: default_max_memory_bytes(),
            tolerate_maybe: false,
            replay_ledger_capacity: default_ledger_capacity(),
            artifact_dir: None,
        }
    }
}

/// Inputs of one run. Paths support ${ENV_VAR} substitution.
#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    /// Execution plan (JSON)
    pub plan: PathBuf,
    /// Release manifest (JSON)
    pub manifest: PathBuf,
    /// Trusted release keys (JSON, keyId -> key)
    pub keys: PathBuf,
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
    #[serde(default)]
    pub evidence: Option<PathBuf>,
    /// Block source (wasm or WAT). Read from the artifact store when unset.
    #[serde(default)]
    pub source: Option<PathBuf>,
    pub block_hash: String,
    pub expected_source_digest: String,
    #[serde(default)]
    pub expected_path_digest: Option<String>,
    /// Defaults to every node of the plan
    #[serde(default)]
    pub expected_blocks: Option<Vec<String>>,
    #[serde(default = "default_entry")]
    pub entry: String,
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CapsConfig {
    /// Capability ids the host implements
    #[serde(default)]
    pub known: Vec<String>,
    /// Kill switch: never authorized, even when granted
    #[serde(default)]
    pub disabled: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_fuel() -> u64 {
    SandboxLimits::default().fuel
}

fn default_max_memory_bytes() -> usize {
    SandboxLimits::default().max_memory_bytes
}

fn default_ledger_capacity() -> usize {
    DEFAULT_LEDGER_CAPACITY
}

fn default_entry() -> String {
    "main".to_string()
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Strict
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${WEFT_RELEASE_DIR}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    pub fn limits(&self) -> ExecutorLimits {
        ExecutorLimits {
            timeout_ms: self.executor.timeout_ms,
            sandbox: SandboxLimits {
                fuel: self.executor.fuel,
                max_memory_bytes: self.executor.max_memory_bytes,
            },
            tolerate_maybe: self.executor.tolerate_maybe,
        }
    }
}

impl CapsConfig {
    pub fn known_set(&self) -> BTreeSet<String> {
        self.known.iter().cloned().collect()
    }

    pub fn disabled_set(&self) -> BTreeSet<String> {
        self.disabled.iter().cloned().collect()
    }
}
