use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::RngCore;
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weftend::artifact::{ArtifactStore, DirBackend};
use weftend::config::Config;
use weftend::executor::{ExecutionReport, StrictExecutor, StrictExecutorParts, Verdict};
use weftend::kernel::{CapKernel, KernelBinding};
use weftend::plan::ExecutionPlan;
use weftend::release::{Ed25519Port, EvidenceBundle, KeyAllowlist, PlanSnapshot, ReleaseManifest};
use weftend::sandbox::WasmLauncher;

fn print_help() {
    println!(
        "\
weftend v{}

Runs one block of an approved plan inside a strict wasm compartment.

USAGE:
    weftend [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/weftend.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, weftend=debug,warn)

EXIT STATUS:
    0    ALLOW: release verified, self-test passed, entry returned
    1    DENY
    2    SKIP: no strict compartment on this host

EXAMPLES:
    weftend                              # uses config/weftend.toml
    weftend /etc/weftend/run.toml        # custom config path
    RUST_LOG=debug weftend               # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&content).with_context(|| format!("parsing {}", path.display()))
}

fn session_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("weftend v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr; stdout carries the report
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weftend=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/weftend.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;
    let run = &config.run;

    let plan: ExecutionPlan = read_json(&run.plan)?;
    let manifest: ReleaseManifest = read_json(&run.manifest)?;
    let key_allowlist: KeyAllowlist = read_json(&run.keys)?;
    let plan_snapshot: Option<PlanSnapshot> =
        run.snapshot.as_deref().map(read_json).transpose()?;
    let evidence: Option<EvidenceBundle> = run.evidence.as_deref().map(read_json).transpose()?;
    let source_text = match &run.source {
        Some(path) => {
            Some(std::fs::read(path).with_context(|| format!("reading {}", path.display()))?)
        }
        None => None,
    };

    info!(
        "Plan {} ({} nodes), release {}",
        plan.plan_digest,
        plan.nodes.len(),
        manifest.release_id
    );
    info!("Trusted release keys: {}", key_allowlist.len());

    let binding = KernelBinding::from_plan(
        &plan,
        &run.block_hash,
        &session_nonce(),
        run.mode,
        config.caps.known_set(),
        config.caps.disabled_set(),
    )?;
    let kernel =
        CapKernel::with_ledger_capacity(binding, config.executor.replay_ledger_capacity)?;

    let artifacts = match &config.executor.artifact_dir {
        Some(dir) => {
            info!("Artifact store: {}", dir.display());
            ArtifactStore::with_backend(
                &plan.plan_digest,
                &run.block_hash,
                Box::new(DirBackend::open(dir)?),
            )
        }
        None => ArtifactStore::in_memory(&plan.plan_digest, &run.block_hash),
    };

    let expected_blocks = run
        .expected_blocks
        .clone()
        .unwrap_or_else(|| plan.nodes.iter().map(|n| n.node_id.clone()).collect());

    let mut executor = StrictExecutor::new(StrictExecutorParts {
        launcher: Arc::new(WasmLauncher::new()),
        kernel,
        source_text,
        entry_export: run.entry.clone(),
        artifacts: Arc::new(artifacts),
        expected_source_digest: run.expected_source_digest.clone(),
        manifest,
        expected_blocks,
        expected_path_digest: run.expected_path_digest.clone(),
        key_allowlist,
        crypto: Arc::new(Ed25519Port),
        plan_snapshot,
        evidence,
        limits: config.limits(),
    });

    // Ctrl-C force-stops the compartment; the run still reports
    let handle = executor.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, terminating sandbox");
            handle.terminate();
        }
    });

    let result = executor.run().await;
    let report = ExecutionReport::from(&result);
    println!("{}", serde_json::to_string_pretty(&report)?);

    let code = match report.verdict {
        Verdict::Allow => 0,
        Verdict::Deny => 1,
        Verdict::Skip => 2,
    };
    info!("Verdict: {}", report.verdict);
    std::process::exit(code);
}
