//! Strict executor: one governed, sandboxed run of one block.
//!
//! ```text
//! release gate ─▶ source digest ─▶ artifact store ─▶ launch ─▶ self-test
//!                                                               │
//!            outcome ◀─ Done ◀─ kernel ◀─ Invoke ◀─ Start ◀─────┘
//! ```
//!
//! Nothing is launched unless the release verifies and the source bytes match
//! their pinned digest. The compartment talks to the host only through one
//! authenticated channel, and every privileged call it makes is decided by the
//! [`CapKernel`]. The run ends on `Done`, on any channel violation, on the
//! watchdog or on [`TerminateHandle::terminate`]; the compartment is
//! force-stopped on every path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::canonical::sha256_digest;
use crate::kernel::{CapDecision, CapKernel};
use crate::plan::ExecutionMode;
use crate::reason::{self, ReasonCodes};
use crate::release::{
    CryptoPort, EvidenceBundle, KeyAllowlist, PlanSnapshot, ReleaseManifest, ReleaseStatus,
    ReleaseVerifier, VerifyInput,
};
use crate::sandbox::selftest;
use crate::sandbox::{
    channel_pair, BindingStamp, ChannelError, HostLink, HostMessage, Inbound, LaunchRequest,
    SandboxControl, SandboxError, SandboxLauncher, SandboxLimits, WorkerMessage,
};

/// Watchdog budget when none is configured.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorLimits {
    pub timeout_ms: u64,
    pub sandbox: SandboxLimits,
    /// Accept a `MAYBE` release (evidence head declared but not supplied).
    pub tolerate_maybe: bool,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            sandbox: SandboxLimits::default(),
            tolerate_maybe: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Allow,
    Deny,
    Skip,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Verdict::Allow => "ALLOW",
            Verdict::Deny => "DENY",
            Verdict::Skip => "SKIP",
        })
    }
}

/// Kernel traffic seen during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvocationStats {
    pub allowed: u32,
    pub denied: u32,
}

/// A run that launched, passed self-test and whose entry returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub execution_mode: ExecutionMode,
    pub release_status: ReleaseStatus,
    /// Kernel denials raised during the run. Not fatal.
    pub reason_codes: Vec<String>,
    pub warnings: Vec<String>,
    pub invocations: InvocationStats,
    /// First result of the entry export, if it returned an integer.
    pub value: Option<i64>,
}

/// Why a run did not produce an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution {verdict}: {codes}", codes = .reason_codes.join(","))]
pub struct FailureReport {
    pub verdict: Verdict,
    pub execution_mode: ExecutionMode,
    pub reason_codes: Vec<String>,
    pub warnings: Vec<String>,
}

/// JSON summary of a run, as printed by the host runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub ok: bool,
    pub verdict: Verdict,
    pub execution_mode: ExecutionMode,
    pub reason_codes: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocations: Option<InvocationStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
}

impl From<&Result<ExecutionOutcome, FailureReport>> for ExecutionReport {
    fn from(result: &Result<ExecutionOutcome, FailureReport>) -> Self {
        match result {
            Ok(outcome) => Self {
                ok: true,
                verdict: Verdict::Allow,
                execution_mode: outcome.execution_mode,
                reason_codes: outcome.reason_codes.clone(),
                warnings: outcome.warnings.clone(),
                invocations: Some(outcome.invocations),
                value: outcome.value,
            },
            Err(failure) => Self {
                ok: false,
                verdict: failure.verdict,
                execution_mode: failure.execution_mode,
                reason_codes: failure.reason_codes.clone(),
                warnings: failure.warnings.clone(),
                invocations: None,
                value: None,
            },
        }
    }
}

/// Inputs of one strict run.
pub struct StrictExecutorParts {
    pub launcher: Arc<dyn SandboxLauncher>,
    pub kernel: CapKernel,
    /// Block source. When absent it is read from `artifacts`.
    pub source_text: Option<Vec<u8>>,
    pub entry_export: String,
    pub artifacts: Arc<ArtifactStore>,
    pub expected_source_digest: String,
    pub manifest: ReleaseManifest,
    pub expected_blocks: Vec<String>,
    pub expected_path_digest: Option<String>,
    pub key_allowlist: KeyAllowlist,
    pub crypto: Arc<dyn CryptoPort>,
    pub plan_snapshot: Option<PlanSnapshot>,
    pub evidence: Option<EvidenceBundle>,
    pub limits: ExecutorLimits,
}

#[derive(Default)]
struct TerminateState {
    requested: AtomicBool,
    notify: Notify,
    control: Mutex<Option<Box<dyn SandboxControl>>>,
}

impl TerminateState {
    fn request(&self) {
        if self.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Termination requested");
        self.notify.notify_one();
        self.stop_sandbox();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Attaches a freshly launched compartment. Stopped at once if
    /// termination was already requested.
    fn attach(&self, control: Box<dyn SandboxControl>) {
        if let Ok(mut slot) = self.control.lock() {
            *slot = Some(control);
        }
        if self.is_requested() {
            self.stop_sandbox();
        }
    }

    /// Force-stops and releases the compartment, if any. Runs at most once
    /// per compartment.
    fn stop_sandbox(&self) {
        let control = self.control.lock().ok().and_then(|mut slot| slot.take());
        if let Some(control) = control {
            control.terminate();
        }
    }
}

/// Cloneable handle that stops a run from anywhere.
#[derive(Clone)]
pub struct TerminateHandle(Arc<TerminateState>);

impl TerminateHandle {
    /// Idempotent. Safe before, during and after the run.
    pub fn terminate(&self) {
        self.0.request();
    }
}

/// Why the session loop stopped early.
#[derive(Debug)]
enum Stop {
    Untrusted(String),
    SelfTest(Vec<String>),
    Closed,
    Protocol(String),
    EntryFailed(String),
    Timeout,
    Terminated,
}

#[derive(Default)]
struct Session {
    stats: InvocationStats,
    denials: ReasonCodes,
}

impl Session {
    fn record(&mut self, decision: &CapDecision) {
        if decision.ok {
            self.stats.allowed += 1;
        } else {
            self.stats.denied += 1;
            if let Some(codes) = &decision.reason_codes {
                self.denials.extend(codes.iter().cloned());
            }
        }
    }
}

pub struct StrictExecutor {
    parts: StrictExecutorParts,
    state: Arc<TerminateState>,
    used: bool,
}

impl StrictExecutor {
    pub fn new(parts: StrictExecutorParts) -> Self {
        Self {
            parts,
            state: Arc::new(TerminateState::default()),
            used: false,
        }
    }

    pub fn handle(&self) -> TerminateHandle {
        TerminateHandle(self.state.clone())
    }

    /// Force-stops the run. Idempotent.
    pub fn terminate(&self) {
        self.state.request();
    }

    pub fn kernel(&self) -> &CapKernel {
        &self.parts.kernel
    }

    fn mode(&self) -> ExecutionMode {
        self.parts.kernel.binding().execution_mode
    }

    fn fail<I, S>(&self, verdict: Verdict, codes: I) -> FailureReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let reason_codes = ReasonCodes::from_iter(codes).into_vec();
        warn!("Run failed ({verdict}): {:?}", reason_codes);
        FailureReport {
            verdict,
            execution_mode: self.mode(),
            reason_codes,
            warnings: Vec::new(),
        }
    }

    pub async fn run(&mut self) -> Result<ExecutionOutcome, FailureReport> {
        if self.used {
            return Err(self.fail(Verdict::Deny, [reason::STRICT_PROTOCOL_VIOLATION]));
        }
        self.used = true;
        if self.state.is_requested() {
            return Err(self.fail(Verdict::Deny, [reason::STRICT_TERMINATED]));
        }

        let (release_status, warnings) = self.check_release()?;
        let source = self.load_source()?;

        let result = self.launch_and_drive(source).await;
        self.state.stop_sandbox();

        match result {
            Ok((value, session)) => {
                info!(
                    "Run finished: {} allowed, {} denied invocations",
                    session.stats.allowed, session.stats.denied
                );
                Ok(ExecutionOutcome {
                    execution_mode: self.mode(),
                    release_status,
                    reason_codes: session.denials.into_vec(),
                    warnings,
                    invocations: session.stats,
                    value,
                })
            }
            Err(failure) => Err(failure),
        }
    }

    fn check_release(&self) -> Result<(ReleaseStatus, Vec<String>), FailureReport> {
        let p = &self.parts;
        let verdict = ReleaseVerifier::verify(&VerifyInput {
            manifest: &p.manifest,
            expected_plan_digest: &p.kernel.binding().plan_digest,
            expected_blocks: &p.expected_blocks,
            expected_path_digest: p.expected_path_digest.as_deref(),
            plan_snapshot: p.plan_snapshot.as_ref(),
            evidence: p.evidence.as_ref(),
            key_allowlist: &p.key_allowlist,
            crypto: p.crypto.as_ref(),
        });

        match verdict.status {
            ReleaseStatus::Ok => Ok((verdict.status, Vec::new())),
            ReleaseStatus::Maybe if p.limits.tolerate_maybe => {
                warn!("Release accepted as MAYBE: {:?}", verdict.reason_codes);
                Ok((verdict.status, verdict.reason_codes))
            }
            ReleaseStatus::Maybe => {
                let mut codes = verdict.reason_codes;
                codes.push(reason::RELEASE_MAYBE_NOT_TOLERATED.to_string());
                Err(self.fail(Verdict::Deny, codes))
            }
            ReleaseStatus::Unverified => Err(self.fail(Verdict::Deny, verdict.reason_codes)),
        }
    }

    /// Pins the source to its digest and round-trips it through the store.
    fn load_source(&self) -> Result<Vec<u8>, FailureReport> {
        let p = &self.parts;
        let digest = &p.expected_source_digest;
        if let Some(source) = &p.source_text {
            let actual = sha256_digest(source);
            if &actual != digest {
                warn!("Source digest {actual} does not match pinned {digest}");
                return Err(self.fail(Verdict::Deny, [reason::ARTIFACT_DIGEST_MISMATCH]));
            }
            p.artifacts
                .put(digest, source)
                .map_err(|e| self.fail(Verdict::Deny, [e.reason_code()]))?;
        }
        p.artifacts
            .get(digest)
            .map_err(|e| self.fail(Verdict::Deny, [e.reason_code()]))
    }

    async fn launch_and_drive(
        &mut self,
        source: Vec<u8>,
    ) -> Result<(Option<i64>, Session), FailureReport> {
        let binding = self.parts.kernel.binding();
        let (mut link, port) = channel_pair(BindingStamp {
            plan_digest: binding.plan_digest.clone(),
            caller_block_hash: binding.caller_block_hash.clone(),
            session_nonce: binding.session_nonce.clone(),
            execution_mode: binding.execution_mode,
        });

        // Armed before launch so a stuck launch is still bounded.
        let state = self.state.clone();
        let watchdog = tokio::time::sleep(Duration::from_millis(self.parts.limits.timeout_ms));
        tokio::pin!(watchdog);

        let launcher = self.parts.launcher.clone();
        info!(
            "Launching block {} via {}",
            binding.caller_block_hash,
            launcher.name()
        );
        let request = LaunchRequest {
            source,
            entry_export: self.parts.entry_export.clone(),
            limits: self.parts.limits.sandbox,
            port,
        };
        let launched = tokio::select! {
            biased;
            _ = state.notify.notified() => Err(Stop::Terminated),
            _ = &mut watchdog => Err(Stop::Timeout),
            r = launcher.launch(request) => Ok(r),
        };
        match launched {
            Ok(Ok(control)) => self.state.attach(control),
            Ok(Err(SandboxError::Unavailable(detail))) => {
                warn!("Strict compartment unavailable: {detail}");
                return Err(FailureReport {
                    verdict: Verdict::Skip,
                    execution_mode: ExecutionMode::Compatible,
                    reason_codes: vec![reason::STRICT_COMPARTMENT_UNAVAILABLE.to_string()],
                    warnings: Vec::new(),
                });
            }
            Ok(Err(e)) => {
                warn!("Launch failed: {e}");
                return Err(self.fail(Verdict::Deny, [e.reason_code()]));
            }
            Err(stop) => {
                warn!("Launch did not complete: {stop:?}");
                return Err(self.stopped(stop, Session::default()));
            }
        }

        let mut session = Session::default();
        let result = tokio::select! {
            biased;
            _ = state.notify.notified() => Err(Stop::Terminated),
            _ = &mut watchdog => Err(Stop::Timeout),
            r = drive(&mut self.parts.kernel, &mut link, &mut session) => r,
        };
        drop(link);

        match result {
            Ok(value) => Ok((value, session)),
            Err(stop) => Err(self.stopped(stop, session)),
        }
    }

    fn stopped(&self, stop: Stop, session: Session) -> FailureReport {
        let mut codes = session.denials;
        let code = match stop {
            Stop::SelfTest(findings) => {
                let failures: Vec<String> =
                    findings.iter().map(|c| reason::selftest_failed(c)).collect();
                warn!("Self-test failed, downgrading: {:?}", failures);
                codes.extend(failures.iter().cloned());
                return FailureReport {
                    verdict: Verdict::Deny,
                    execution_mode: ExecutionMode::Compatible,
                    reason_codes: codes.into_vec(),
                    warnings: ReasonCodes::from_iter(failures).into_vec(),
                };
            }
            Stop::Untrusted(detail) => {
                warn!("Untrusted channel: {detail}");
                reason::UNTRUSTED_CHANNEL
            }
            Stop::Closed => reason::STRICT_CHANNEL_CLOSED,
            Stop::Protocol(detail) => {
                warn!("Protocol violation: {detail}");
                reason::STRICT_PROTOCOL_VIOLATION
            }
            Stop::EntryFailed(detail) => {
                warn!("Entry failed: {detail}");
                reason::STRICT_ENTRY_FAILED
            }
            Stop::Timeout => reason::STRICT_EXECUTION_TIMEOUT,
            Stop::Terminated => reason::STRICT_TERMINATED,
        };
        codes.push(code);
        self.fail(Verdict::Deny, codes.into_vec())
    }
}

impl Drop for StrictExecutor {
    fn drop(&mut self) {
        self.state.stop_sandbox();
    }
}

async fn next_inbound(link: &mut HostLink) -> Result<Inbound, Stop> {
    let envelope = link.recv().await.ok_or(Stop::Closed)?;
    link.open(&envelope).map_err(|e| match e {
        ChannelError::Untrusted(detail) => Stop::Untrusted(detail),
        ChannelError::Malformed(detail) => Stop::Protocol(detail),
        ChannelError::Closed => Stop::Closed,
    })
}

/// Session loop: self-test, start, then relay invocations until `Done`.
async fn drive(
    kernel: &mut CapKernel,
    link: &mut HostLink,
    session: &mut Session,
) -> Result<Option<i64>, Stop> {
    match next_inbound(link).await? {
        Inbound::Message(WorkerMessage::SelfTest(report)) => {
            let findings = selftest::evaluate(&report);
            if !findings.is_empty() {
                return Err(Stop::SelfTest(findings));
            }
            debug!("Self-test passed: {:?}", report.guest_imports);
        }
        other => return Err(Stop::Protocol(format!("expected self-test, got {other:?}"))),
    }
    link.send(HostMessage::Start).await.map_err(|_| Stop::Closed)?;

    loop {
        match next_inbound(link).await? {
            Inbound::Message(WorkerMessage::Invoke(msg)) => {
                let decision = kernel.handle_invoke(&msg);
                session.record(&decision);
                link.send(HostMessage::Decision {
                    req_id: msg.req_id,
                    decision,
                })
                .await
                .map_err(|_| Stop::Closed)?;
            }
            Inbound::MalformedInvoke { req_id, raw } => {
                let decision = kernel.handle_raw(&raw);
                session.record(&decision);
                // Without a readable reqId there is nobody to answer.
                let Some(req_id) = req_id else {
                    return Err(Stop::Protocol("invoke without a readable reqId".to_string()));
                };
                link.send(HostMessage::Decision { req_id, decision })
                    .await
                    .map_err(|_| Stop::Closed)?;
            }
            Inbound::Message(WorkerMessage::Done { ok: true, value, .. }) => return Ok(value),
            Inbound::Message(WorkerMessage::Done { error, .. }) => {
                return Err(Stop::EntryFailed(error.unwrap_or_default()))
            }
            Inbound::Message(WorkerMessage::SelfTest(_)) => {
                return Err(Stop::Protocol("self-test after start".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use base64::Engine;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;

    use super::*;
    use crate::kernel::{InvocationMessage, KernelBinding};
    use crate::plan::CapabilityRequest;
    use crate::release::{
        Ed25519Port, EvidenceEnvelope, EvidenceRecord, ManifestBody, PathSummary,
        ReleaseSignature, RELEASE_SCHEMA, SIG_KIND_ED25519,
    };
    use crate::sandbox::selftest::CAP_INVOKE_EXPORT;
    use crate::sandbox::{ChannelEnvelope, SurfaceReport, WasmLauncher};

    const SOURCE: &[u8] = b"(module (func (export \"main\")))";

    const INVOKE_WAT: &str = r#"
        (module
          (import "weft" "cap_invoke" (func $cap (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "{\"capId\":\"net.fetch\"}")
          (func (export "main") (result i32)
            (call $cap (i32.const 0) (i32.const 21) (i32.const 1024) (i32.const 256))))
    "#;

    const WASI_WAT: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "fd_write"
            (func (param i32 i32 i32 i32) (result i32)))
          (func (export "main")))
    "#;

    /// One step of a scripted compartment.
    #[derive(Clone)]
    enum Step {
        SelfTest(SurfaceReport),
        WaitStart,
        Invoke(&'static str),
        /// Sends a hand-built invocation, bypassing the binding stamp.
        InvokeRaw(InvocationMessage),
        /// Sends an authenticated but arbitrary payload.
        SendRaw(&'static [u8]),
        Forge,
        Hang,
        Done(Result<Option<i64>, &'static str>),
    }

    #[derive(Default)]
    struct Recorder {
        launches: AtomicUsize,
        terminations: AtomicUsize,
        started: AtomicBool,
        decisions: Mutex<Vec<CapDecision>>,
    }

    struct ScriptedLauncher {
        steps: Vec<Step>,
        unavailable: bool,
        recorder: Arc<Recorder>,
    }

    struct ScriptedControl {
        recorder: Arc<Recorder>,
        stop: Arc<AtomicBool>,
    }

    impl SandboxControl for ScriptedControl {
        fn terminate(&self) {
            self.recorder.terminations.fetch_add(1, Ordering::SeqCst);
            self.stop.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SandboxLauncher for ScriptedLauncher {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn launch(
            &self,
            request: LaunchRequest,
        ) -> Result<Box<dyn SandboxControl>, SandboxError> {
            self.recorder.launches.fetch_add(1, Ordering::SeqCst);
            if self.unavailable {
                return Err(SandboxError::Unavailable("no isolation on this host".to_string()));
            }
            let steps = self.steps.clone();
            let recorder = self.recorder.clone();
            let stop = Arc::new(AtomicBool::new(false));
            let worker_stop = stop.clone();
            let mut port = request.port;
            std::thread::spawn(move || {
                for step in steps {
                    let ok = match step {
                        Step::SelfTest(report) => port.send(&WorkerMessage::SelfTest(report)).is_ok(),
                        Step::WaitStart => {
                            let started = port.wait_for_start().is_ok();
                            recorder.started.store(started, Ordering::SeqCst);
                            started
                        }
                        Step::Invoke(cap_id) => match port.invoke(CapabilityRequest {
                            cap_id: cap_id.to_string(),
                            params: None,
                        }) {
                            Ok(decision) => {
                                recorder.decisions.lock().unwrap().push(decision);
                                true
                            }
                            Err(_) => false,
                        },
                        Step::InvokeRaw(msg) => {
                            let req_id = msg.req_id.clone();
                            port.send(&WorkerMessage::Invoke(msg)).is_ok()
                                && match port.wait_for_decision(&req_id) {
                                    Ok(decision) => {
                                        recorder.decisions.lock().unwrap().push(decision);
                                        true
                                    }
                                    Err(_) => false,
                                }
                        }
                        Step::SendRaw(payload) => port.send_payload(payload.to_vec()).is_ok(),
                        Step::Forge => port
                            .raw_sender()
                            .blocking_send(ChannelEnvelope {
                                channel_id: "forged".to_string(),
                                seq: 0,
                                payload: br#"{"kind":"done","ok":true}"#.to_vec(),
                                tag: vec![0u8; 32],
                            })
                            .is_ok(),
                        Step::Hang => {
                            while !worker_stop.load(Ordering::SeqCst) {
                                std::thread::sleep(Duration::from_millis(5));
                            }
                            false
                        }
                        Step::Done(result) => {
                            let msg = match result {
                                Ok(value) => WorkerMessage::Done {
                                    ok: true,
                                    error: None,
                                    value,
                                },
                                Err(error) => WorkerMessage::Done {
                                    ok: false,
                                    error: Some(error.to_string()),
                                    value: None,
                                },
                            };
                            port.send(&msg).is_ok()
                        }
                    };
                    if !ok {
                        break;
                    }
                }
            });
            Ok(Box::new(ScriptedControl { recorder: self.recorder.clone(), stop }))
        }
    }

    /// A launcher whose launch never completes.
    struct StuckLauncher;

    #[async_trait]
    impl SandboxLauncher for StuckLauncher {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn launch(
            &self,
            _request: LaunchRequest,
        ) -> Result<Box<dyn SandboxControl>, SandboxError> {
            std::future::pending().await
        }
    }

    fn clean_surface() -> SurfaceReport {
        SurfaceReport {
            host_exports: vec![CAP_INVOKE_EXPORT.to_string()],
            guest_imports: vec![CAP_INVOKE_EXPORT.to_string()],
        }
    }

    fn happy_script() -> Vec<Step> {
        vec![
            Step::SelfTest(clean_surface()),
            Step::WaitStart,
            Step::Invoke("net.fetch"),
            Step::Invoke("storage.read"),
            Step::Done(Ok(Some(7))),
        ]
    }

    fn caps(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn kernel() -> CapKernel {
        CapKernel::new(KernelBinding {
            plan_digest: "plan-1".to_string(),
            caller_block_hash: "block-1".to_string(),
            execution_mode: ExecutionMode::Strict,
            session_nonce: "nonce-1".to_string(),
            granted_caps: caps(&["net.fetch"]),
            known_caps: caps(&["net.fetch", "storage.read"]),
            disabled_caps: caps(&[]),
        })
        .unwrap()
    }

    fn evidence() -> EvidenceBundle {
        let envelope = EvidenceEnvelope {
            kind: "attestation".to_string(),
            subject: "block:block-1".to_string(),
            payload: json!({"status": "active"}),
        };
        EvidenceBundle {
            records: vec![EvidenceRecord {
                evidence_id: envelope.evidence_id().unwrap(),
                envelope,
            }],
        }
    }

    fn snapshot() -> PlanSnapshot {
        PlanSnapshot {
            plan_digest: "plan-1".to_string(),
            graph_digest: "graph-1".to_string(),
            path_summary: PathSummary {
                schema: "weftend.path/0".to_string(),
                graph_digest: "graph-1".to_string(),
                anchors: vec!["anchor-a".to_string()],
            },
        }
    }

    fn signed_manifest() -> ReleaseManifest {
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let body = ManifestBody {
            plan_digest: "plan-1".to_string(),
            policy_digest: "policy-1".to_string(),
            blocks: vec!["block-1".to_string()],
            evidence_journal_head: evidence().journal_head().unwrap(),
            path_digest: snapshot().path_summary.path_digest().unwrap(),
        };
        let release_id = body.release_id().unwrap();
        let sig = key.sign(release_id.as_bytes());
        ReleaseManifest {
            schema: RELEASE_SCHEMA.to_string(),
            release_id,
            manifest_body: body,
            signatures: vec![ReleaseSignature {
                sig_kind: SIG_KIND_ED25519.to_string(),
                key_id: "k1".to_string(),
                sig_b64: base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()),
            }],
        }
    }

    fn parts(steps: Vec<Step>, recorder: Arc<Recorder>) -> StrictExecutorParts {
        let mut allowlist = KeyAllowlist::new();
        allowlist.insert(
            "k1",
            SIG_KIND_ED25519,
            SigningKey::from_bytes(&[42u8; 32]).verifying_key().as_bytes(),
        );
        StrictExecutorParts {
            launcher: Arc::new(ScriptedLauncher {
                steps,
                unavailable: false,
                recorder,
            }),
            kernel: kernel(),
            source_text: Some(SOURCE.to_vec()),
            entry_export: "main".to_string(),
            artifacts: Arc::new(ArtifactStore::in_memory("plan-1", "block-1")),
            expected_source_digest: sha256_digest(SOURCE),
            manifest: signed_manifest(),
            expected_blocks: vec!["block-1".to_string()],
            expected_path_digest: Some(snapshot().path_summary.path_digest().unwrap()),
            key_allowlist: allowlist,
            crypto: Arc::new(Ed25519Port),
            plan_snapshot: Some(snapshot()),
            evidence: Some(evidence()),
            limits: ExecutorLimits {
                timeout_ms: 5_000,
                ..ExecutorLimits::default()
            },
        }
    }

    #[tokio::test]
    async fn test_happy_path_relays_decisions() {
        let recorder = Arc::new(Recorder::default());
        let mut executor = StrictExecutor::new(parts(happy_script(), recorder.clone()));
        let outcome = executor.run().await.unwrap();

        assert_eq!(outcome.execution_mode, ExecutionMode::Strict);
        assert_eq!(outcome.release_status, ReleaseStatus::Ok);
        assert_eq!(outcome.value, Some(7));
        assert_eq!(outcome.reason_codes, vec!["CAP_NOT_GRANTED"]);
        assert_eq!(outcome.invocations, InvocationStats { allowed: 1, denied: 1 });

        let decisions = recorder.decisions.lock().unwrap().clone();
        assert_eq!(decisions.len(), 2);
        assert!(decisions[0].ok);
        assert!(decisions[1].has_reason("CAP_NOT_GRANTED"));
        assert_eq!(recorder.terminations.load(Ordering::SeqCst), 1);
        assert_eq!(executor.kernel().ledger_len(), 2);
    }

    #[tokio::test]
    async fn test_release_failure_never_launches() {
        let recorder = Arc::new(Recorder::default());
        let mut p = parts(happy_script(), recorder.clone());
        p.expected_blocks = vec!["block-9".to_string()];
        let failure = StrictExecutor::new(p).run().await.unwrap_err();

        assert_eq!(failure.verdict, Verdict::Deny);
        assert_eq!(failure.reason_codes, vec!["RELEASE_BLOCKSET_MISMATCH"]);
        assert_eq!(recorder.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_maybe_release_needs_tolerance() {
        let recorder = Arc::new(Recorder::default());
        let mut p = parts(happy_script(), recorder.clone());
        p.evidence = None;
        let failure = StrictExecutor::new(p).run().await.unwrap_err();
        assert_eq!(
            failure.reason_codes,
            vec!["EVIDENCE_HEAD_UNCONFIRMED", "RELEASE_MAYBE_NOT_TOLERATED"]
        );
        assert_eq!(recorder.launches.load(Ordering::SeqCst), 0);

        let mut p = parts(happy_script(), recorder.clone());
        p.evidence = None;
        p.limits.tolerate_maybe = true;
        let outcome = StrictExecutor::new(p).run().await.unwrap();
        assert_eq!(outcome.release_status, ReleaseStatus::Maybe);
        assert_eq!(outcome.warnings, vec!["EVIDENCE_HEAD_UNCONFIRMED"]);
    }

    #[tokio::test]
    async fn test_source_digest_mismatch() {
        let recorder = Arc::new(Recorder::default());
        let mut p = parts(happy_script(), recorder.clone());
        p.source_text = Some(b"(module)".to_vec());
        let failure = StrictExecutor::new(p).run().await.unwrap_err();
        assert_eq!(failure.reason_codes, vec!["ARTIFACT_DIGEST_MISMATCH"]);
        assert_eq!(recorder.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_source_from_store() {
        let recorder = Arc::new(Recorder::default());
        let mut p = parts(happy_script(), recorder.clone());
        p.source_text = None;
        let failure = StrictExecutor::new(p).run().await.unwrap_err();
        assert_eq!(failure.reason_codes, vec!["ARTIFACT_MISSING"]);

        let mut p = parts(happy_script(), recorder.clone());
        p.source_text = None;
        p.artifacts.put(&sha256_digest(SOURCE), SOURCE).unwrap();
        assert!(StrictExecutor::new(p).run().await.is_ok());
    }

    #[tokio::test]
    async fn test_forged_frame_is_untrusted() {
        let recorder = Arc::new(Recorder::default());
        let mut executor = StrictExecutor::new(parts(vec![Step::Forge], recorder.clone()));
        let failure = executor.run().await.unwrap_err();
        assert_eq!(failure.verdict, Verdict::Deny);
        assert_eq!(failure.reason_codes, vec!["UNTRUSTED_CHANNEL"]);
        assert_eq!(recorder.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_selftest_failure_downgrades_and_never_starts() {
        let recorder = Arc::new(Recorder::default());
        let script = vec![
            Step::SelfTest(SurfaceReport {
                host_exports: vec![CAP_INVOKE_EXPORT.to_string()],
                guest_imports: vec!["wasi_snapshot_preview1::sock_open".to_string()],
            }),
            Step::WaitStart,
            Step::Done(Ok(None)),
        ];
        let failure = StrictExecutor::new(parts(script, recorder.clone()))
            .run()
            .await
            .unwrap_err();

        assert_eq!(failure.verdict, Verdict::Deny);
        assert_eq!(failure.execution_mode, ExecutionMode::Compatible);
        let expected = vec![
            "STRICT_SELFTEST_FAILED:IMPORT_UNRESOLVED",
            "STRICT_SELFTEST_FAILED:NET_REACHABLE",
        ];
        assert_eq!(failure.reason_codes, expected);
        assert_eq!(failure.warnings, expected);
        assert!(!recorder.started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unavailable_compartment_is_skip() {
        let recorder = Arc::new(Recorder::default());
        let mut p = parts(happy_script(), recorder.clone());
        p.launcher = Arc::new(ScriptedLauncher {
            steps: vec![],
            unavailable: true,
            recorder: recorder.clone(),
        });
        let failure = StrictExecutor::new(p).run().await.unwrap_err();
        assert_eq!(failure.verdict, Verdict::Skip);
        assert_eq!(failure.execution_mode, ExecutionMode::Compatible);
        assert_eq!(failure.reason_codes, vec!["STRICT_COMPARTMENT_UNAVAILABLE"]);
    }

    #[tokio::test]
    async fn test_watchdog_stops_hung_compartment() {
        let recorder = Arc::new(Recorder::default());
        let mut p = parts(
            vec![Step::SelfTest(clean_surface()), Step::WaitStart, Step::Hang],
            recorder.clone(),
        );
        p.limits.timeout_ms = 50;
        let failure = StrictExecutor::new(p).run().await.unwrap_err();
        assert_eq!(failure.reason_codes, vec!["STRICT_EXECUTION_TIMEOUT"]);
        assert_eq!(recorder.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminate_mid_run_is_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let mut executor = StrictExecutor::new(parts(
            vec![Step::SelfTest(clean_surface()), Step::WaitStart, Step::Hang],
            recorder.clone(),
        ));
        let handle = executor.handle();
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.terminate();
            handle.terminate();
        };
        let (result, ()) = tokio::join!(executor.run(), stopper);

        assert_eq!(result.unwrap_err().reason_codes, vec!["STRICT_TERMINATED"]);
        executor.terminate();
        assert_eq!(recorder.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminate_before_run() {
        let recorder = Arc::new(Recorder::default());
        let mut executor = StrictExecutor::new(parts(happy_script(), recorder.clone()));
        executor.terminate();
        let failure = executor.run().await.unwrap_err();
        assert_eq!(failure.reason_codes, vec!["STRICT_TERMINATED"]);
        assert_eq!(recorder.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unstamped_invocation_is_denied_not_fatal() {
        let recorder = Arc::new(Recorder::default());
        let spoofed = InvocationMessage {
            req_id: "spoof-1".to_string(),
            cap_id: "net.fetch".to_string(),
            execution_mode: ExecutionMode::Strict,
            plan_digest: "plan-1".to_string(),
            session_nonce: "nonce-bad".to_string(),
            caller_block_hash: "block-OTHER".to_string(),
            params: None,
        };
        let script = vec![
            Step::SelfTest(clean_surface()),
            Step::WaitStart,
            Step::InvokeRaw(spoofed),
            Step::Done(Ok(None)),
        ];
        let outcome = StrictExecutor::new(parts(script, recorder.clone()))
            .run()
            .await
            .unwrap();
        assert_eq!(outcome.reason_codes, vec!["CALLER_MISMATCH", "NONCE_MISMATCH"]);
        assert_eq!(outcome.invocations, InvocationStats { allowed: 0, denied: 1 });
        assert!(!recorder.decisions.lock().unwrap()[0].ok);
    }

    #[tokio::test]
    async fn test_entry_failure() {
        let recorder = Arc::new(Recorder::default());
        let script = vec![
            Step::SelfTest(clean_surface()),
            Step::WaitStart,
            Step::Invoke("storage.read"),
            Step::Done(Err("unreachable")),
        ];
        let failure = StrictExecutor::new(parts(script, recorder))
            .run()
            .await
            .unwrap_err();
        assert_eq!(
            failure.reason_codes,
            vec!["CAP_NOT_GRANTED", "STRICT_ENTRY_FAILED"]
        );
    }

    #[tokio::test]
    async fn test_compartment_vanishing_closes_channel() {
        let recorder = Arc::new(Recorder::default());
        let failure = StrictExecutor::new(parts(vec![Step::SelfTest(clean_surface())], recorder))
            .run()
            .await
            .unwrap_err();
        assert_eq!(failure.reason_codes, vec!["STRICT_CHANNEL_CLOSED"]);
    }

    #[tokio::test]
    async fn test_second_run_is_refused() {
        let recorder = Arc::new(Recorder::default());
        let mut executor = StrictExecutor::new(parts(happy_script(), recorder.clone()));
        assert!(executor.run().await.is_ok());
        let again = executor.run().await.unwrap_err();
        assert_eq!(again.reason_codes, vec!["STRICT_PROTOCOL_VIOLATION"]);
        assert_eq!(recorder.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watchdog_covers_stuck_launch() {
        let mut p = parts(vec![], Arc::new(Recorder::default()));
        p.launcher = Arc::new(StuckLauncher);
        p.limits.timeout_ms = 50;
        let failure = tokio::time::timeout(Duration::from_secs(2), StrictExecutor::new(p).run())
            .await
            .expect("run must settle")
            .unwrap_err();
        assert_eq!(failure.reason_codes, vec!["STRICT_EXECUTION_TIMEOUT"]);
    }

    #[tokio::test]
    async fn test_terminate_during_launch() {
        let mut p = parts(vec![], Arc::new(Recorder::default()));
        p.launcher = Arc::new(StuckLauncher);
        let mut executor = StrictExecutor::new(p);
        let handle = executor.handle();
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.terminate();
        };
        let (result, ()) = tokio::time::timeout(
            Duration::from_secs(2),
            async { tokio::join!(executor.run(), stopper) },
        )
        .await
        .expect("run must settle");
        assert_eq!(result.unwrap_err().reason_codes, vec!["STRICT_TERMINATED"]);
    }

    #[tokio::test]
    async fn test_invoke_without_req_id_ends_run() {
        let recorder = Arc::new(Recorder::default());
        let script = vec![
            Step::SelfTest(clean_surface()),
            Step::WaitStart,
            Step::SendRaw(br#"{"kind":"invoke","capId":"net.fetch"}"#),
            Step::Hang,
        ];
        let failure = StrictExecutor::new(parts(script, recorder.clone()))
            .run()
            .await
            .unwrap_err();
        assert_eq!(
            failure.reason_codes,
            vec!["INVOKE_SHAPE_INVALID", "STRICT_PROTOCOL_VIOLATION"]
        );
        assert_eq!(recorder.terminations.load(Ordering::SeqCst), 1);
    }

    fn wasm_parts(wat: &str) -> StrictExecutorParts {
        let mut p = parts(vec![], Arc::new(Recorder::default()));
        p.launcher = Arc::new(WasmLauncher::new());
        p.source_text = Some(wat.as_bytes().to_vec());
        p.expected_source_digest = sha256_digest(wat.as_bytes());
        p
    }

    #[tokio::test]
    async fn test_wasm_guest_invocation_reaches_kernel() {
        let mut executor = StrictExecutor::new(wasm_parts(INVOKE_WAT));
        let outcome = executor.run().await.unwrap();

        assert_eq!(outcome.execution_mode, ExecutionMode::Strict);
        assert_eq!(outcome.value, Some(1));
        assert_eq!(outcome.invocations, InvocationStats { allowed: 1, denied: 0 });
        assert!(outcome.reason_codes.is_empty());
        assert_eq!(executor.kernel().ledger_len(), 1);
    }

    #[tokio::test]
    async fn test_wasm_guest_importing_wasi_is_downgraded() {
        let failure = StrictExecutor::new(wasm_parts(WASI_WAT))
            .run()
            .await
            .unwrap_err();
        let expected = vec![
            "STRICT_SELFTEST_FAILED:FS_REACHABLE",
            "STRICT_SELFTEST_FAILED:IMPORT_UNRESOLVED",
        ];
        assert_eq!(failure.verdict, Verdict::Deny);
        assert_eq!(failure.execution_mode, ExecutionMode::Compatible);
        assert_eq!(failure.reason_codes, expected);
        assert_eq!(failure.warnings, expected);
    }

    #[test]
    fn test_report_json_shape() {
        let failure: Result<ExecutionOutcome, FailureReport> = Err(FailureReport {
            verdict: Verdict::Skip,
            execution_mode: ExecutionMode::Compatible,
            reason_codes: vec!["STRICT_COMPARTMENT_UNAVAILABLE".to_string()],
            warnings: vec![],
        });
        assert_eq!(
            serde_json::to_string(&ExecutionReport::from(&failure)).unwrap(),
            r#"{"ok":false,"verdict":"SKIP","executionMode":"compatible","reasonCodes":["STRICT_COMPARTMENT_UNAVAILABLE"],"warnings":[]}"#
        );
    }
}
