//! WebAssembly compartment backed by wasmtime.
//!
//! Each launch gets its own engine, so force-stop (an epoch bump) only ever
//! reaches one compartment. The guest sees a single import:
//!
//! ```text
//! weft.cap_invoke(req_ptr, req_len, out_ptr, out_cap) -> i32
//! ```
//!
//! `req` is a JSON `CapabilityRequest`. The host stamps the binding, asks the
//! kernel over the channel and writes the decision JSON to `out_ptr` when it
//! fits in `out_cap` bytes. Returns 1 if allowed, 0 if denied and -1 if the
//! request could not be read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use wasmtime::{
    Caller, Config, Engine, Extern, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
    Val,
};

use super::channel::{SurfaceReport, WorkerMessage, WorkerPort};
use super::{LaunchRequest, SandboxControl, SandboxError, SandboxLauncher, SandboxLimits};
use crate::plan::CapabilityRequest;

/// `Done.error` when the compartment was force-stopped.
pub const EXIT_TERMINATED: &str = "terminated";
/// `Done.error` when the fuel budget ran out.
pub const EXIT_FUEL_EXHAUSTED: &str = "fuel exhausted";

const CAP_INVOKE_MODULE: &str = "weft";
const CAP_INVOKE_NAME: &str = "cap_invoke";

const INVOKE_ALLOWED: i32 = 1;
const INVOKE_DENIED: i32 = 0;
const INVOKE_MALFORMED: i32 = -1;

/// Upper bound on one request read from guest memory.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct WasmLauncher;

impl WasmLauncher {
    pub fn new() -> Self {
        Self
    }

    fn engine() -> Result<Engine, SandboxError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        config.wasm_simd(false);
        config.wasm_relaxed_simd(false);
        config.wasm_multi_memory(false);
        config.wasm_memory64(false);
        config.wasm_threads(false);
        Engine::new(&config).map_err(|e| SandboxError::Unavailable(format!("engine init failed: {e}")))
    }
}

#[async_trait]
impl SandboxLauncher for WasmLauncher {
    fn name(&self) -> &str {
        "wasmtime"
    }

    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn SandboxControl>, SandboxError> {
        if request.source.is_empty() {
            return Err(SandboxError::InvalidModule("module is empty".to_string()));
        }
        if request.limits.fuel == 0 {
            return Err(SandboxError::Launch("fuel budget must be > 0".to_string()));
        }

        let engine = Self::engine()?;
        let source = request.source;
        let compile_engine = engine.clone();
        let module = tokio::task::spawn_blocking(move || Module::new(&compile_engine, &source))
            .await
            .map_err(|e| SandboxError::Launch(e.to_string()))?
            .map_err(|e| SandboxError::InvalidModule(e.to_string()))?;

        let control = WasmControl {
            engine: engine.clone(),
            terminated: Arc::new(AtomicBool::new(false)),
        };
        let terminated = control.terminated.clone();
        let entry = request.entry_export;
        let limits = request.limits;
        let port = request.port;

        info!("Launching wasm compartment (entry: {entry})");
        tokio::task::spawn_blocking(move || {
            run_compartment(engine, module, port, &entry, limits, &terminated)
        });

        Ok(Box::new(control))
    }
}

struct WasmControl {
    engine: Engine,
    terminated: Arc<AtomicBool>,
}

impl SandboxControl for WasmControl {
    fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            debug!("Interrupting wasm compartment");
            self.engine.increment_epoch();
        }
    }
}

struct CompartmentState {
    port: WorkerPort,
    limits: StoreLimits,
}

/// Body of the compartment thread. Every exit path is reported to the host as
/// a message, or the port is dropped and the host sees the channel close.
fn run_compartment(
    engine: Engine,
    module: Module,
    port: WorkerPort,
    entry: &str,
    limits: SandboxLimits,
    terminated: &AtomicBool,
) {
    let mut store = Store::new(
        &engine,
        CompartmentState {
            port,
            limits: StoreLimitsBuilder::new()
                .memory_size(limits.max_memory_bytes)
                .build(),
        },
    );
    store.limiter(|state| &mut state.limits);
    store.set_epoch_deadline(1);

    let linker = match compartment_linker(&engine) {
        Ok(linker) => linker,
        Err(e) => {
            warn!("Linker setup failed: {e}");
            return;
        }
    };

    let surface = exposed_surface(&linker, &mut store, &module);
    if store.data_mut().port.send(&WorkerMessage::SelfTest(surface)).is_err() {
        return;
    }
    if let Err(e) = store.data_mut().port.wait_for_start() {
        debug!("Compartment not started: {e}");
        return;
    }

    let result = if terminated.load(Ordering::SeqCst) {
        Err(EXIT_TERMINATED.to_string())
    } else {
        store
            .set_fuel(limits.fuel)
            .map_err(|e| e.to_string())
            .and_then(|()| call_entry(&linker, &module, &mut store, entry))
    };

    let done = match result {
        Ok(value) => WorkerMessage::Done {
            ok: true,
            error: None,
            value,
        },
        Err(error) => {
            warn!("Compartment entry failed: {error}");
            WorkerMessage::Done {
                ok: false,
                error: Some(error),
                value: None,
            }
        }
    };
    let _ = store.data_mut().port.send(&done);
}

/// Host functions a compartment links against: the capability gate only.
fn compartment_linker(engine: &Engine) -> anyhow::Result<Linker<CompartmentState>> {
    let mut linker = Linker::new(engine);
    linker.func_wrap(CAP_INVOKE_MODULE, CAP_INVOKE_NAME, cap_invoke)?;
    Ok(linker)
}

/// What the linker actually defines and what the module asks for.
fn exposed_surface(
    linker: &Linker<CompartmentState>,
    store: &mut Store<CompartmentState>,
    module: &Module,
) -> SurfaceReport {
    let mut host_exports: Vec<String> = linker
        .iter(&mut *store)
        .map(|(ns, name, _)| format!("{ns}::{name}"))
        .collect();
    host_exports.sort();
    SurfaceReport {
        host_exports,
        guest_imports: module
            .imports()
            .map(|i| format!("{}::{}", i.module(), i.name()))
            .collect(),
    }
}

fn call_entry(
    linker: &Linker<CompartmentState>,
    module: &Module,
    store: &mut Store<CompartmentState>,
    entry: &str,
) -> Result<Option<i64>, String> {
    let instance = linker
        .instantiate(&mut *store, module)
        .map_err(describe_trap)?;
    let func = instance
        .get_func(&mut *store, entry)
        .ok_or_else(|| format!("missing entry export `{entry}`"))?;
    let ty = func.ty(&*store);
    if ty.params().len() > 0 {
        return Err(format!("entry export `{entry}` must take no parameters"));
    }
    let mut results: Vec<Val> = ty.results().map(|_| Val::I32(0)).collect();
    func.call(&mut *store, &[], &mut results)
        .map_err(describe_trap)?;

    Ok(match results.first() {
        Some(Val::I32(v)) => Some(i64::from(*v)),
        Some(Val::I64(v)) => Some(*v),
        _ => None,
    })
}

fn describe_trap(err: anyhow::Error) -> String {
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => EXIT_TERMINATED.to_string(),
        Some(Trap::OutOfFuel) => EXIT_FUEL_EXHAUSTED.to_string(),
        _ => err.to_string(),
    }
}

fn cap_invoke(
    mut caller: Caller<'_, CompartmentState>,
    req_ptr: i32,
    req_len: i32,
    out_ptr: i32,
    out_cap: i32,
) -> anyhow::Result<i32> {
    let Some(bytes) = read_guest(&mut caller, req_ptr, req_len) else {
        return Ok(INVOKE_MALFORMED);
    };
    let Ok(request) = serde_json::from_slice::<CapabilityRequest>(&bytes) else {
        return Ok(INVOKE_MALFORMED);
    };

    // Channel failures end the compartment.
    let decision = caller.data_mut().port.invoke(request)?;

    let encoded = serde_json::to_vec(&decision)?;
    if out_ptr >= 0 && out_cap >= 0 && encoded.len() <= out_cap as usize {
        if let Some(Extern::Memory(memory)) = caller.get_export("memory") {
            memory.write(&mut caller, out_ptr as usize, &encoded)?;
        }
    }
    Ok(if decision.ok {
        INVOKE_ALLOWED
    } else {
        INVOKE_DENIED
    })
}

fn read_guest(caller: &mut Caller<'_, CompartmentState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let ptr = usize::try_from(ptr).ok()?;
    let len = usize::try_from(len).ok()?;
    if len > MAX_REQUEST_BYTES {
        return None;
    }
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => memory,
        _ => return None,
    };
    let mut data = vec![0u8; len];
    memory.read(&*caller, ptr, &mut data).ok()?;
    Some(data)
}
