/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! An in-process VM driver for development and testing without hardware
//! virtualization. The guest runtime is emulated with an embedded
//! QuickJS engine executing on the calling thread, so CPU time accrues
//! to the thread the CPU-time monitor watches, and the engine's
//! interrupt callback stands in for the vCPU's safe points.
//!
//! Host calls are served synchronously from the engine's native
//! functions rather than surfacing as [`VmExit::HostCall`]; hardware
//! drivers take the exit path.
//!
//! Snapshots capture the engine seed and the compiled handler table and
//! restore by rebuilding the realm. Handler-visible global mutations are
//! not captured; handlers that keep state in globals should not rely on
//! restore under this driver. Hardware drivers snapshot guest memory
//! wholesale and do not share the limitation.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use rquickjs::prelude::Func;
use rquickjs::{Context, Ctx, Runtime};
use serde::{Deserialize, Serialize};

use hyperlight_js_common::guest::{GuestCall, HandlerManifest};
use hyperlight_js_common::hostcall::{
    GuestLogLevel, GuestLogRecord, HostCallPort, abort_code, decode_time_reply,
};
use hyperlight_js_common::wire::{self, WireError};

use super::{HostCallResult, Hypervisor, VcpuInterrupt, VmExit};
use crate::sandbox::SandboxConfiguration;
use crate::{Result, hostcall, new_error};

/// A pending abort raised from inside a native host-call function. The
/// engine's interrupt callback observes it and unwinds the guest at the
/// next safe point.
type PendingAbort = Rc<RefCell<Option<(u8, String)>>>;

/// The in-process VM: a QuickJS engine behind the [`Hypervisor`] seam.
pub(crate) struct InProcessVm {
    config: SandboxConfiguration,
    interrupt: Arc<VcpuInterrupt>,
    engine: Engine,
    input: FixedBuffer,
    output: FixedBuffer,
    queued: Option<GuestCall>,
}

struct Engine {
    rt: Runtime,
    context: Option<Context>,
    handlers: BTreeMap<String, String>,
    seed: u64,
    pending_abort: PendingAbort,
}

/// Emulates one of the fixed-size event buffers mapped into guest
/// memory.
struct FixedBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl FixedBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::new(),
            capacity,
        }
    }

    fn write(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.capacity {
            return Err(new_error!(
                "frame of {} bytes exceeds the {}-byte buffer",
                frame.len(),
                self.capacity
            ));
        }
        self.bytes = frame.to_vec();
        Ok(())
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// What an in-process snapshot carries. Opaque to everything above the
/// driver.
#[derive(Serialize, Deserialize)]
struct InProcessSnapshot {
    seed: u64,
    bootstrapped: bool,
    handlers: BTreeMap<String, String>,
}

impl InProcessVm {
    pub(crate) fn new(config: SandboxConfiguration) -> Result<Self> {
        let rt = Runtime::new()
            .map_err(|e| new_error!("failed to construct the QuickJS runtime: {}", e))?;
        rt.set_memory_limit(config.guest_heap_size());
        rt.set_max_stack_size(config.guest_stack_size());

        let interrupt = VcpuInterrupt::new();
        let pending_abort: PendingAbort = Rc::new(RefCell::new(None));
        {
            let interrupt = interrupt.clone();
            let pending = pending_abort.clone();
            rt.set_interrupt_handler(Some(Box::new(move || {
                interrupt.cancel_requested() || pending.borrow().is_some()
            })));
        }
        #[cfg(unix)]
        super::register_vcpu_signal_handler();

        let input = FixedBuffer::new(config.input_data_size());
        let output = FixedBuffer::new(config.output_data_size());
        Ok(Self {
            config,
            interrupt,
            engine: Engine {
                rt,
                context: None,
                handlers: BTreeMap::new(),
                seed: 0,
                pending_abort,
            },
            input,
            output,
            queued: None,
        })
    }

    fn init_runtime(&mut self, seed: u64) -> Result<VmExit> {
        let context = self.engine.bootstrap_realm(seed)?;
        self.engine.context = Some(context);
        self.engine.seed = seed;
        Ok(VmExit::Halt())
    }

    fn compile(&mut self, input_frame: &[u8]) -> Result<VmExit> {
        let manifest: HandlerManifest = serde_json::from_value(wire::decode_frame(input_frame)?)?;
        let context = self
            .engine
            .context
            .as_ref()
            .ok_or_else(|| new_error!("the guest runtime has not been bootstrapped"))?;
        let mut failure: Option<(String, String)> = None;
        context.with(|ctx| {
            for (name, source) in &manifest.handlers {
                if let Err(e) = ctx.eval::<bool, _>(compile_probe(source)) {
                    failure = Some((name.clone(), eval_error_message(&ctx, e)));
                    break;
                }
            }
        });
        if let Some((name, message)) = failure {
            if self.interrupt.cancel_requested() {
                return Ok(VmExit::Cancelled());
            }
            return Err(new_error!(
                "failed to compile handler {:?}: {}",
                name,
                message
            ));
        }
        self.engine.handlers = manifest.handlers;
        Ok(VmExit::Halt())
    }

    fn invoke(&mut self, name: &str, input_frame: &[u8]) -> Result<VmExit> {
        let Some(source) = self.engine.handlers.get(name).cloned() else {
            return Ok(VmExit::GuestAbort(
                abort_code::UNHANDLED_EXCEPTION,
                format!("TypeError: no handler is loaded under the name {name:?}"),
            ));
        };
        let event_text = serde_json::to_string(&wire::decode_frame(input_frame)?)?;
        let context = self
            .engine
            .context
            .as_ref()
            .ok_or_else(|| new_error!("the guest runtime has not been bootstrapped"))?;

        let evaled: core::result::Result<String, String> =
            context.with(|ctx| -> Result<core::result::Result<String, String>> {
                ctx.globals()
                    .set("__hl_event", event_text.as_str())
                    .map_err(engine_error)?;
                match ctx.eval::<String, _>(invoke_script(&source)) {
                    Ok(text) => Ok(Ok(text)),
                    Err(rquickjs::Error::Exception) => Ok(Err(caught_message(&ctx))),
                    Err(e) => Ok(Err(e.to_string())),
                }
            })?;

        match evaled {
            Ok(text) => {
                let value: serde_json::Value = serde_json::from_str(&text)?;
                match wire::encode_frame(&value, self.config.output_data_size()) {
                    Ok(frame) => {
                        self.output.write(&frame)?;
                        Ok(VmExit::Halt())
                    }
                    Err(WireError::FrameTooLarge { frame, capacity }) => Ok(VmExit::GuestAbort(
                        abort_code::OUTPUT_TOO_LARGE,
                        format!(
                            "handler result of {frame} bytes exceeds the {capacity}-byte output buffer"
                        ),
                    )),
                    Err(e) => Err(e.into()),
                }
            }
            Err(message) => Ok(self.classify_guest_failure(message)),
        }
    }

    /// Order matters: a pending host-call abort explains the unwound
    /// engine even when a kill raced it, and a kill explains an
    /// interrupt-raised exception before any message sniffing.
    fn classify_guest_failure(&self, message: String) -> VmExit {
        if let Some((code, message)) = self.engine.pending_abort.borrow_mut().take() {
            return VmExit::GuestAbort(code, message);
        }
        if self.interrupt.cancel_requested() {
            return VmExit::Cancelled();
        }
        if message.to_ascii_lowercase().contains("stack overflow") {
            return VmExit::StackOverflow();
        }
        VmExit::GuestAbort(abort_code::UNHANDLED_EXCEPTION, message)
    }

    fn reset(&mut self) -> Result<VmExit> {
        let context = self.engine.bootstrap_realm(self.engine.seed)?;
        self.engine.context = Some(context);
        self.engine.handlers.clear();
        Ok(VmExit::Halt())
    }
}

impl Hypervisor for InProcessVm {
    fn queue_guest_call(&mut self, call: GuestCall) -> Result<()> {
        if self.queued.is_some() {
            return Err(new_error!("a guest call is already queued"));
        }
        self.queued = Some(call);
        Ok(())
    }

    fn run(&mut self) -> Result<VmExit> {
        let Some(call) = self.queued.take() else {
            return Err(new_error!("no guest call is queued"));
        };
        // A kill delivered before entry (for example during host-call
        // service on a hardware driver) must keep the guest out.
        if self.interrupt.cancel_requested() {
            return Ok(VmExit::Cancelled());
        }
        self.engine.pending_abort.borrow_mut().take();
        match call {
            GuestCall::InitRuntime { seed } => self.init_runtime(seed),
            GuestCall::CompileHandlers => {
                let frame = self.input.take();
                self.compile(&frame)
            }
            GuestCall::InvokeHandler { name } => {
                let frame = self.input.take();
                self.invoke(&name, &frame)
            }
            GuestCall::CollectGarbage => {
                self.engine.rt.run_gc();
                Ok(VmExit::Halt())
            }
            GuestCall::ResetHandlers => self.reset(),
        }
    }

    fn complete_host_call(&mut self, _result: HostCallResult) -> Result<()> {
        Err(new_error!(
            "the in-process vm serves host calls synchronously and never exits for them"
        ))
    }

    fn write_input(&mut self, frame: &[u8]) -> Result<()> {
        self.input.write(frame)
    }

    fn read_output(&mut self) -> Result<Vec<u8>> {
        if self.output.bytes.is_empty() {
            return Err(new_error!("the guest left nothing in the output buffer"));
        }
        Ok(self.output.take())
    }

    fn input_capacity(&self) -> usize {
        self.config.input_data_size()
    }

    fn output_capacity(&self) -> usize {
        self.config.output_data_size()
    }

    fn snapshot(&mut self) -> Result<Vec<u8>> {
        let snapshot = InProcessSnapshot {
            seed: self.engine.seed,
            bootstrapped: self.engine.context.is_some(),
            handlers: self.engine.handlers.clone(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    fn restore(&mut self, payload: &[u8]) -> Result<()> {
        let snapshot: InProcessSnapshot = serde_json::from_slice(payload)
            .map_err(|e| new_error!("snapshot payload is not valid for the in-process vm: {}", e))?;
        // Build the replacement realm before touching live state, so a
        // failed restore leaves the sandbox as it was.
        let context = match snapshot.bootstrapped {
            true => Some(self.engine.bootstrap_realm(snapshot.seed)?),
            false => None,
        };
        self.engine.context = context;
        self.engine.seed = snapshot.seed;
        self.engine.handlers = snapshot.handlers;
        self.queued = None;
        self.input.clear();
        self.output.clear();
        Ok(())
    }

    fn interrupt(&self) -> Arc<VcpuInterrupt> {
        self.interrupt.clone()
    }
}

impl std::fmt::Debug for InProcessVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessVm")
            .field("config", &self.config)
            .field("bootstrapped", &self.engine.context.is_some())
            .field("handlers", &self.engine.handlers.len())
            .finish()
    }
}

impl Engine {
    /// Build a fresh realm wired to the host-call surface. Committing
    /// it (or not) is the caller's business.
    fn bootstrap_realm(&self, seed: u64) -> Result<Context> {
        let context = Context::full(&self.rt).map_err(engine_error)?;
        let pending = self.pending_abort.clone();
        context.with(|ctx| -> Result<()> {
            install_host_functions(&ctx, pending)?;
            ctx.eval::<(), _>(bootstrap_script(seed)).map_err(|e| {
                new_error!("engine bootstrap failed: {}", eval_error_message(&ctx, e))
            })?;
            Ok(())
        })?;
        Ok(context)
    }
}

fn install_host_functions(ctx: &Ctx<'_>, pending: PendingAbort) -> Result<()> {
    let globals = ctx.globals();
    {
        let pending = pending.clone();
        globals
            .set(
                "__host_current_time",
                Func::from(move || -> f64 {
                    match serve_host_call(HostCallPort::CurrentTime, &[], &pending) {
                        Some(reply) => match decode_time_reply(&reply) {
                            Some((secs, nanos)) => {
                                secs as f64 * 1_000.0 + nanos as f64 / 1_000_000.0
                            }
                            None => {
                                *pending.borrow_mut() = Some((
                                    abort_code::HOST_CALL_FAILED,
                                    "malformed current-time reply".to_string(),
                                ));
                                0.0
                            }
                        },
                        None => 0.0,
                    }
                }),
            )
            .map_err(engine_error)?;
    }
    globals
        .set(
            "__host_log",
            Func::from(move |level: String, message: String| {
                let record = GuestLogRecord {
                    level: parse_guest_level(&level),
                    message,
                    source: "handler".to_string(),
                };
                if let Ok(data) = serde_json::to_vec(&record) {
                    serve_host_call(HostCallPort::Log, &data, &pending);
                }
            }),
        )
        .map_err(engine_error)?;
    Ok(())
}

/// Serve one host call synchronously. `None` means the call failed and
/// the guest abort has been flagged.
fn serve_host_call(port: HostCallPort, data: &[u8], pending: &PendingAbort) -> Option<Vec<u8>> {
    match hostcall::handle_host_call(port as u16, data) {
        Ok(reply) => Some(reply),
        Err(e) => {
            *pending.borrow_mut() = Some(hostcall::abort_payload_for(&e));
            None
        }
    }
}

fn parse_guest_level(level: &str) -> GuestLogLevel {
    match level {
        "error" => GuestLogLevel::Error,
        "warn" => GuestLogLevel::Warn,
        "debug" => GuestLogLevel::Debug,
        "trace" => GuestLogLevel::Trace,
        _ => GuestLogLevel::Info,
    }
}

fn bootstrap_script(seed: u64) -> String {
    // Clock intrinsics go through the current-time host call, console
    // goes through the log host call, and Math.random is mulberry32
    // over the low word of the build seed so guest runs are
    // reproducible.
    format!(
        r#""use strict";
(function (g) {{
    Date.now = function () {{ return Math.floor(__host_current_time()); }};
    var state = {seed} >>> 0;
    Math.random = function () {{
        state = (state + 0x6D2B79F5) >>> 0;
        var t = Math.imul(state ^ (state >>> 15), state | 1);
        t = (t + Math.imul(t ^ (t >>> 7), t | 61)) ^ t;
        return ((t ^ (t >>> 14)) >>> 0) / 4294967296;
    }};
    function emit(level) {{
        return function () {{
            __host_log(level, Array.prototype.join.call(arguments, " "));
        }};
    }}
    g.console = {{
        log: emit("info"),
        info: emit("info"),
        warn: emit("warn"),
        error: emit("error"),
        debug: emit("debug")
    }};
}})(globalThis);
"#,
        seed = (seed & 0xFFFF_FFFF) as u32
    )
}

/// Wrap a handler source so evaluating it checks the contract without
/// invoking anything.
fn compile_probe(source: &str) -> String {
    format!(
        r#"(function () {{
"use strict";
{source}
if (typeof handler !== "function") {{ throw new TypeError("source does not define handler()"); }}
return true;
}})()"#
    )
}

/// Wrap a handler source for one invocation: parse the event out of the
/// scratch global, run `handler`, stringify the result.
fn invoke_script(source: &str) -> String {
    format!(
        r#"(function () {{
"use strict";
{source}
if (typeof handler !== "function") {{ throw new TypeError("source does not define handler()"); }}
var __result = handler(JSON.parse(globalThis.__hl_event));
var __text = JSON.stringify(__result);
return __text === undefined ? "null" : __text;
}})()"#
    )
}

fn caught_message(ctx: &Ctx<'_>) -> String {
    let caught = ctx.catch();
    if let Some(text) = caught.as_string() {
        if let Ok(text) = text.to_string() {
            return text;
        }
    }
    if let Some(object) = caught.as_object() {
        if let Ok(message) = object.get::<_, String>("message") {
            let name = object
                .get::<_, String>("name")
                .unwrap_or_else(|_| "Error".to_string());
            return format!("{name}: {message}");
        }
    }
    "unknown guest exception".to_string()
}

fn eval_error_message(ctx: &Ctx<'_>, e: rquickjs::Error) -> String {
    match e {
        rquickjs::Error::Exception => caught_message(ctx),
        other => other.to_string(),
    }
}

fn engine_error(e: rquickjs::Error) -> crate::HyperlightJsError {
    new_error!("QuickJS engine failure: {}", e)
}
