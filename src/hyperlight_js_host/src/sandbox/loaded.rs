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

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{Span, instrument};
use uuid::Uuid;

use hyperlight_js_common::guest::GuestCall;
use hyperlight_js_common::wire;

use super::registry::ensure_handler_name;
use super::{RuntimeSandbox, SandboxConfiguration, Snapshot, stage_mut, take_stage};
use crate::hypervisor::{Hypervisor, InterruptHandle, VirtualCpu};
use crate::monitor::{ArmedMonitor, CpuTimeMonitor, MonitorSet, WallClockMonitor};
use crate::{HyperlightJsError, Result, metrics, monitor};

const STAGE: &str = "LoadedSandbox";

/// Upper bound on the wall-clock and CPU-time timeout options: one
/// hour. Larger values are taken as caller bugs and rejected.
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;

/// Options recognized by [`LoadedSandbox::call_handler`]. An empty value
/// means no monitors and a post-call garbage-collection pass.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Kill the call after this much wall-clock time, in milliseconds.
    /// Must be in `(0, MAX_TIMEOUT_MS]`.
    pub wall_clock_timeout_ms: Option<u64>,
    /// Kill the call after the vCPU thread burns this much CPU time, in
    /// milliseconds. Must be in `(0, MAX_TIMEOUT_MS]`.
    pub cpu_timeout_ms: Option<u64>,
    /// Run an engine garbage-collection pass after the handler returns.
    /// Defaults to on.
    pub gc: Option<bool>,
}

impl CallOptions {
    /// Set the wall-clock timeout in milliseconds.
    pub fn with_wall_clock_timeout_ms(mut self, ms: u64) -> Self {
        self.wall_clock_timeout_ms = Some(ms);
        self
    }

    /// Set the CPU-time budget in milliseconds.
    pub fn with_cpu_timeout_ms(mut self, ms: u64) -> Self {
        self.cpu_timeout_ms = Some(ms);
        self
    }

    /// Enable or disable the post-call garbage-collection pass.
    pub fn with_gc(mut self, gc: bool) -> Self {
        self.gc = Some(gc);
        self
    }

    fn run_gc(&self) -> bool {
        self.gc.unwrap_or(true)
    }

    fn validate(&self) -> Result<()> {
        validate_timeout("wall-clock timeout", self.wall_clock_timeout_ms)?;
        validate_timeout("cpu timeout", self.cpu_timeout_ms)
    }
}

fn validate_timeout(what: &str, ms: Option<u64>) -> Result<()> {
    match ms {
        Some(0) => Err(HyperlightJsError::InvalidArgument(format!(
            "{what} must be strictly positive"
        ))),
        Some(ms) if ms > MAX_TIMEOUT_MS => Err(HyperlightJsError::InvalidArgument(format!(
            "{what} of {ms}ms exceeds the maximum of {MAX_TIMEOUT_MS}ms"
        ))),
        _ => Ok(()),
    }
}

/// The fourth sandbox stage: compiled handlers, the call path,
/// snapshot/restore, and poison recovery.
///
/// A call that had to be killed mid-instruction leaves the embedded
/// engine's invariants in doubt; the stage then enters the poisoned
/// substate and rejects everything except [`restore`], [`unload`], and
/// the poisoned-flag read. A host that uses timeouts MUST take a
/// snapshot before the first guarded call, or poisoning is permanent
/// short of `unload`.
///
/// [`restore`]: LoadedSandbox::restore
/// [`unload`]: LoadedSandbox::unload
pub struct LoadedSandbox {
    inner: Option<LoadedInner>,
    // Held outside `inner` so the infallible accessors survive
    // consumption.
    poisoned: Arc<AtomicBool>,
    interrupt: Arc<dyn InterruptHandle>,
}

struct LoadedInner {
    vm: Box<dyn Hypervisor>,
    config: SandboxConfiguration,
    id: Uuid,
    compiled: BTreeSet<String>,
}

impl LoadedSandbox {
    pub(crate) fn new(
        vm: Box<dyn Hypervisor>,
        config: SandboxConfiguration,
        compiled: BTreeSet<String>,
    ) -> Self {
        let interrupt = vm.interrupt_handle();
        Self {
            inner: Some(LoadedInner {
                vm,
                config,
                id: Uuid::new_v4(),
                compiled,
            }),
            poisoned: Arc::new(AtomicBool::new(false)),
            interrupt,
        }
    }

    /// Whether the sandbox is in the poisoned substate. Infallible.
    pub fn poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// A cloneable, thread-safe handle that can kill the call in
    /// progress. Infallible.
    pub fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        self.interrupt.clone()
    }

    /// Invoke the handler registered under `name` with `event`,
    /// guarded by whatever monitors `options` ask for.
    ///
    /// The timeout options materialize as the built-in monitor set:
    /// wall-clock, CPU-time, or the two composed. Use
    /// [`call_handler_monitored`] to add custom monitors.
    ///
    /// [`call_handler_monitored`]: LoadedSandbox::call_handler_monitored
    #[instrument(err(Debug), skip(self, event), parent = Span::current())]
    pub fn call_handler(
        &mut self,
        name: &str,
        event: &serde_json::Value,
        options: &CallOptions,
    ) -> Result<serde_json::Value> {
        self.call_with(name, event, options, None)
    }

    /// [`call_handler`] with an extra caller-supplied monitor set raced
    /// alongside the ones `options` ask for.
    ///
    /// [`call_handler`]: LoadedSandbox::call_handler
    #[instrument(err(Debug), skip(self, event, monitors), parent = Span::current())]
    pub fn call_handler_monitored<M: MonitorSet>(
        &mut self,
        name: &str,
        event: &serde_json::Value,
        options: &CallOptions,
        monitors: &M,
    ) -> Result<serde_json::Value> {
        self.call_with(name, event, options, Some(monitors))
    }

    fn call_with(
        &mut self,
        name: &str,
        event: &serde_json::Value,
        options: &CallOptions,
        extra: Option<&dyn MonitorSet>,
    ) -> Result<serde_json::Value> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(HyperlightJsError::Poisoned);
        }
        ensure_handler_name(name)?;
        options.validate()?;

        let inner = stage_mut(&mut self.inner, STAGE)?;
        if !inner.compiled.contains(name) {
            return Err(HyperlightJsError::InvalidArgument(format!(
                "no handler is loaded under the name {name:?}"
            )));
        }

        let frame = wire::encode_frame(event, inner.vm.input_capacity())?;

        // Prepare every monitor on this thread before the guest is
        // touched. Fail-closed: a monitor that cannot arm fails the
        // call here, with no handler side effects.
        let wall = options.wall_clock_timeout_ms.map(Duration::from_millis);
        let cpu = options.cpu_timeout_ms.map(Duration::from_millis);
        let mut armed = match (wall, cpu) {
            (None, None) => Vec::new(),
            (Some(wall), None) => (WallClockMonitor::new(wall),).prepare_all()?,
            (None, Some(cpu)) => (CpuTimeMonitor::new(cpu),).prepare_all()?,
            (Some(wall), Some(cpu)) => {
                (WallClockMonitor::new(wall), CpuTimeMonitor::new(cpu)).prepare_all()?
            }
        };
        if let Some(extra) = extra {
            armed.extend(extra.prepare_all()?);
        }

        let started = Instant::now();
        inner.vm.write_input(&frame)?;

        let call = GuestCall::InvokeHandler {
            name: name.to_string(),
        };
        let dispatched = if armed.is_empty() {
            VirtualCpu::dispatch(inner.vm.as_mut(), call)
        } else {
            Self::dispatch_watched(inner, call, armed, self.interrupt.clone())
        };
        if let Err(e) = dispatched {
            // The vCPU was entered and did not come back cleanly; the
            // engine's invariants are now in doubt.
            self.poisoned.store(true, Ordering::Release);
            return Err(e);
        }

        let output = inner.vm.read_output()?;
        let result = wire::decode_frame(&output)?;

        if options.run_gc() {
            if let Err(e) = VirtualCpu::dispatch(inner.vm.as_mut(), GuestCall::CollectGarbage) {
                self.poisoned.store(true, Ordering::Release);
                return Err(e);
            }
        }

        metrics::record_handler_call(name, started.elapsed());
        Ok(result)
    }

    fn dispatch_watched(
        inner: &mut LoadedInner,
        call: GuestCall,
        armed: Vec<ArmedMonitor>,
        interrupt: Arc<dyn InterruptHandle>,
    ) -> Result<()> {
        let guard = monitor::launch_monitors(armed, interrupt)?;
        let res = VirtualCpu::dispatch(inner.vm.as_mut(), call);
        let winner = guard.disarm();
        if let (Err(HyperlightJsError::ExecutionCanceledByHost), Some(winner)) = (&res, winner) {
            metrics::record_monitor_termination(winner);
            log::info!("guest call terminated by the {winner} monitor");
        }
        res
    }

    /// Capture the complete vCPU and guest memory state.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn snapshot(&mut self) -> Result<Snapshot> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(HyperlightJsError::Poisoned);
        }
        let inner = stage_mut(&mut self.inner, STAGE)?;
        let payload = inner.vm.snapshot()?;
        Ok(Snapshot::new(inner.id, payload))
    }

    /// Overwrite the live state with `snapshot` and clear the poisoned
    /// flag. After a successful restore the sandbox behaves exactly as
    /// it did at the moment the snapshot was taken; on failure it is
    /// left in its prior state, poisoned flag included.
    ///
    /// Snapshots only apply to the sandbox that produced them.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        let inner = stage_mut(&mut self.inner, STAGE)?;
        if snapshot.sandbox_id() != inner.id {
            return Err(HyperlightJsError::SnapshotSandboxMismatch);
        }
        snapshot.verify_integrity()?;
        inner.vm.restore(snapshot.payload())?;
        self.poisoned.store(false, Ordering::Release);
        Ok(())
    }

    /// Discard the compiled handlers, re-initializing the engine's
    /// handler table, and return to the loaded-runtime stage with an
    /// EMPTY registry; the caller must re-add handlers. Consumes this
    /// stage. Permitted while poisoned, as the second recovery path.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn unload(&mut self) -> Result<RuntimeSandbox> {
        let mut inner = take_stage(&mut self.inner, STAGE)?;
        VirtualCpu::dispatch(inner.vm.as_mut(), GuestCall::ResetHandlers)?;
        Ok(RuntimeSandbox::new(inner.vm, inner.config))
    }
}

impl Drop for LoadedSandbox {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.vm.interrupt().set_dropped();
        }
    }
}

impl std::fmt::Debug for LoadedSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("LoadedSandbox");
        s.field("poisoned", &self.poisoned());
        match &self.inner {
            Some(inner) => s.field("id", &inner.id).field("handlers", &inner.compiled),
            None => s.field("consumed", &true),
        }
        .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    #[test]
    fn timeout_validation_enforces_the_bounds() {
        assert!(validate_timeout("t", None).is_ok());
        assert!(validate_timeout("t", Some(1)).is_ok());
        assert!(validate_timeout("t", Some(MAX_TIMEOUT_MS)).is_ok());
        assert_eq!(
            validate_timeout("t", Some(0)).unwrap_err().code(),
            ErrorCode::InvalidArg
        );
        assert_eq!(
            validate_timeout("t", Some(4_000_000)).unwrap_err().code(),
            ErrorCode::InvalidArg
        );
    }

    #[test]
    fn gc_defaults_to_on() {
        assert!(CallOptions::default().run_gc());
        assert!(CallOptions::default().with_gc(true).run_gc());
        assert!(!CallOptions::default().with_gc(false).run_gc());
    }
}
