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

//! The execution-monitor framework: resource predicates raced against a
//! guest call. A monitor's `prepare` step runs on the calling thread
//! (some monitors capture thread-local state there); the future it
//! returns is watched on a process-wide async runtime, and the first
//! future to complete kills the vCPU through the sandbox's interrupt
//! handle. The runtime's worker count comes from
//! `HYPERLIGHT_MONITOR_THREADS` (default 2), read once at first use.
//!
//! The launch protocol is fail-closed: if any monitor in a set cannot
//! prepare, the guest call never starts. Silently running an unmonitored
//! handler because a monitor failed to initialize is a hazard that
//! cannot be detected after the fact.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use crate::Result;
use crate::hypervisor::InterruptHandle;

/// CPU-time budget monitoring.
mod cpu_time;
/// The process-wide runtime that watch futures run on.
pub(crate) mod runtime;
/// Wall-clock deadline monitoring.
mod wall_clock;

pub use cpu_time::CpuTimeMonitor;
pub use wall_clock::WallClockMonitor;

/// The predicate future a monitor produces: pending while the predicate
/// holds, complete when it fires.
pub type MonitorFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A resource predicate that can be raced against a guest call.
///
/// `prepare` runs on the thread that will enter the vCPU and may capture
/// thread-local state (the CPU-time monitor captures that thread's CPU
/// clock there). The returned future runs on the shared monitor runtime.
pub trait ExecutionMonitor: Send {
    /// Stable short name, used as the metric label when this monitor
    /// terminates a call.
    fn name(&self) -> &'static str;

    /// Capture whatever the watch needs from the calling thread and
    /// return the predicate future.
    fn prepare(&self) -> Result<MonitorFuture>;
}

/// A prepared monitor: the predicate future tagged with its monitor's
/// name so the race can report its winner.
pub struct ArmedMonitor {
    name: &'static str,
    signal: MonitorFuture,
}

impl std::fmt::Debug for ArmedMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmedMonitor").field("name", &self.name).finish()
    }
}

impl ArmedMonitor {
    /// Pair a prepared predicate future with its monitor's name.
    pub fn new(name: &'static str, signal: MonitorFuture) -> Self {
        Self { name, signal }
    }
}

/// A single monitor or a tuple of up to five monitors whose predicates
/// are OR'd together.
pub trait MonitorSet {
    /// Run every member's prepare phase, in order, on the calling
    /// thread. The first failure aborts the whole set.
    fn prepare_all(&self) -> Result<Vec<ArmedMonitor>>;
}

impl<M: ExecutionMonitor> MonitorSet for M {
    fn prepare_all(&self) -> Result<Vec<ArmedMonitor>> {
        Ok(vec![ArmedMonitor::new(self.name(), self.prepare()?)])
    }
}

macro_rules! impl_monitor_set_for_tuple {
    ($($monitor:ident),+) => {
        impl<$($monitor: ExecutionMonitor),+> MonitorSet for ($($monitor,)+) {
            fn prepare_all(&self) -> Result<Vec<ArmedMonitor>> {
                #[allow(non_snake_case)]
                let ($($monitor,)+) = self;
                let mut armed = Vec::new();
                $(armed.push(ArmedMonitor::new($monitor.name(), $monitor.prepare()?));)+
                Ok(armed)
            }
        }
    };
}

impl_monitor_set_for_tuple!(M1);
impl_monitor_set_for_tuple!(M1, M2);
impl_monitor_set_for_tuple!(M1, M2, M3);
impl_monitor_set_for_tuple!(M1, M2, M3, M4);
impl_monitor_set_for_tuple!(M1, M2, M3, M4, M5);

/// Races a set of armed monitors; resolves to the name of the first
/// predicate to fire.
struct Race {
    armed: Vec<ArmedMonitor>,
}

impl Future for Race {
    type Output = &'static str;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<&'static str> {
        let this = self.get_mut();
        for watch in this.armed.iter_mut() {
            if watch.signal.as_mut().poll(cx).is_ready() {
                return Poll::Ready(watch.name);
            }
        }
        Poll::Pending
    }
}

/// The watch task spawned for one guarded call. Dropped via
/// [`MonitorGuard::disarm`] once the vCPU has exited.
pub(crate) struct MonitorGuard {
    task: tokio::task::JoinHandle<()>,
    winner: Arc<OnceLock<&'static str>>,
}

impl MonitorGuard {
    /// Abort the watch and report which monitor, if any, fired first.
    /// The winner is recorded before `kill` is issued, so a call that
    /// came back cancelled observes it here.
    pub(crate) fn disarm(self) -> Option<&'static str> {
        self.task.abort();
        self.winner.get().copied()
    }
}

/// Spawn the composed watch on the shared runtime. When the race
/// resolves, the winning monitor kills the vCPU through `interrupt`.
pub(crate) fn launch_monitors(
    armed: Vec<ArmedMonitor>,
    interrupt: Arc<dyn InterruptHandle>,
) -> Result<MonitorGuard> {
    let winner = Arc::new(OnceLock::new());
    let recorded = winner.clone();
    let task = runtime::shared_runtime()?.spawn(async move {
        let name = Race { armed }.await;
        let _ = recorded.set(name);
        // Blocks this worker until the vCPU thread stops; acceptable on
        // a runtime dedicated to watch futures.
        interrupt.kill();
    });
    Ok(MonitorGuard { task, winner })
}
