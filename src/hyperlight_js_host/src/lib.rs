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

//! Runs untrusted JavaScript handler functions inside a micro-VM
//! sandbox. The host registers named handlers (source text whose
//! top-level function is named `handler`), invokes them with JSON
//! events, and keeps strict control over the guest: wall-clock and
//! CPU-time monitors race every guarded call, a kill leaves the sandbox
//! poisoned until a snapshot restore, and the whole lifecycle is a
//! four-stage linear progression that each terminating operation
//! consumes exactly once.

/// Dealing with errors, including the machine-readable codes every
/// failure maps to.
pub mod error;
/// Host-side dispatch for the guest's host-call surface.
pub(crate) mod hostcall;
/// The seam between the sandbox core and the VM drivers behind it.
pub mod hypervisor;
/// Metric names and recording helpers.
pub(crate) mod metrics;
/// The execution-monitor framework: resource predicates raced against
/// guest calls.
pub mod monitor;
/// The main sandbox implementation: the four lifecycle stages.
pub mod sandbox;

pub use error::{ErrorCode, HyperlightJsError, Result};
pub use hypervisor::InterruptHandle;
pub use monitor::{CpuTimeMonitor, ExecutionMonitor, MonitorFuture, MonitorSet, WallClockMonitor};
pub use sandbox::{
    CallOptions, LoadedSandbox, MAX_TIMEOUT_MS, ProtoSandbox, RuntimeSandbox, SandboxBuilder,
    SandboxConfiguration, Snapshot,
};

/// Build a generic internal [`HyperlightJsError`] from format arguments.
#[macro_export]
macro_rules! new_error {
    ($($arg:tt)+) => {{
        $crate::HyperlightJsError::Error(format!($($arg)+))
    }};
}

/// Log an error and return it from the enclosing function.
#[macro_export]
macro_rules! log_then_return {
    ($msg:literal $(,)?) => {{
        let __err = $crate::new_error!($msg);
        ::log::error!("{}", __err);
        return Err(__err);
    }};
    ($fmt:literal, $($arg:tt)+) => {{
        let __err = $crate::new_error!($fmt, $($arg)+);
        ::log::error!("{}", __err);
        return Err(__err);
    }};
    ($err:expr $(,)?) => {{
        let __err = $err;
        ::log::error!("{}", __err);
        return Err(__err);
    }};
}
