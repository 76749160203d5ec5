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

//! The four-stage sandbox lifecycle. Each stage is consumed exactly once
//! by its terminating operation:
//!
//! ```text
//! SandboxBuilder --build--> ProtoSandbox --load_runtime--> RuntimeSandbox
//!     --get_loaded--> LoadedSandbox --unload--> RuntimeSandbox (empty registry)
//! ```
//!
//! Consumption is an atomic one-shot take: once a terminating operation
//! succeeds, every later operation on the same stage fails with the
//! `consumed` code. Concurrent callers can never observe a half-consumed
//! stage; stage methods take `&mut self`, so the take is race-free by
//! construction.

use crate::{HyperlightJsError, Result};

/// The builder stage: configuration accumulation.
mod builder;
/// Sandbox memory configuration.
mod config;
/// The handlers-loaded stage: the call path.
mod loaded;
/// The proto stage: a constructed vCPU with empty guest memory.
mod proto;
/// The host-side handler registry.
mod registry;
/// The loaded-runtime stage: an initialized engine plus the registry.
mod runtime;
/// Opaque snapshots of sandbox state.
mod snapshot;

pub use builder::SandboxBuilder;
pub use config::SandboxConfiguration;
pub use loaded::{CallOptions, LoadedSandbox, MAX_TIMEOUT_MS};
pub use proto::ProtoSandbox;
pub use runtime::RuntimeSandbox;
pub use snapshot::Snapshot;

use crate::hypervisor::Hypervisor;

cfg_if::cfg_if! {
    if #[cfg(feature = "inprocess")] {
        /// Allocate the VM partition backing a new sandbox.
        pub(crate) fn set_up_vm_partition(
            config: &SandboxConfiguration,
        ) -> Result<Box<dyn Hypervisor>> {
            Ok(Box::new(crate::hypervisor::in_process::InProcessVm::new(
                config.clone(),
            )?))
        }
    } else {
        /// Allocate the VM partition backing a new sandbox.
        pub(crate) fn set_up_vm_partition(
            _config: &SandboxConfiguration,
        ) -> Result<Box<dyn Hypervisor>> {
            Err(crate::new_error!(
                "no VM driver is enabled; enable the `inprocess` feature or link a hardware driver"
            ))
        }
    }
}

/// Take a stage's inner value, consuming the stage. The second take
/// observes `consumed`.
pub(crate) fn take_stage<T>(slot: &mut Option<T>, stage: &'static str) -> Result<T> {
    slot.take().ok_or(HyperlightJsError::Consumed(stage))
}

/// Borrow a consumable stage's inner value mutably.
pub(crate) fn stage_mut<'a, T>(slot: &'a mut Option<T>, stage: &'static str) -> Result<&'a mut T> {
    slot.as_mut().ok_or(HyperlightJsError::Consumed(stage))
}

/// Borrow a consumable stage's inner value.
pub(crate) fn stage_ref<'a, T>(slot: &'a Option<T>, stage: &'static str) -> Result<&'a T> {
    slot.as_ref().ok_or(HyperlightJsError::Consumed(stage))
}
