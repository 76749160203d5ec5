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

use rand::RngExt;
use tracing::{Span, instrument};

use hyperlight_js_common::guest::GuestCall;

use super::{RuntimeSandbox, SandboxConfiguration, take_stage};
use crate::Result;
use crate::hypervisor::{Hypervisor, VirtualCpu};

const STAGE: &str = "ProtoSandbox";

/// The second sandbox stage: a constructed vCPU over empty guest
/// memory. The embedded engine has not yet been bootstrapped.
pub struct ProtoSandbox {
    inner: Option<ProtoInner>,
}

struct ProtoInner {
    vm: Box<dyn Hypervisor>,
    config: SandboxConfiguration,
}

impl ProtoSandbox {
    pub(crate) fn new(vm: Box<dyn Hypervisor>, config: SandboxConfiguration) -> Self {
        Self {
            inner: Some(ProtoInner { vm, config }),
        }
    }

    /// Enter the vCPU to run the embedded engine's bootstrap sequence:
    /// engine construction, intrinsics registration, and host-call
    /// wiring. Consumes this stage. A guest-side bootstrap failure is
    /// fatal; there is no recovery path for a proto sandbox.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn load_runtime(&mut self) -> Result<RuntimeSandbox> {
        let mut inner = take_stage(&mut self.inner, STAGE)?;
        // The seed feeds the guest's deterministic Math.random, so two
        // sandboxes never share a PRNG stream.
        let seed = rand::rng().random::<u64>();
        VirtualCpu::dispatch(inner.vm.as_mut(), GuestCall::InitRuntime { seed })?;
        Ok(RuntimeSandbox::new(inner.vm, inner.config))
    }
}

impl std::fmt::Debug for ProtoSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtoSandbox")
            .field("consumed", &self.inner.is_none())
            .finish()
    }
}
