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

use tracing::{Span, instrument};

use hyperlight_js_common::guest::GuestCall;
use hyperlight_js_common::wire;

use super::registry::HandlerRegistry;
use super::{LoadedSandbox, SandboxConfiguration, stage_mut, stage_ref, take_stage};
use crate::Result;
use crate::hypervisor::{Hypervisor, VirtualCpu};

const STAGE: &str = "RuntimeSandbox";

/// The third sandbox stage: an initialized engine plus the host-side
/// handler registry. Registry edits never enter the vCPU; only
/// `get_loaded` does, compiling every registered handler in one entry.
pub struct RuntimeSandbox {
    inner: Option<RuntimeInner>,
}

struct RuntimeInner {
    vm: Box<dyn Hypervisor>,
    config: SandboxConfiguration,
    registry: HandlerRegistry,
}

impl RuntimeSandbox {
    pub(crate) fn new(vm: Box<dyn Hypervisor>, config: SandboxConfiguration) -> Self {
        Self {
            inner: Some(RuntimeInner {
                vm,
                config,
                registry: HandlerRegistry::default(),
            }),
        }
    }

    /// Register `source` under the routing key `name`. The source must
    /// contain a function declaration literally named `handler`; the
    /// host does not parse it, so a violation only surfaces when
    /// `get_loaded` compiles it. Re-adding a key overwrites.
    pub fn add_handler(&mut self, name: &str, source: &str) -> Result<()> {
        stage_mut(&mut self.inner, STAGE)?.registry.add(name, source)
    }

    /// Remove the handler registered under `name`. Returns whether one
    /// was there.
    pub fn remove_handler(&mut self, name: &str) -> Result<bool> {
        stage_mut(&mut self.inner, STAGE)?.registry.remove(name)
    }

    /// Drop every registered handler.
    pub fn clear_handlers(&mut self) -> Result<()> {
        stage_mut(&mut self.inner, STAGE)?.registry.clear();
        Ok(())
    }

    /// Routing keys currently registered, in key order.
    pub fn handler_names(&self) -> Result<Vec<String>> {
        Ok(stage_ref(&self.inner, STAGE)?.registry.names())
    }

    /// Enter the vCPU once to compile every registered handler into the
    /// engine, then move to the handlers-loaded stage. Consumes this
    /// stage. A compilation error in any handler fails the whole
    /// transition.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn get_loaded(&mut self) -> Result<LoadedSandbox> {
        let mut inner = take_stage(&mut self.inner, STAGE)?;
        let manifest = inner.registry.manifest();
        let frame = wire::encode_frame(
            &serde_json::to_value(&manifest)?,
            inner.vm.input_capacity(),
        )?;
        inner.vm.write_input(&frame)?;
        VirtualCpu::dispatch(inner.vm.as_mut(), GuestCall::CompileHandlers)?;
        Ok(LoadedSandbox::new(
            inner.vm,
            inner.config,
            manifest.handlers.into_keys().collect(),
        ))
    }
}

impl std::fmt::Debug for RuntimeSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("RuntimeSandbox");
        match &self.inner {
            Some(inner) => s.field("handlers", &inner.registry.names()),
            None => s.field("consumed", &true),
        }
        .finish()
    }
}
