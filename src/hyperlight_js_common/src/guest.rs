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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The call the host asks the guest runtime to perform on its next
/// entry. Payloads larger than a routing key travel through the event
/// buffers, not through the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestCall {
    /// Bootstrap the embedded engine: construct it, register the
    /// intrinsics, and wire up the host-call surface. `seed` drives the
    /// guest's deterministic `Math.random`.
    InitRuntime {
        /// Seed for the guest's pseudo-random number generator.
        seed: u64,
    },
    /// Compile every handler in the manifest currently sitting in the
    /// input buffer.
    CompileHandlers,
    /// Invoke the named handler on the event in the input buffer and
    /// write its result to the output buffer.
    InvokeHandler {
        /// Routing key the handler was registered under.
        name: String,
    },
    /// Run an engine garbage-collection pass.
    CollectGarbage,
    /// Discard every compiled handler and re-initialize the engine's
    /// handler table.
    ResetHandlers,
}

impl GuestCall {
    /// Short name for logs and spans.
    pub fn name(&self) -> &'static str {
        match self {
            GuestCall::InitRuntime { .. } => "init-runtime",
            GuestCall::CompileHandlers => "compile-handlers",
            GuestCall::InvokeHandler { .. } => "invoke-handler",
            GuestCall::CollectGarbage => "collect-garbage",
            GuestCall::ResetHandlers => "reset-handlers",
        }
    }
}

/// The handler table the host ships to the guest for compilation,
/// carried as a JSON frame in the input buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerManifest {
    /// Routing key to handler source text.
    pub handlers: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_as_json() {
        let mut manifest = HandlerManifest::default();
        manifest.handlers.insert(
            "echo".to_string(),
            "function handler(event) { return event; }".to_string(),
        );
        let bytes = serde_json::to_vec(&manifest).unwrap();
        assert_eq!(
            serde_json::from_slice::<HandlerManifest>(&bytes).unwrap(),
            manifest
        );
    }

    #[test]
    fn call_names_are_stable() {
        assert_eq!(GuestCall::InitRuntime { seed: 0 }.name(), "init-runtime");
        assert_eq!(
            GuestCall::InvokeHandler {
                name: "echo".to_string()
            }
            .name(),
            "invoke-handler"
        );
    }
}
