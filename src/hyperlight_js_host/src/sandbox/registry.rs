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

use hyperlight_js_common::guest::HandlerManifest;

use crate::{HyperlightJsError, Result};

/// The host-side handler table: routing key to handler source text.
/// Purely in-memory; nothing here enters the vCPU. Keys are unique and
/// re-adding overwrites.
#[derive(Debug, Clone, Default)]
pub(crate) struct HandlerRegistry {
    handlers: BTreeMap<String, String>,
}

impl HandlerRegistry {
    pub(crate) fn add(&mut self, name: &str, source: &str) -> Result<()> {
        ensure_handler_name(name)?;
        self.handlers.insert(name.to_string(), source.to_string());
        Ok(())
    }

    /// Returns whether a handler was actually removed.
    pub(crate) fn remove(&mut self, name: &str) -> Result<bool> {
        ensure_handler_name(name)?;
        Ok(self.handlers.remove(name).is_some())
    }

    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// The manifest shipped to the guest for compilation.
    pub(crate) fn manifest(&self) -> HandlerManifest {
        HandlerManifest {
            handlers: self.handlers.clone(),
        }
    }
}

/// Handler routing keys are non-empty.
pub(crate) fn ensure_handler_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(HyperlightJsError::InvalidArgument(
            "handler name must not be empty".to_string(),
        ));
    }
    Ok(())
}
