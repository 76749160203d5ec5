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

use super::{ProtoSandbox, SandboxConfiguration, set_up_vm_partition, stage_mut, take_stage};
use crate::{HyperlightJsError, Result};

const STAGE: &str = "SandboxBuilder";

/// The first sandbox stage: accumulates memory configuration. Each
/// setter validates its argument and returns the builder for chaining;
/// `build` allocates the VM partition and consumes the builder.
#[derive(Debug)]
pub struct SandboxBuilder {
    inner: Option<SandboxConfiguration>,
}

impl SandboxBuilder {
    /// A builder carrying the default configuration.
    pub fn new() -> Self {
        Self {
            inner: Some(SandboxConfiguration::default()),
        }
    }

    /// Set the guest engine heap size in bytes. Rounded up to the host
    /// page size.
    pub fn set_heap_size(&mut self, bytes: usize) -> Result<&mut Self> {
        ensure_positive(bytes, "guest heap size")?;
        stage_mut(&mut self.inner, STAGE)?.set_guest_heap_size(bytes);
        Ok(self)
    }

    /// Set the guest stack size in bytes. Rounded up to the host page
    /// size.
    pub fn set_stack_size(&mut self, bytes: usize) -> Result<&mut Self> {
        ensure_positive(bytes, "guest stack size")?;
        stage_mut(&mut self.inner, STAGE)?.set_guest_stack_size(bytes);
        Ok(self)
    }

    /// Set the capacity of the event input buffer in bytes.
    pub fn set_input_buffer_size(&mut self, bytes: usize) -> Result<&mut Self> {
        ensure_positive(bytes, "input buffer size")?;
        stage_mut(&mut self.inner, STAGE)?.set_input_data_size(bytes);
        Ok(self)
    }

    /// Set the capacity of the result output buffer in bytes.
    pub fn set_output_buffer_size(&mut self, bytes: usize) -> Result<&mut Self> {
        ensure_positive(bytes, "output buffer size")?;
        stage_mut(&mut self.inner, STAGE)?.set_output_data_size(bytes);
        Ok(self)
    }

    /// Allocate the VM partition (vCPU plus guest memory map with the
    /// configured buffer sizes) and move to the proto stage. Consumes
    /// the builder.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn build(&mut self) -> Result<ProtoSandbox> {
        let config = take_stage(&mut self.inner, STAGE)?;
        let vm = set_up_vm_partition(&config)?;
        Ok(ProtoSandbox::new(vm, config))
    }
}

impl Default for SandboxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_positive(bytes: usize, what: &str) -> Result<()> {
    if bytes == 0 {
        return Err(HyperlightJsError::InvalidArgument(format!(
            "{what} must be strictly positive"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    #[test]
    fn setters_chain() {
        let mut builder = SandboxBuilder::new();
        builder
            .set_heap_size(1024 * 1024)
            .unwrap()
            .set_stack_size(64 * 1024)
            .unwrap()
            .set_input_buffer_size(4096)
            .unwrap()
            .set_output_buffer_size(4096)
            .unwrap();
    }

    #[test]
    fn zero_sizes_are_invalid() {
        let mut builder = SandboxBuilder::new();
        for result in [
            builder.set_heap_size(0).map(drop),
            builder.set_stack_size(0).map(drop),
            builder.set_input_buffer_size(0).map(drop),
            builder.set_output_buffer_size(0).map(drop),
        ] {
            assert_eq!(result.unwrap_err().code(), ErrorCode::InvalidArg);
        }
    }

    #[test]
    fn setters_after_an_invalid_argument_still_work() {
        let mut builder = SandboxBuilder::new();
        assert!(builder.set_heap_size(0).is_err());
        // invalid-arg does not consume the stage
        builder.set_heap_size(4096).unwrap();
    }

    #[cfg(feature = "inprocess")]
    #[test]
    fn build_consumes_the_builder() {
        let mut builder = SandboxBuilder::new();
        builder.build().unwrap();
        assert_eq!(builder.build().unwrap_err().code(), ErrorCode::Consumed);
        assert_eq!(
            builder.set_heap_size(4096).unwrap_err().code(),
            ErrorCode::Consumed
        );
    }
}
