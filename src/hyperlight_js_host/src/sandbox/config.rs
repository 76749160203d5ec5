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

/// Memory configuration a sandbox is built with. Accumulated by the
/// builder stage and fixed once `build` runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfiguration {
    guest_heap_size: usize,
    guest_stack_size: usize,
    input_data_size: usize,
    output_data_size: usize,
}

impl SandboxConfiguration {
    /// Default size of the guest engine heap.
    pub const DEFAULT_GUEST_HEAP_SIZE: usize = 16 * 1024 * 1024;
    /// Default size of the guest stack.
    pub const DEFAULT_GUEST_STACK_SIZE: usize = 1024 * 1024;
    /// Default capacity of the event input buffer.
    pub const DEFAULT_INPUT_DATA_SIZE: usize = 64 * 1024;
    /// Default capacity of the result output buffer.
    pub const DEFAULT_OUTPUT_DATA_SIZE: usize = 64 * 1024;

    /// Size of the guest engine heap, page-aligned.
    pub fn guest_heap_size(&self) -> usize {
        self.guest_heap_size
    }

    /// Size of the guest stack, page-aligned.
    pub fn guest_stack_size(&self) -> usize {
        self.guest_stack_size
    }

    /// Capacity of the event input buffer.
    pub fn input_data_size(&self) -> usize {
        self.input_data_size
    }

    /// Capacity of the result output buffer.
    pub fn output_data_size(&self) -> usize {
        self.output_data_size
    }

    pub(crate) fn set_guest_heap_size(&mut self, bytes: usize) {
        self.guest_heap_size = align_to_page(bytes);
    }

    pub(crate) fn set_guest_stack_size(&mut self, bytes: usize) {
        self.guest_stack_size = align_to_page(bytes);
    }

    pub(crate) fn set_input_data_size(&mut self, bytes: usize) {
        self.input_data_size = bytes;
    }

    pub(crate) fn set_output_data_size(&mut self, bytes: usize) {
        self.output_data_size = bytes;
    }
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        Self {
            guest_heap_size: align_to_page(Self::DEFAULT_GUEST_HEAP_SIZE),
            guest_stack_size: align_to_page(Self::DEFAULT_GUEST_STACK_SIZE),
            input_data_size: Self::DEFAULT_INPUT_DATA_SIZE,
            output_data_size: Self::DEFAULT_OUTPUT_DATA_SIZE,
        }
    }
}

/// Guest memory regions are mapped in whole pages; round the requested
/// size up to the host page size.
fn align_to_page(bytes: usize) -> usize {
    let page = page_size::get();
    bytes.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_positive_and_page_aligned() {
        let config = SandboxConfiguration::default();
        let page = page_size::get();
        assert!(config.guest_heap_size() > 0);
        assert_eq!(config.guest_heap_size() % page, 0);
        assert_eq!(config.guest_stack_size() % page, 0);
        assert_eq!(config.input_data_size(), 64 * 1024);
        assert_eq!(config.output_data_size(), 64 * 1024);
    }

    #[test]
    fn heap_and_stack_round_up_to_the_page_size() {
        let mut config = SandboxConfiguration::default();
        config.set_guest_heap_size(1);
        assert_eq!(config.guest_heap_size(), page_size::get());
        config.set_guest_stack_size(page_size::get() + 1);
        assert_eq!(config.guest_stack_size(), 2 * page_size::get());
    }

    #[test]
    fn buffer_sizes_are_taken_verbatim() {
        let mut config = SandboxConfiguration::default();
        config.set_input_data_size(100);
        config.set_output_data_size(200);
        assert_eq!(config.input_data_size(), 100);
        assert_eq!(config.output_data_size(), 200);
    }
}
