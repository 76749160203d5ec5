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

//! Definitions shared between the hyperlight-js host and the guest
//! runtime. Everything that crosses the VM boundary is described here:
//! the length-prefixed JSON frames carried in the event buffers, the
//! host-call ports with their request/reply payloads, and the selector
//! the host uses to dispatch a call into the guest.

/// The guest-call selector and the handler manifest the host ships to the
/// guest when handlers are compiled.
pub mod guest;
/// Host-call ports and their payload encodings.
pub mod hostcall;
/// The length-prefixed JSON wire format used by the event buffers.
pub mod wire;
