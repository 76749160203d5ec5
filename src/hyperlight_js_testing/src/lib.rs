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

//! Handler fixtures and sandbox construction helpers for the
//! hyperlight-js test suites.

use hyperlight_js_host::{LoadedSandbox, Result, SandboxBuilder};

/// Returns its event unchanged.
pub const ECHO_HANDLER: &str = "function handler(event) { return event; }";

/// Computes `event.result = event.a <op> event.b` for
/// `op in {add, subtract, multiply, divide}`.
pub const CALCULATOR_HANDLER: &str = r#"
function handler(event) {
    var a = event.a;
    var b = event.b;
    var result;
    switch (event.operation) {
        case "add":
            result = a + b;
            break;
        case "subtract":
            result = a - b;
            break;
        case "multiply":
            result = a * b;
            break;
        case "divide":
            if (b === 0) {
                result = "Error: Division by zero";
            } else {
                result = a / b;
            }
            break;
        default:
            result = "Error: Unknown operation: " + event.operation;
    }
    event.result = result;
    return event;
}
"#;

/// Busy-loops for `event.ms` milliseconds of wall time, burning CPU the
/// whole way.
pub const SPIN_HANDLER: &str = r#"
function handler(event) {
    var deadline = Date.now() + event.ms;
    while (Date.now() < deadline) {}
    return { done: true };
}
"#;

/// Throws on every invocation.
pub const THROWING_HANDLER: &str =
    r#"function handler(event) { throw new Error("handler exploded"); }"#;

/// Recurses without a base case until the guest stack is exhausted.
pub const RECURSING_HANDLER: &str = "function handler(event) { return handler(event) + 1; }";

/// Sets a marker global; pairs with [`GLOBAL_READER_HANDLER`] to make
/// handler side effects observable from a later call.
pub const GLOBAL_WRITER_HANDLER: &str =
    "function handler(event) { globalThis.__touched = true; return true; }";

/// Reads the marker global set by [`GLOBAL_WRITER_HANDLER`].
pub const GLOBAL_READER_HANDLER: &str =
    "function handler(event) { return globalThis.__touched === true; }";

/// Build a sandbox with default configuration and the given handlers
/// loaded.
pub fn loaded_sandbox_with(handlers: &[(&str, &str)]) -> Result<LoadedSandbox> {
    let mut builder = SandboxBuilder::new();
    let mut proto = builder.build()?;
    let mut runtime = proto.load_runtime()?;
    for (name, source) in handlers {
        runtime.add_handler(name, source)?;
    }
    runtime.get_loaded()
}

/// A sandbox with just the echo handler, registered as `"echo"`.
pub fn loaded_echo_sandbox() -> Result<LoadedSandbox> {
    loaded_sandbox_with(&[("echo", ECHO_HANDLER)])
}

/// Initialize test logging; safe to call from every test.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
