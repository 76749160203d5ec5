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

//! Lifecycle, call-path, and snapshot/restore behavior against the
//! in-process driver.

#![cfg(feature = "inprocess")]

use hyperlight_js_host::{CallOptions, ErrorCode, SandboxBuilder};
use hyperlight_js_testing::{
    CALCULATOR_HANDLER, ECHO_HANDLER, RECURSING_HANDLER, THROWING_HANDLER, init_test_logging,
    loaded_echo_sandbox, loaded_sandbox_with,
};
use serde_json::json;

#[test]
fn echo_round_trips_the_event() {
    init_test_logging();
    let mut sandbox = loaded_echo_sandbox().unwrap();
    let result = sandbox
        .call_handler("echo", &json!({"x": 1}), &CallOptions::default())
        .unwrap();
    assert_eq!(result, json!({"x": 1}));
    assert!(!sandbox.poisoned());
}

#[test]
fn echo_round_trips_every_json_shape() {
    let mut sandbox = loaded_echo_sandbox().unwrap();
    let values = [
        json!(null),
        json!(true),
        json!(0),
        json!(-12.5),
        json!("päivää ✓"),
        json!([1, [2, [3]], {"k": "v"}]),
        json!({"nested": {"deeply": {"value": [null, false]}}}),
    ];
    for value in values {
        let result = sandbox
            .call_handler("echo", &value, &CallOptions::default())
            .unwrap();
        assert_eq!(result, value, "echo mangled {value}");
    }
}

#[test]
fn calculator_covers_the_four_operations() {
    let mut sandbox = loaded_sandbox_with(&[("calc", CALCULATOR_HANDLER)]).unwrap();
    let cases = [
        (json!({"a": 10, "b": 5, "operation": "add"}), json!(15)),
        (json!({"a": 10, "b": 5, "operation": "subtract"}), json!(5)),
        (json!({"a": 10, "b": 5, "operation": "multiply"}), json!(50)),
        (json!({"a": 100, "b": 25, "operation": "divide"}), json!(4)),
        (
            json!({"a": 100, "b": 0, "operation": "divide"}),
            json!("Error: Division by zero"),
        ),
    ];
    for (event, expected) in cases {
        let result = sandbox
            .call_handler("calc", &event, &CallOptions::default())
            .unwrap();
        assert_eq!(result["result"], expected, "for {event}");
    }
}

#[test]
fn builder_rejects_zero_sizes() {
    let mut builder = SandboxBuilder::new();
    assert_eq!(
        builder.set_heap_size(0).unwrap_err().code(),
        ErrorCode::InvalidArg
    );
    assert_eq!(
        builder.set_stack_size(0).unwrap_err().code(),
        ErrorCode::InvalidArg
    );
    assert_eq!(
        builder.set_input_buffer_size(0).unwrap_err().code(),
        ErrorCode::InvalidArg
    );
    assert_eq!(
        builder.set_output_buffer_size(0).unwrap_err().code(),
        ErrorCode::InvalidArg
    );
}

#[test]
fn double_consumption_fails_with_consumed_at_every_stage() {
    // Builder
    let mut builder = SandboxBuilder::new();
    let mut proto = builder.build().unwrap();
    assert_eq!(builder.build().unwrap_err().code(), ErrorCode::Consumed);

    // Proto
    let mut runtime = proto.load_runtime().unwrap();
    assert_eq!(proto.load_runtime().unwrap_err().code(), ErrorCode::Consumed);

    // Loaded-runtime
    runtime.add_handler("echo", ECHO_HANDLER).unwrap();
    let mut sandbox = runtime.get_loaded().unwrap();
    assert_eq!(runtime.get_loaded().unwrap_err().code(), ErrorCode::Consumed);
    assert_eq!(
        runtime.add_handler("x", ECHO_HANDLER).unwrap_err().code(),
        ErrorCode::Consumed
    );

    // Handlers-loaded
    sandbox.unload().unwrap();
    assert_eq!(sandbox.unload().unwrap_err().code(), ErrorCode::Consumed);
    assert_eq!(
        sandbox
            .call_handler("echo", &json!(1), &CallOptions::default())
            .unwrap_err()
            .code(),
        ErrorCode::Consumed
    );
    assert_eq!(sandbox.snapshot().unwrap_err().code(), ErrorCode::Consumed);
}

#[test]
fn registry_edits_and_boundaries() {
    let mut proto = SandboxBuilder::new().build().unwrap();
    let mut runtime = proto.load_runtime().unwrap();

    assert_eq!(
        runtime.add_handler("", ECHO_HANDLER).unwrap_err().code(),
        ErrorCode::InvalidArg
    );
    assert_eq!(
        runtime.remove_handler("").unwrap_err().code(),
        ErrorCode::InvalidArg
    );

    runtime.add_handler("a", ECHO_HANDLER).unwrap();
    runtime.add_handler("b", ECHO_HANDLER).unwrap();
    assert_eq!(runtime.handler_names().unwrap(), vec!["a", "b"]);
    assert!(runtime.remove_handler("a").unwrap());
    assert!(!runtime.remove_handler("a").unwrap());
    runtime.clear_handlers().unwrap();
    assert!(runtime.handler_names().unwrap().is_empty());
}

#[test]
fn call_validation_boundaries() {
    let mut sandbox = loaded_echo_sandbox().unwrap();

    assert_eq!(
        sandbox
            .call_handler("", &json!(1), &CallOptions::default())
            .unwrap_err()
            .code(),
        ErrorCode::InvalidArg
    );
    assert_eq!(
        sandbox
            .call_handler("missing", &json!(1), &CallOptions::default())
            .unwrap_err()
            .code(),
        ErrorCode::InvalidArg
    );
    for options in [
        CallOptions::default().with_wall_clock_timeout_ms(0),
        CallOptions::default().with_wall_clock_timeout_ms(4_000_000),
        CallOptions::default().with_cpu_timeout_ms(0),
        CallOptions::default().with_cpu_timeout_ms(4_000_000),
    ] {
        assert_eq!(
            sandbox
                .call_handler("echo", &json!(1), &options)
                .unwrap_err()
                .code(),
            ErrorCode::InvalidArg,
            "for {options:?}"
        );
    }
    // None of the rejections touched the guest.
    assert!(!sandbox.poisoned());
}

#[test]
fn oversized_events_fail_with_internal_and_do_not_poison() {
    // Big enough for the handler manifest, far too small for the event
    // below.
    let mut builder = SandboxBuilder::new();
    builder.set_input_buffer_size(128).unwrap();
    let mut proto = builder.build().unwrap();
    let mut runtime = proto.load_runtime().unwrap();
    runtime.add_handler("echo", ECHO_HANDLER).unwrap();
    let mut sandbox = runtime.get_loaded().unwrap();

    let event = json!("x".repeat(512));
    let err = sandbox
        .call_handler("echo", &event, &CallOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(!sandbox.poisoned());

    // A small event still fits and works.
    let result = sandbox
        .call_handler("echo", &json!(1), &CallOptions::default())
        .unwrap();
    assert_eq!(result, json!(1));
}

#[test]
fn compile_errors_surface_as_internal() {
    let mut proto = SandboxBuilder::new().build().unwrap();
    let mut runtime = proto.load_runtime().unwrap();
    runtime.add_handler("ok", ECHO_HANDLER).unwrap();
    runtime
        .add_handler("broken", "function handler( { nope")
        .unwrap();
    assert_eq!(runtime.get_loaded().unwrap_err().code(), ErrorCode::Internal);
}

#[test]
fn sources_without_a_handler_function_fail_compilation() {
    let mut proto = SandboxBuilder::new().build().unwrap();
    let mut runtime = proto.load_runtime().unwrap();
    runtime
        .add_handler("misnamed", "function notHandler(event) { return event; }")
        .unwrap();
    assert_eq!(runtime.get_loaded().unwrap_err().code(), ErrorCode::Internal);
}

#[test]
fn throwing_handlers_abort_and_poison() {
    let mut sandbox =
        loaded_sandbox_with(&[("echo", ECHO_HANDLER), ("boom", THROWING_HANDLER)]).unwrap();
    let snapshot = sandbox.snapshot().unwrap();

    let err = sandbox
        .call_handler("boom", &json!({}), &CallOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::GuestAbort);
    assert!(err.to_string().contains("handler exploded"));
    assert!(sandbox.poisoned());

    // Poisoned substate rejects everything but restore, unload, and the
    // flag read.
    assert_eq!(
        sandbox
            .call_handler("echo", &json!(1), &CallOptions::default())
            .unwrap_err()
            .code(),
        ErrorCode::Poisoned
    );
    assert_eq!(sandbox.snapshot().unwrap_err().code(), ErrorCode::Poisoned);

    sandbox.restore(&snapshot).unwrap();
    assert!(!sandbox.poisoned());
    let result = sandbox
        .call_handler("echo", &json!(2), &CallOptions::default())
        .unwrap();
    assert_eq!(result, json!(2));
}

#[test]
fn stack_exhaustion_surfaces_as_stack_overflow() {
    let mut sandbox = loaded_sandbox_with(&[("recurse", RECURSING_HANDLER)]).unwrap();
    let err = sandbox
        .call_handler("recurse", &json!(null), &CallOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::StackOverflow);
    assert!(sandbox.poisoned());
}

#[test]
fn snapshot_then_restore_preserves_observable_state() {
    let mut sandbox = loaded_echo_sandbox().unwrap();
    let before = sandbox
        .call_handler("echo", &json!({"probe": 1}), &CallOptions::default())
        .unwrap();

    let snapshot = sandbox.snapshot().unwrap();
    sandbox.restore(&snapshot).unwrap();
    assert!(!sandbox.poisoned());

    let after = sandbox
        .call_handler("echo", &json!({"probe": 1}), &CallOptions::default())
        .unwrap();
    assert_eq!(before, after);

    // Snapshots apply any number of times.
    sandbox.restore(&snapshot).unwrap();
    sandbox.restore(&snapshot).unwrap();
    assert!(!sandbox.poisoned());
}

#[test]
fn snapshots_do_not_apply_across_sandboxes() {
    let mut first = loaded_echo_sandbox().unwrap();
    let mut second = loaded_echo_sandbox().unwrap();
    let foreign = first.snapshot().unwrap();
    assert_eq!(
        second.restore(&foreign).unwrap_err().code(),
        ErrorCode::InvalidArg
    );
}

#[test]
fn snapshots_outlive_consumed_stages() {
    let mut sandbox = loaded_echo_sandbox().unwrap();
    let snapshot = sandbox.snapshot().unwrap();
    let clone = snapshot.clone();
    sandbox.unload().unwrap();
    drop(sandbox);
    // The handle stays usable (for inspection) after the stage is gone.
    assert!(clone.payload_size() > 0);
}

#[test]
fn unload_returns_a_fresh_registry() {
    let mut sandbox = loaded_sandbox_with(&[(
        "a",
        r#"function handler(event) { return "from a"; }"#,
    )])
    .unwrap();
    let result = sandbox
        .call_handler("a", &json!(null), &CallOptions::default())
        .unwrap();
    assert_eq!(result, json!("from a"));

    let mut runtime = sandbox.unload().unwrap();
    assert!(runtime.handler_names().unwrap().is_empty());

    runtime
        .add_handler("b", r#"function handler(event) { return "from b"; }"#)
        .unwrap();
    let mut sandbox = runtime.get_loaded().unwrap();
    assert_eq!(
        sandbox
            .call_handler("b", &json!(null), &CallOptions::default())
            .unwrap(),
        json!("from b")
    );
    // The old handler went away with the unload.
    assert_eq!(
        sandbox
            .call_handler("a", &json!(null), &CallOptions::default())
            .unwrap_err()
            .code(),
        ErrorCode::InvalidArg
    );
}

#[test]
fn unload_recovers_a_poisoned_sandbox() {
    let mut sandbox = loaded_sandbox_with(&[("boom", THROWING_HANDLER)]).unwrap();
    assert!(
        sandbox
            .call_handler("boom", &json!({}), &CallOptions::default())
            .is_err()
    );
    assert!(sandbox.poisoned());

    let mut runtime = sandbox.unload().unwrap();
    runtime.add_handler("echo", ECHO_HANDLER).unwrap();
    let mut sandbox = runtime.get_loaded().unwrap();
    assert!(!sandbox.poisoned());
    assert_eq!(
        sandbox
            .call_handler("echo", &json!(3), &CallOptions::default())
            .unwrap(),
        json!(3)
    );
}

#[test]
fn gc_can_be_skipped() {
    let mut sandbox = loaded_echo_sandbox().unwrap();
    let options = CallOptions::default().with_gc(false);
    assert_eq!(
        sandbox.call_handler("echo", &json!(1), &options).unwrap(),
        json!(1)
    );
    let options = CallOptions::default().with_gc(true);
    assert_eq!(
        sandbox.call_handler("echo", &json!(2), &options).unwrap(),
        json!(2)
    );
}

#[test]
fn interrupt_handle_outlives_the_sandbox() {
    let sandbox = loaded_echo_sandbox().unwrap();
    let handle = sandbox.interrupt_handle();
    assert!(!handle.dropped());
    drop(sandbox);
    assert!(handle.dropped());
}

#[test]
fn kill_between_calls_is_a_no_op_for_the_next_call() {
    let mut sandbox = loaded_echo_sandbox().unwrap();
    let handle = sandbox.interrupt_handle();
    // No call in progress: reports false and must not damage the next
    // call.
    assert!(!handle.kill());
    let result = sandbox
        .call_handler("echo", &json!("still alive"), &CallOptions::default())
        .unwrap();
    assert_eq!(result, json!("still alive"));
    assert!(!sandbox.poisoned());
}

#[test]
fn handlers_see_host_backed_clock_and_console() {
    let mut sandbox = loaded_sandbox_with(&[(
        "clock",
        r#"
function handler(event) {
    console.log("clock handler running");
    var t = Date.now();
    return t > 1600000000000;
}
"#,
    )])
    .unwrap();
    let result = sandbox
        .call_handler("clock", &json!(null), &CallOptions::default())
        .unwrap();
    assert_eq!(result, json!(true));
}
