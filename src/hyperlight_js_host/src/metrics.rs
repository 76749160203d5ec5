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

//! Metric names and recording helpers. The names are part of the
//! external interface; dashboards key on them.

use std::time::Duration;

use metrics::{counter, histogram};

/// Counter: guest executions cancelled by the host, monitor-driven or
/// manual.
pub(crate) static METRIC_GUEST_CANCELLATIONS: &str = "guest-cancellations-total";
/// Counter: calls terminated by a monitor, labelled with the winning
/// monitor's name.
pub(crate) static METRIC_MONITOR_TERMINATIONS: &str = "monitor-terminations-total";
/// Counter: handler calls that completed successfully.
pub(crate) static METRIC_HANDLER_CALLS: &str = "event-handler-calls-total";
/// Histogram: wall-clock duration of successful handler calls.
pub(crate) static METRIC_HANDLER_CALL_DURATION: &str = "event-handler-call-duration-seconds";

pub(crate) static LABEL_MONITOR_TYPE: &str = "monitor-type";
pub(crate) static LABEL_HANDLER: &str = "handler";

pub(crate) fn record_guest_cancellation() {
    counter!(METRIC_GUEST_CANCELLATIONS).increment(1);
}

pub(crate) fn record_monitor_termination(monitor: &'static str) {
    counter!(METRIC_MONITOR_TERMINATIONS, LABEL_MONITOR_TYPE => monitor).increment(1);
}

pub(crate) fn record_handler_call(handler: &str, duration: Duration) {
    counter!(METRIC_HANDLER_CALLS, LABEL_HANDLER => handler.to_string()).increment(1);
    histogram!(METRIC_HANDLER_CALL_DURATION, LABEL_HANDLER => handler.to_string())
        .record(duration.as_secs_f64());
}
