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

use thiserror::Error;

use hyperlight_js_common::wire::WireError;

/// The machine-readable discriminant every failure maps to. The code is
/// the contract; the message on the error itself is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A validated input failed a constraint.
    InvalidArg,
    /// An operation was invoked on a stage already consumed by its
    /// terminating transition.
    Consumed,
    /// A call was attempted on a sandbox whose poisoned flag is set.
    Poisoned,
    /// The current call was terminated by a monitor or an explicit kill.
    Cancelled,
    /// The guest exhausted its stack.
    StackOverflow,
    /// The guest aborted.
    GuestAbort,
    /// Hypervisor allocation, snapshot/restore, engine bootstrap, or
    /// monitor preparation failed.
    Internal,
}

impl ErrorCode {
    /// The stable wire form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArg => "invalid-arg",
            ErrorCode::Consumed => "consumed",
            ErrorCode::Poisoned => "poisoned",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::StackOverflow => "stack-overflow",
            ErrorCode::GuestAbort => "guest-abort",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type for hyperlight-js host operations.
#[derive(Debug, Error)]
pub enum HyperlightJsError {
    /// A validated input failed a constraint.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The stage was already consumed by its terminating transition.
    #[error("{0} has already been consumed")]
    Consumed(&'static str),

    /// The sandbox is poisoned; only restore, unload, and the
    /// poisoned-flag read are permitted.
    #[error("sandbox is poisoned; restore a snapshot or unload to recover")]
    Poisoned,

    /// Guest execution was cancelled by a monitor or an explicit kill.
    #[error("execution was cancelled by the host")]
    ExecutionCanceledByHost,

    /// The guest exhausted its stack.
    #[error("guest stack overflow")]
    StackOverflow,

    /// The guest aborted, either through the abort host call or an
    /// unrecoverable engine error.
    #[error("guest aborted with code {0}: {1}")]
    GuestAborted(u8, String),

    /// The snapshot handed to `restore` was taken from a different
    /// sandbox.
    #[error("snapshot was taken from a different sandbox")]
    SnapshotSandboxMismatch,

    /// A JSON value could not be converted.
    #[error("error converting JSON: {0}")]
    JsonConversionFailure(#[from] serde_json::Error),

    /// An event-buffer frame could not be encoded or decoded.
    #[error("wire format failure: {0}")]
    WireFormatFailure(#[from] WireError),

    /// A generic internal failure.
    #[error("{0}")]
    Error(String),
}

impl HyperlightJsError {
    /// The machine-readable code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            HyperlightJsError::InvalidArgument(_) => ErrorCode::InvalidArg,
            HyperlightJsError::Consumed(_) => ErrorCode::Consumed,
            HyperlightJsError::Poisoned => ErrorCode::Poisoned,
            HyperlightJsError::ExecutionCanceledByHost => ErrorCode::Cancelled,
            HyperlightJsError::StackOverflow => ErrorCode::StackOverflow,
            HyperlightJsError::GuestAborted(_, _) => ErrorCode::GuestAbort,
            HyperlightJsError::SnapshotSandboxMismatch => ErrorCode::InvalidArg,
            HyperlightJsError::JsonConversionFailure(_) => ErrorCode::Internal,
            HyperlightJsError::WireFormatFailure(_) => ErrorCode::Internal,
            HyperlightJsError::Error(_) => ErrorCode::Internal,
        }
    }
}

/// The result type for hyperlight-js host operations.
pub type Result<T> = core::result::Result<T, HyperlightJsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_maps_to_exactly_one_code() {
        let cases: Vec<(HyperlightJsError, &str)> = vec![
            (
                HyperlightJsError::InvalidArgument("x".to_string()),
                "invalid-arg",
            ),
            (HyperlightJsError::Consumed("SandboxBuilder"), "consumed"),
            (HyperlightJsError::Poisoned, "poisoned"),
            (HyperlightJsError::ExecutionCanceledByHost, "cancelled"),
            (HyperlightJsError::StackOverflow, "stack-overflow"),
            (
                HyperlightJsError::GuestAborted(1, "boom".to_string()),
                "guest-abort",
            ),
            (HyperlightJsError::SnapshotSandboxMismatch, "invalid-arg"),
            (HyperlightJsError::Error("x".to_string()), "internal"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code().as_str(), code, "{err}");
        }
    }

    #[test]
    fn messages_carry_the_stage_name() {
        let err = HyperlightJsError::Consumed("ProtoSandbox");
        assert_eq!(err.to_string(), "ProtoSandbox has already been consumed");
    }
}
