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

//! Host-side dispatch for the narrow host-call surface. The vCPU exits,
//! the host serves the call, the vCPU resumes; a call the host cannot
//! serve aborts the guest.

use std::time::{SystemTime, UNIX_EPOCH};

use hyperlight_js_common::hostcall::{
    GuestLogRecord, HostCallPort, abort_code, decode_abort, encode_time_reply,
};

use crate::{HyperlightJsError, Result, new_error};

/// Log target guest records are re-emitted under.
pub(crate) const GUEST_LOG_TARGET: &str = "hyperlight-js-guest";

/// Serve one host call. `Ok` carries the reply bytes to resume the guest
/// with; `Err` means the guest must be aborted.
pub(crate) fn handle_host_call(port: u16, data: &[u8]) -> Result<Vec<u8>> {
    match HostCallPort::try_from(port) {
        Ok(HostCallPort::CurrentTime) => current_time_reply(),
        Ok(HostCallPort::Log) => {
            forward_guest_log(data)?;
            Ok(Vec::new())
        }
        Ok(HostCallPort::Abort) => {
            let (code, message) = decode_abort(data);
            Err(HyperlightJsError::GuestAborted(code, message))
        }
        Err(unknown) => Err(new_error!(
            "guest issued a host call on unknown port {}",
            unknown
        )),
    }
}

/// Map a host-call failure onto the abort payload handed back to the
/// guest.
pub(crate) fn abort_payload_for(e: &HyperlightJsError) -> (u8, String) {
    match e {
        HyperlightJsError::GuestAborted(code, message) => (*code, message.clone()),
        other => (abort_code::HOST_CALL_FAILED, other.to_string()),
    }
}

fn current_time_reply() -> Result<Vec<u8>> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| new_error!("host clock is before the Unix epoch: {}", e))?;
    Ok(encode_time_reply(now.as_secs(), u64::from(now.subsec_nanos())).to_vec())
}

fn forward_guest_log(data: &[u8]) -> Result<()> {
    let record: GuestLogRecord = serde_json::from_slice(data)?;
    log::log!(
        target: GUEST_LOG_TARGET,
        record.level.as_log_level(),
        "[{}] {}",
        record.source,
        record.message
    );
    Ok(())
}
