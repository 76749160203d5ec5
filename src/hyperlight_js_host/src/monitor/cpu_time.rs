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

use std::time::Duration;

use super::{ExecutionMonitor, MonitorFuture};
use crate::Result;

/// Shortest and longest the watch will sleep between budget checks.
/// Half the remaining budget, clamped to this window, keeps the fire
/// latency near 1 ms without spinning on long budgets.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Kills a guest call once the vCPU thread has consumed a CPU-time
/// budget. Complements [`WallClockMonitor`]: a wall-clock deadline alone
/// is unfair to legitimately bursty compute on a loaded host.
///
/// `prepare` captures the calling thread's CPU clock and MUST therefore
/// run on the thread that will enter the vCPU; the launch protocol
/// guarantees this.
///
/// [`WallClockMonitor`]: super::WallClockMonitor
#[derive(Debug, Clone)]
pub struct CpuTimeMonitor {
    budget: Duration,
}

impl CpuTimeMonitor {
    /// Monitor that fires once the vCPU thread has burned `budget` of
    /// CPU time beyond its level at prepare.
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }
}

impl ExecutionMonitor for CpuTimeMonitor {
    fn name(&self) -> &'static str {
        "cpu-time"
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn prepare(&self) -> Result<MonitorFuture> {
        let clock = ThreadCpuClock::for_current_thread()?;
        let start = clock.now()?;
        let budget = self.budget;
        Ok(Box::pin(async move {
            loop {
                let spent = match clock.now() {
                    Ok(now) => now.saturating_sub(start),
                    Err(e) => {
                        // Fail closed: a monitor that cannot read its
                        // clock kills the guest rather than silently
                        // stopping to watch it.
                        log::error!(
                            "cpu-time monitor lost its thread clock ({e}); treating the budget as exhausted"
                        );
                        return;
                    }
                };
                let remaining = budget.saturating_sub(spent);
                if remaining.is_zero() {
                    return;
                }
                tokio::time::sleep(poll_interval(remaining)).await;
            }
        }))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn prepare(&self) -> Result<MonitorFuture> {
        // Fail closed: without a per-thread CPU clock the call must not
        // run unmonitored.
        Err(crate::new_error!(
            "cpu-time monitoring is not supported on this platform"
        ))
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn poll_interval(remaining: Duration) -> Duration {
    (remaining / 2).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// A clock measuring the CPU time consumed by one specific thread.
/// The clock id stays valid from any thread for as long as the target
/// thread lives.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone, Copy)]
struct ThreadCpuClock {
    clock_id: libc::clockid_t,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl ThreadCpuClock {
    fn for_current_thread() -> Result<Self> {
        let mut clock_id: libc::clockid_t = 0;
        // SAFETY: pthread_self() is always a valid thread handle for the
        // calling thread, and clock_id points at a live clockid_t.
        let rc = unsafe { libc::pthread_getcpuclockid(libc::pthread_self(), &mut clock_id) };
        if rc != 0 {
            return Err(crate::new_error!(
                "pthread_getcpuclockid failed with {}",
                rc
            ));
        }
        Ok(Self { clock_id })
    }

    fn now(&self) -> Result<Duration> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts points at a live timespec for the duration of the
        // call.
        let rc = unsafe { libc::clock_gettime(self.clock_id, &mut ts) };
        if rc != 0 {
            return Err(crate::new_error!(
                "clock_gettime failed with errno {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }
}
