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

/// Kills a guest call once a wall-clock deadline passes, whether or not
/// the guest is burning CPU. Complements [`CpuTimeMonitor`]: CPU time
/// alone misses guests that hold host resources while idle.
///
/// [`CpuTimeMonitor`]: super::CpuTimeMonitor
#[derive(Debug, Clone)]
pub struct WallClockMonitor {
    timeout: Duration,
}

impl WallClockMonitor {
    /// Monitor that fires `timeout` after the watch starts.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ExecutionMonitor for WallClockMonitor {
    fn name(&self) -> &'static str {
        "wall-clock"
    }

    fn prepare(&self) -> Result<MonitorFuture> {
        let timeout = self.timeout;
        // The sleep must be constructed inside the async block so the
        // timer is acquired on the monitor runtime, not the calling
        // thread.
        Ok(Box::pin(async move {
            tokio::time::sleep(timeout).await;
        }))
    }
}
