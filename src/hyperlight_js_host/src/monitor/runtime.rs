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

use std::sync::OnceLock;

use tokio::runtime::Runtime;

use crate::{Result, new_error};

/// Worker count for the shared monitor runtime. Read once, at first use.
pub(crate) const MONITOR_THREADS_ENV: &str = "HYPERLIGHT_MONITOR_THREADS";

const DEFAULT_MONITOR_THREADS: usize = 2;

static SHARED: OnceLock<Runtime> = OnceLock::new();

/// The process-wide runtime that hosts watch futures. Initialized
/// lazily on first monitor use; the thread count is fixed at first
/// initialization and never reconfigured.
pub(crate) fn shared_runtime() -> Result<&'static Runtime> {
    if let Some(runtime) = SHARED.get() {
        return Ok(runtime);
    }
    let workers = worker_count(std::env::var(MONITOR_THREADS_ENV).ok().as_deref());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_time()
        .thread_name("hyperlight-js-monitor")
        .build()
        .map_err(|e| new_error!("failed to start the monitor runtime: {}", e))?;
    // A racing initializer may have won; its runtime is kept and ours
    // is dropped unused.
    Ok(SHARED.get_or_init(|| runtime))
}

fn worker_count(raw: Option<&str>) -> usize {
    raw.and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|count| *count > 0)
        .unwrap_or(DEFAULT_MONITOR_THREADS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_defaults_to_two() {
        assert_eq!(worker_count(None), 2);
    }

    #[test]
    fn worker_count_parses_positive_integers() {
        assert_eq!(worker_count(Some("4")), 4);
        assert_eq!(worker_count(Some(" 8 ")), 8);
    }

    #[test]
    fn worker_count_falls_back_on_nonsense() {
        assert_eq!(worker_count(Some("0")), 2);
        assert_eq!(worker_count(Some("-3")), 2);
        assert_eq!(worker_count(Some("many")), 2);
        assert_eq!(worker_count(Some("")), 2);
    }

    #[test]
    fn shared_runtime_initializes_once() {
        let first = shared_runtime().unwrap() as *const Runtime;
        let second = shared_runtime().unwrap() as *const Runtime;
        assert_eq!(first, second);
    }
}
