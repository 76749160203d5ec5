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

//! The seam between the sandbox core and whatever actually executes the
//! guest. The core drives a [`Hypervisor`] through the exit-reason loop
//! in [`VirtualCpu`]; drivers map their native exits onto [`VmExit`] and
//! honor the shared [`VcpuInterrupt`] cancellation state.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{Span, instrument};

use hyperlight_js_common::guest::GuestCall;

use crate::HyperlightJsError::ExecutionCanceledByHost;
use crate::hostcall::abort_payload_for;
use crate::{HyperlightJsError, Result, hostcall, log_then_return, metrics};

/// In-process execution of the guest runtime, for development and
/// testing without hardware virtualization.
#[cfg(feature = "inprocess")]
pub(crate) mod in_process;

/// These are the generic exit reasons the core can handle from a driver.
/// A driver's `run` method is responsible for mapping its native exit
/// reasons onto these.
pub enum VmExit {
    /// The vCPU halted: the dispatched guest call completed.
    Halt(),
    /// The guest issued a host call on the given port with the given
    /// payload; the core serves it and resumes the vCPU.
    HostCall(u16, Vec<u8>),
    /// The vCPU execution has been cancelled.
    Cancelled(),
    /// The guest exhausted its stack.
    StackOverflow(),
    /// The guest aborted with a code and message.
    GuestAbort(u8, String),
    /// The vCPU exited for a reason the core does not handle.
    Unknown(String),
    /// The operation should be retried; for example a run call can
    /// return EAGAIN on Linux.
    Retry(),
}

/// What the core hands back to the driver after serving a host call.
pub enum HostCallResult {
    /// The call succeeded; resume the guest with these reply bytes.
    Reply(Vec<u8>),
    /// The call failed; the guest must be aborted.
    Abort {
        /// Abort code for the guest.
        code: u8,
        /// Human-readable reason.
        message: String,
    },
}

/// A common set of driver functionality the sandbox core runs against.
///
/// The vCPU executes on the thread that calls [`Hypervisor::run`]; a
/// driver whose native execution happens elsewhere must still present
/// that illusion (and must account CPU time to the calling thread, since
/// the CPU-time monitor captures the calling thread's clock).
pub trait Hypervisor: Debug {
    /// Queue `call` as the next guest entry. Fails if a call is already
    /// queued.
    fn queue_guest_call(&mut self, call: GuestCall) -> Result<()>;

    /// Run the vCPU until the next exit.
    fn run(&mut self) -> Result<VmExit>;

    /// Resume the guest after a [`VmExit::HostCall`] with the host's
    /// result.
    fn complete_host_call(&mut self, result: HostCallResult) -> Result<()>;

    /// Write an encoded frame into the guest input buffer.
    fn write_input(&mut self, frame: &[u8]) -> Result<()>;

    /// Read the frame the guest left in the output buffer.
    fn read_output(&mut self) -> Result<Vec<u8>>;

    /// Capacity of the guest input buffer, fixed at build time.
    fn input_capacity(&self) -> usize;

    /// Capacity of the guest output buffer, fixed at build time.
    fn output_capacity(&self) -> usize;

    /// Capture the complete vCPU and guest memory state as opaque bytes.
    fn snapshot(&mut self) -> Result<Vec<u8>>;

    /// Overwrite the live vCPU and guest memory state with a payload
    /// previously produced by [`Hypervisor::snapshot`] on this driver.
    /// On failure the live state must be left untouched.
    fn restore(&mut self, payload: &[u8]) -> Result<()>;

    /// The cancellation state shared between this driver and the core.
    fn interrupt(&self) -> Arc<VcpuInterrupt>;

    /// Get an [`InterruptHandle`] to the underlying vCPU.
    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        self.interrupt()
    }
}

/// A virtual CPU that can be run until an exit occurs.
pub(crate) struct VirtualCpu {}

impl VirtualCpu {
    /// Enter the vCPU for one guest call and run it until the guest
    /// halts, serving host calls along the way.
    #[instrument(err(Debug), skip_all, fields(call = call.name()), parent = Span::current(), level = "Trace")]
    pub(crate) fn dispatch(hv: &mut dyn Hypervisor, call: GuestCall) -> Result<()> {
        let interrupt = hv.interrupt();
        interrupt.enter_call();
        let res = Self::run_to_halt(hv, call);
        interrupt.finish_call();
        res
    }

    fn run_to_halt(hv: &mut dyn Hypervisor, call: GuestCall) -> Result<()> {
        hv.queue_guest_call(call)?;
        loop {
            match hv.run() {
                Ok(VmExit::Halt()) => break,
                Ok(VmExit::HostCall(port, data)) => {
                    match hostcall::handle_host_call(port, &data) {
                        Ok(reply) => hv.complete_host_call(HostCallResult::Reply(reply))?,
                        Err(e) => {
                            // A failed host call aborts the guest.
                            let (code, message) = abort_payload_for(&e);
                            hv.complete_host_call(HostCallResult::Abort {
                                code,
                                message: message.clone(),
                            })?;
                            return Err(match e {
                                HyperlightJsError::GuestAborted(_, _) => e,
                                _ => HyperlightJsError::GuestAborted(code, message),
                            });
                        }
                    }
                }
                Ok(VmExit::Cancelled()) => {
                    metrics::record_guest_cancellation();
                    log_then_return!(ExecutionCanceledByHost);
                }
                Ok(VmExit::StackOverflow()) => {
                    return Err(HyperlightJsError::StackOverflow);
                }
                Ok(VmExit::GuestAbort(code, message)) => {
                    return Err(HyperlightJsError::GuestAborted(code, message));
                }
                Ok(VmExit::Unknown(reason)) => {
                    log_then_return!("Unexpected VM exit: {}", reason);
                }
                Ok(VmExit::Retry()) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// A trait for handling interrupts to a sandbox's vCPU.
pub trait InterruptHandle: Debug + Send + Sync {
    /// Interrupt the corresponding sandbox from running.
    ///
    /// - If this is called while the vCPU is running, it will interrupt
    ///   the vCPU and return `true`.
    /// - If this is called while the vCPU is not running (for example
    ///   during a host call), the vCPU will not be re-entered for the
    ///   remainder of the current call, and this returns `false`. With
    ///   no call in progress at all, the pending kill only survives
    ///   until the next call begins: the flag is cleared at call entry.
    ///
    /// # Note
    /// This function blocks until the vCPU thread has actually stopped
    /// executing guest code.
    fn kill(&self) -> bool;

    /// Returns true if the corresponding sandbox has been dropped.
    fn dropped(&self) -> bool;
}

/// The cancellation state shared between the core, the drivers, and
/// every [`InterruptHandle`] clone. Drivers observe
/// [`VcpuInterrupt::cancel_requested`] at their safe points and exit
/// with [`VmExit::Cancelled`] when it is set.
#[derive(Debug)]
pub struct VcpuInterrupt {
    /// Invariant: the vCPU is executing a call => bit 63 is set. Bits
    /// 0-62 count vCPU entries, so an interruptor that observed run N
    /// stops nudging once run N+1 starts instead of harassing the new
    /// run with stale signals.
    running: AtomicU64,
    /// Invariant: the vCPU is executing => `tid` is the thread it is
    /// executing on.
    tid: AtomicU64,
    /// Set the moment `kill()` is called; cleared when the vCPU stops
    /// and at every call entry. While set, the vCPU must not (re-)enter
    /// the guest, which also keeps a kill delivered during a host call
    /// from being lost.
    cancel_requested: AtomicBool,
    /// Whether the owning sandbox has been dropped.
    dropped: AtomicBool,
    /// Delay between signal nudges to the vCPU thread.
    retry_delay: Duration,
    /// Offset from SIGRTMIN of the signal used to nudge the vCPU thread.
    #[cfg_attr(not(unix), allow(dead_code))]
    sig_rt_min_offset: u8,
}

impl VcpuInterrupt {
    const RUNNING_BIT: u64 = 1 << 63;
    const MAX_GENERATION: u64 = Self::RUNNING_BIT - 1;

    /// Signal offset used for vCPU nudging; drivers that need a signal
    /// handler register it for `SIGRTMIN() + VCPU_SIGNAL_OFFSET`.
    pub const VCPU_SIGNAL_OFFSET: u8 = 0;

    /// Fresh, quiescent cancellation state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicU64::new(0),
            tid: AtomicU64::new(0),
            cancel_requested: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
            retry_delay: Duration::from_micros(500),
            sig_rt_min_offset: Self::VCPU_SIGNAL_OFFSET,
        })
    }

    /// Mark the calling thread as the vCPU thread and the vCPU as
    /// running. Clears any kill left pending from a quiescent period.
    pub fn enter_call(&self) {
        self.cancel_requested.store(false, Ordering::Relaxed);
        #[cfg(unix)]
        self.tid
            .store(unsafe { libc::pthread_self() } as u64, Ordering::Relaxed);
        let _ = self
            .running
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |raw| {
                let generation = raw & !Self::RUNNING_BIT;
                if generation == Self::MAX_GENERATION {
                    return Some(Self::RUNNING_BIT);
                }
                Some((generation + 1) | Self::RUNNING_BIT)
            });
    }

    /// Mark the vCPU as no longer running.
    pub fn finish_call(&self) {
        self.running.fetch_and(!Self::RUNNING_BIT, Ordering::Relaxed);
        self.cancel_requested.store(false, Ordering::Relaxed);
    }

    /// Whether a kill has been requested for the current call.
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dropped(&self) {
        self.dropped.store(true, Ordering::Relaxed);
    }

    fn get_running_and_generation(&self) -> (bool, u64) {
        let raw = self.running.load(Ordering::Relaxed);
        (raw & Self::RUNNING_BIT != 0, raw & !Self::RUNNING_BIT)
    }

    /// Nudge the vCPU thread until it stops running or a new run
    /// generation starts. Returns whether the vCPU was running when the
    /// kill landed.
    fn wait_for_exit(&self) -> bool {
        let mut was_running = false;
        let mut target_generation: Option<u64> = None;

        loop {
            let (running, generation) = self.get_running_and_generation();
            if !running {
                break;
            }
            match target_generation {
                None => target_generation = Some(generation),
                // A new run started; it is not ours to kill.
                Some(expected) if expected != generation => break,
                _ => {}
            }
            was_running = true;
            #[cfg(unix)]
            {
                let signal_number = libc::SIGRTMIN() + self.sig_rt_min_offset as libc::c_int;
                unsafe {
                    libc::pthread_kill(self.tid.load(Ordering::Relaxed) as _, signal_number);
                }
            }
            std::thread::sleep(self.retry_delay);
        }

        was_running
    }
}

impl InterruptHandle for VcpuInterrupt {
    fn kill(&self) -> bool {
        self.cancel_requested.store(true, Ordering::Relaxed);
        self.wait_for_exit()
    }

    fn dropped(&self) -> bool {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Register the no-op handler for the vCPU nudge signal. Without a
/// handler the raw signal would terminate the process. Idempotent.
#[cfg(unix)]
pub(crate) fn register_vcpu_signal_handler() {
    use std::sync::OnceLock;

    static REGISTERED: OnceLock<()> = OnceLock::new();
    REGISTERED.get_or_init(|| {
        extern "C" fn handle_signal(_: i32, _: *mut libc::siginfo_t, _: *mut libc::c_void) {}
        let signal_number =
            vmm_sys_util::signal::SIGRTMIN() + VcpuInterrupt::VCPU_SIGNAL_OFFSET as libc::c_int;
        if let Err(e) = vmm_sys_util::signal::register_signal_handler(signal_number, handle_signal)
        {
            log::error!("failed to register vCPU interrupt signal handler: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{InterruptHandle, VcpuInterrupt};

    #[test]
    fn kill_with_no_call_in_progress_is_a_deferred_no_op() {
        let interrupt = VcpuInterrupt::new();
        assert!(!interrupt.kill());
        assert!(interrupt.cancel_requested());
        // The pending kill is discarded at the next call entry.
        interrupt.enter_call();
        assert!(!interrupt.cancel_requested());
        interrupt.finish_call();
    }

    #[test]
    fn kill_blocks_until_the_running_bit_clears() {
        #[cfg(unix)]
        super::register_vcpu_signal_handler();
        let interrupt = VcpuInterrupt::new();
        interrupt.enter_call();

        let watcher = {
            let interrupt: Arc<VcpuInterrupt> = interrupt.clone();
            std::thread::spawn(move || {
                // Emulates a driver observing the flag at a safe point.
                while !interrupt.cancel_requested() {
                    std::thread::sleep(Duration::from_micros(200));
                }
                interrupt.finish_call();
            })
        };

        assert!(interrupt.kill());
        watcher.join().unwrap();
        assert!(!interrupt.cancel_requested());
    }

    #[test]
    fn dropped_is_sticky() {
        let interrupt = VcpuInterrupt::new();
        assert!(!interrupt.dropped());
        interrupt.set_dropped();
        assert!(interrupt.dropped());
    }
}
