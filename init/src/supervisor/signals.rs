//! PID 1 signal handlers.
//!
//! Handlers run in signal context and touch nothing but atomics and
//! async-signal-safe syscalls (`waitpid`, `alarm`, `_exit`). Anything worth
//! logging is recorded in [`SignalRequests`] and reported by the control
//! loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use baas_shared::errors::{BaasError, BaasResult};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{alarm, Pid};
use signal_hook::consts::{SIGALRM, SIGCHLD, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::low_level;

/// Requests raised by signals and not yet reported.
#[derive(Debug, Default)]
pub struct SignalRequests {
    reboot: AtomicBool,
    poweroff: AtomicBool,
    /// Set once the handoff starts; the reap alarm is no longer re-armed
    handing_off: AtomicBool,
}

impl SignalRequests {
    /// SIGINT
    pub fn request_reboot(&self) {
        self.reboot.store(true, Ordering::SeqCst);
    }

    /// SIGUSR1
    pub fn request_poweroff(&self) {
        self.poweroff.store(true, Ordering::SeqCst);
    }

    /// Take the pending reboot request, clearing it.
    pub fn take_reboot(&self) -> bool {
        self.reboot.swap(false, Ordering::SeqCst)
    }

    /// Take the pending poweroff request, clearing it.
    pub fn take_poweroff(&self) -> bool {
        self.poweroff.swap(false, Ordering::SeqCst)
    }

    pub fn begin_handoff(&self) {
        self.handing_off.store(true, Ordering::SeqCst);
    }

    pub fn handing_off(&self) -> bool {
        self.handing_off.load(Ordering::SeqCst)
    }
}

/// Reap every terminated child without blocking. Returns how many were reaped.
pub fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => reaped += 1,
            Err(Errno::EINTR) => continue,
            // ECHILD: no children left
            Err(_) => break,
        }
    }
    reaped
}

/// Install the supervisor's handlers.
///
/// | signal          | action                                   |
/// |-----------------|------------------------------------------|
/// | SIGTERM         | `_exit(0)`                               |
/// | SIGCHLD/SIGALRM | reap, re-arm a `reap_interval` alarm     |
/// | SIGINT          | record reboot request                    |
/// | SIGUSR1         | record poweroff request                  |
pub fn install(requests: &Arc<SignalRequests>, reap_interval: u32) -> BaasResult<()> {
    // alarm::set asserts a non-zero interval; that must not fire in a handler
    if reap_interval == 0 {
        return Err(BaasError::Process("reap interval of 0 seconds".to_string()));
    }

    // SAFETY: every closure below only performs async-signal-safe work:
    // atomic stores, waitpid, alarm and _exit. None allocates or locks.
    unsafe {
        register(SIGTERM, || low_level::exit(0))?;
        register(SIGCHLD, reaper(requests, reap_interval))?;
        register(SIGALRM, reaper(requests, reap_interval))?;

        let reboot = Arc::clone(requests);
        register(SIGINT, move || reboot.request_reboot())?;

        let poweroff = Arc::clone(requests);
        register(SIGUSR1, move || poweroff.request_poweroff())?;
    }

    tracing::debug!("Signal handlers installed (reap interval {}s)", reap_interval);
    Ok(())
}

/// Reap, then re-arm the alarm unless the handoff has begun.
fn reaper(
    requests: &Arc<SignalRequests>,
    reap_interval: u32,
) -> impl Fn() + Sync + Send + 'static {
    let requests = Arc::clone(requests);
    move || {
        reap_children();
        if !requests.handing_off() {
            alarm::set(reap_interval);
        }
    }
}

unsafe fn register<F>(signal: i32, action: F) -> BaasResult<()>
where
    F: Fn() + Sync + Send + 'static,
{
    unsafe { low_level::register(signal, action) }
        .map(|_| ())
        .map_err(|e| {
            BaasError::Process(format!(
                "Failed to install handler for {}: {}",
                low_level::signal_name(signal).unwrap_or("signal"),
                e
            ))
        })
}
