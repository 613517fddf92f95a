//! Child process creation for PID 1.
//!
//! `std::process::Command` is avoided here: the supervisor runs with every
//! signal blocked and children must start with a clean mask in their own
//! session.

use std::ffi::CString;

use baas_shared::errors::{BaasError, BaasResult};
use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, setsid, ForkResult, Pid};
use signal_hook::low_level;

/// Exit status of a child whose exec failed.
pub const EXIT_EXEC_FAILED: i32 = 127;

/// Signals the supervisor installs handlers for.
const HANDLED: [Signal; 5] = [
    Signal::SIGTERM,
    Signal::SIGCHLD,
    Signal::SIGALRM,
    Signal::SIGINT,
    Signal::SIGUSR1,
];

/// Run `argv` (PATH lookup) in a new session and wait for it to exit.
pub fn spawn(argv: &[String]) -> BaasResult<WaitStatus> {
    if argv.is_empty() {
        return Err(BaasError::Process("spawn: empty argv".to_string()));
    }
    // Built before fork so the child does not allocate
    let args = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BaasError::Process(format!("spawn {:?}: {}", argv, e)))?;

    // SAFETY: the child only calls async-signal-safe functions before exec.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
            let _ = setsid();
            let _ = execvp(&args[0], &args);
            low_level::exit(EXIT_EXEC_FAILED)
        }
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!("spawned {:?} as pid {}", argv, child);
            wait_for(child)
        }
        Err(e) => Err(BaasError::Process(format!("fork for {:?}: {}", argv, e))),
    }
}

/// Fork a detached child that runs `job` and exits with its return value.
///
/// The child starts from default dispositions for the handled signals, an
/// empty mask, and its own session. The parent does not wait.
pub fn fork_detached<F>(job: F) -> BaasResult<Pid>
where
    F: FnOnce() -> i32,
{
    // SAFETY: the supervisor is single-threaded, so the child may run
    // arbitrary code.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            reset_child_signals();
            let _ = setsid();
            low_level::exit(job())
        }
        Ok(ForkResult::Parent { child }) => Ok(child),
        Err(e) => Err(BaasError::Process(format!("fork: {}", e))),
    }
}

fn reset_child_signals() {
    for sig in HANDLED {
        // SAFETY: SIG_DFL carries no handler code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
    let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

fn wait_for(child: Pid) -> BaasResult<WaitStatus> {
    loop {
        match waitpid(child, None) {
            Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                return Ok(status)
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(BaasError::Process(format!("waitpid {}: {}", child, e)));
            }
        }
    }
}
