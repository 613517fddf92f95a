//! PID 1 supervisor.
//!
//! ```text
//! BlockedInit ──start()──> Running ──SIGTERM──> Terminating (_exit 0)
//! ```
//!
//! [`Supervisor::boot`] checks the pid, blocks every signal and moves to
//! `/`. [`Supervisor::start`] installs the handlers. From `Running` the
//! supervisor either hands off to the real init or stays resident and
//! reaps children.

pub mod signals;
pub mod spawn;

use std::sync::Arc;

use baas_shared::errors::{BaasError, BaasResult};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::sys::wait::WaitStatus;
use nix::unistd::{alarm, chdir, getpid, Pid};

use crate::config::InitConfig;
use crate::pipeline::SystemPipeline;

pub use signals::{reap_children, SignalRequests};
pub use spawn::{fork_detached, spawn};

#[cfg(test)]
pub(crate) static PROCESS_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    /// All signals blocked, no handlers yet
    BlockedInit,
    /// Handlers installed
    Running,
    /// Shutting down; never left
    Terminating,
}

/// Process-lifetime supervisor context.
pub struct Supervisor {
    state: SupervisorState,
    requests: Arc<SignalRequests>,
    /// Mask in effect before boot blocked everything
    saved_mask: SigSet,
    reap_interval: u32,
}

impl Supervisor {
    /// Enter `BlockedInit`. Fails with `NotPid1` without side effects when
    /// not running as process 1.
    pub fn boot(config: &InitConfig) -> BaasResult<Self> {
        let pid = getpid();
        if pid != Pid::from_raw(1) {
            return Err(BaasError::NotPid1(pid.as_raw()));
        }

        let mut saved_mask = SigSet::empty();
        sigprocmask(
            SigmaskHow::SIG_BLOCK,
            Some(&SigSet::all()),
            Some(&mut saved_mask),
        )
        .map_err(|e| BaasError::Process(format!("Failed to block signals: {}", e)))?;

        chdir("/").map_err(|e| BaasError::Process(format!("chdir /: {}", e)))?;

        Ok(Self {
            state: SupervisorState::BlockedInit,
            requests: Arc::new(SignalRequests::default()),
            saved_mask,
            reap_interval: config.reap_interval_secs,
        })
    }

    /// Install signal handlers and arm the reap alarm.
    pub fn start(&mut self) -> BaasResult<()> {
        if self.state != SupervisorState::BlockedInit {
            return Err(BaasError::Process(format!(
                "start() called in state {:?}",
                self.state
            )));
        }

        if self.reap_interval == 0 {
            return Err(BaasError::Process(
                "reap interval must be at least one second".to_string(),
            ));
        }

        signals::install(&self.requests, self.reap_interval)?;
        alarm::set(self.reap_interval);

        self.state = SupervisorState::Running;
        tracing::info!("Supervisor running");
        Ok(())
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Signal mask found at boot, restored before handing off.
    pub fn saved_mask(&self) -> &SigSet {
        &self.saved_mask
    }

    /// Run each provisioning command to completion, in order.
    ///
    /// A command that exits non-zero is logged and does not stop boot.
    pub fn provision(&self, commands: &[Vec<String>]) -> BaasResult<()> {
        for argv in commands {
            tracing::info!("Provisioning: {}", argv.join(" "));
            match spawn(argv)? {
                WaitStatus::Exited(_, 0) => {}
                WaitStatus::Exited(_, code) => {
                    tracing::warn!("'{}' exited with status {}", argv.join(" "), code);
                }
                status => {
                    tracing::warn!("'{}' terminated: {:?}", argv.join(" "), status);
                }
            }
        }
        Ok(())
    }

    /// Fork the image pipeline into a detached worker.
    ///
    /// The worker waits the configured startup delay, runs the pipeline and
    /// exits 0 on success or 1 on failure. It is reaped like any other
    /// child.
    pub fn launch_worker(&self, config: &InitConfig) -> BaasResult<Pid> {
        let worker = fork_detached(|| run_worker(config))?;
        tracing::info!("Image worker started as pid {}", worker);
        Ok(worker)
    }

    /// Stop the periodic reap alarm so it does not outlive `execve`.
    pub fn stop_reap_alarm(&self) {
        self.requests.begin_handoff();
        alarm::cancel();
    }

    /// Report and clear pending reboot/poweroff requests.
    pub fn report_requests(&self) {
        if self.requests.take_reboot() {
            tracing::warn!("Reboot requested (SIGINT); not supported, ignoring");
        }
        if self.requests.take_poweroff() {
            tracing::warn!("Poweroff requested (SIGUSR1); not supported, ignoring");
        }
    }

    /// Stay resident as PID 1: sleep until a signal arrives, let its
    /// handler run, report what it recorded. Only SIGTERM ends this.
    pub fn run_resident(&self) -> ! {
        tracing::info!("No handoff configured, staying resident");
        let wake = SigSet::empty();
        loop {
            // SAFETY: `wake` is a valid sigset_t; sigsuspend always
            // returns -1/EINTR after a handler has run.
            unsafe { nix::libc::sigsuspend(wake.as_ref()) };
            self.report_requests();
        }
    }

    /// Leave `Running` for good.
    pub fn terminate(mut self, code: i32) -> ! {
        self.state = SupervisorState::Terminating;
        tracing::info!("Supervisor terminating with status {}", code);
        std::process::exit(code)
    }
}

fn run_worker(config: &InitConfig) -> i32 {
    let delay = config.startup_delay();
    if !delay.is_zero() {
        tracing::info!("Worker waiting {:?} for the network to settle", delay);
        std::thread::sleep(delay);
    }

    match SystemPipeline::from_config(config).run() {
        Ok(images) => {
            tracing::info!("Worker finished: {} image(s) mounted", images.len());
            0
        }
        Err(e) => {
            tracing::error!("Worker failed: {}", e);
            1
        }
    }
}
