//! Handoff to the real init program.

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use baas_shared::errors::{BaasError, BaasResult};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::unistd::{alarm, execve};

/// Program the supervisor execs into.
#[derive(Clone, Debug)]
pub struct HandoffTarget<'a> {
    pub path: &'a Path,
    pub argv: &'a [String],
    pub log_path: &'a Path,
}

/// Replace this process with the real init.
///
/// Never returns on success. On failure the error is logged to the console
/// first, then a fallback line is appended to the diagnostic log.
pub fn handoff(target: &HandoffTarget<'_>, restore_mask: &SigSet) -> BaasResult<Infallible> {
    append_log(
        target.log_path,
        &format!("baas-init: handing off to {}", target.path.display()),
    );

    let err = match exec(target, restore_mask) {
        Ok(never) => match never {},
        Err(e) => e,
    };

    tracing::error!("{}", err);
    append_log(target.log_path, &format!("baas-init: {}", err));
    Err(err)
}

fn exec(target: &HandoffTarget<'_>, restore_mask: &SigSet) -> BaasResult<Infallible> {
    let path = CString::new(target.path.as_os_str().as_bytes())
        .map_err(|e| BaasError::Handoff(format!("invalid init path: {}", e)))?;
    let argv = target
        .argv
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BaasError::Handoff(format!("invalid init argv: {}", e)))?;
    let env = environment();

    tracing::info!(
        "Handing off to {} {:?}",
        target.path.display(),
        target.argv
    );

    // A pending alarm survives execve
    alarm::cancel();
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(restore_mask), None)
        .map_err(|e| BaasError::Handoff(format!("Failed to restore signal mask: {}", e)))?;

    execve(&path, &argv, &env).map_err(|e| {
        BaasError::Handoff(format!("execve {} failed: {}", target.path.display(), e))
    })
}

/// Inherited environment as `KEY=VALUE` strings.
fn environment() -> Vec<CString> {
    std::env::vars_os()
        .filter_map(|(key, value)| {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).ok()
        })
        .collect()
}

/// Append one line to the diagnostic log. Failures are only logged.
fn append_log(path: &Path, line: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{}", line));
    if let Err(e) = result {
        tracing::warn!("Failed to write {}: {}", path.display(), e);
    }
}
