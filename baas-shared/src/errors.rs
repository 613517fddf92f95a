//! Error types shared by every BAAS component.
//!
//! Each variant is one failure category of the boot pipeline. None of them
//! are retried: the caller logs the error and the process exits.

use thiserror::Error;

/// Exit status used when the supervisor is started as something other than PID 1.
pub const EXIT_NOT_PID1: i32 = 2;

/// Exit status for every other fatal error.
pub const EXIT_FAILURE: i32 = 1;

/// Errors raised while booting.
#[derive(Debug, Error)]
pub enum BaasError {
    /// Opening a device or file, or a device-control call, failed.
    #[error("resource error: {0}")]
    Resource(String),

    /// Fetching the manifest or an image failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The manifest could not be decoded, or an image cannot be handled.
    #[error("decode error: {0}")]
    Decode(String),

    /// Mounting a partition failed.
    #[error("mount error: {0}")]
    Mount(String),

    /// Forking, spawning or waiting on a child failed.
    #[error("process error: {0}")]
    Process(String),

    /// Replacing the process image with the real init failed.
    #[error("handoff error: {0}")]
    Handoff(String),

    /// The supervisor is not running as PID 1.
    #[error("not running as PID 1 (pid {0})")]
    NotPid1(i32),

    /// The boot configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BaasError {
    /// Process exit status for this error.
    ///
    /// `NotPid1` gets its own status so a misplaced invocation can be told
    /// apart from a boot failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            BaasError::NotPid1(_) => EXIT_NOT_PID1,
            _ => EXIT_FAILURE,
        }
    }
}

pub type BaasResult<T> = Result<T, BaasError>;
