//! BAAS boot supervisor.
//!
//! Runs as PID 1: reaps children, runs provisioning commands, optionally
//! forks a worker that attaches and mounts the boot images listed in a
//! remote manifest, then execs the real init.

#![cfg(target_os = "linux")]

pub mod config;
pub mod fetch;
pub mod handoff;
pub mod pipeline;
pub mod storage;
pub mod supervisor;
