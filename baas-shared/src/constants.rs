//! Shared constants between the boot supervisor and the control server
//!
//! Defaults for every path and address the supervisor touches. The
//! supervisor's configuration file may override any of them.

/// Control server endpoints
pub mod server {
    /// Where the boot manifest is fetched from
    pub const MANIFEST_URL: &str = "http://192.168.2.33:9090/disk.json";

    /// Base URL of the image server; images live at `/image/<uuid>/<version>`
    pub const IMAGE_SERVER: &str = "http://192.168.2.33:4848";

    /// Value sent in the `Origin` header of every request
    pub const ORIGIN: &str = "http://localhost:9090";

    /// Value sent in the `Type` header of every request
    pub const REQUEST_TYPE: &str = "system";
}

/// Loop device paths
pub mod loop_device {
    /// Control node used to allocate free loop devices
    pub const CONTROL: &str = "/dev/loop-control";

    /// Prefix of loop device nodes, followed by the device number
    pub const DEVICE_PREFIX: &str = "/dev/loop";
}

/// Filesystem locations used during boot
pub mod paths {
    /// Directory holding downloaded images
    pub const SCRATCH_DIR: &str = "/";

    /// Root under which partitions are mounted
    pub const MOUNT_ROOT: &str = "/mnt";

    /// The real init program
    pub const INIT_PATH: &str = "/sbin/init-orig";

    /// argv[0] passed to the real init
    pub const INIT_ARGV0: &str = "init";

    /// Diagnostic log written just before the handoff
    pub const LOG_PATH: &str = "/baas.log";

    /// Default location of the supervisor configuration file
    pub const CONFIG_PATH: &str = "/etc/baas/init.json";
}

/// Timing
pub mod timing {
    /// Seconds between periodic reaping passes
    pub const REAP_INTERVAL_SECS: u32 = 50;

    /// Seconds the image worker waits for the network before fetching
    pub const STARTUP_DELAY_SECS: u64 = 10;

    /// Milliseconds to wait for partition nodes after attaching a loop device
    pub const SETTLE_DELAY_MS: u64 = 5;

    /// Overall HTTP request timeout in seconds
    pub const HTTP_TIMEOUT_SECS: u64 = 300;
}
