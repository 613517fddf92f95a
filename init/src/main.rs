//! Entry point for baas-init, the BAAS boot supervisor (PID 1).

#[cfg(not(target_os = "linux"))]
compile_error!("baas-init is Linux-only; build with a Linux target");

#[cfg(target_os = "linux")]
use std::convert::Infallible;
#[cfg(target_os = "linux")]
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use baas_init::config::InitConfig;
#[cfg(target_os = "linux")]
use baas_init::handoff::{handoff, HandoffTarget};
#[cfg(target_os = "linux")]
use baas_init::supervisor::Supervisor;
#[cfg(target_os = "linux")]
use baas_shared::constants::paths;
#[cfg(target_os = "linux")]
use baas_shared::errors::BaasResult;
#[cfg(target_os = "linux")]
use clap::Parser;
#[cfg(target_os = "linux")]
use tracing::{error, info, warn};

/// BAAS boot supervisor - runs as PID 1, mounts boot images, execs the real init
#[cfg(target_os = "linux")]
#[derive(Parser, Debug)]
#[command(author, version, about = "BAAS boot supervisor (PID 1)")]
struct InitArgs {
    /// JSON configuration file
    #[arg(long, default_value = paths::CONFIG_PATH)]
    config: PathBuf,

    /// Fork the image worker (fetch, attach, mount) at boot
    #[arg(long)]
    fetch_images: bool,

    /// Stay resident as PID 1 instead of exec'ing the real init
    #[arg(long)]
    no_handoff: bool,

    /// Real init program to hand off to
    #[arg(long)]
    init_path: Option<PathBuf>,

    /// Manifest URL
    #[arg(long, env = "BAAS_MANIFEST_URL")]
    manifest_url: Option<String>,
}

#[cfg(target_os = "linux")]
impl InitArgs {
    /// Kernel command-line leftovers must not stop boot: fall back to
    /// defaults on any parse error.
    fn parse_or_default() -> Self {
        match Self::try_parse() {
            Ok(args) => args,
            Err(e) if !e.use_stderr() => e.exit(),
            Err(e) => {
                warn!("Ignoring arguments: {}", e.kind());
                Self {
                    config: PathBuf::from(paths::CONFIG_PATH),
                    fetch_images: false,
                    no_handoff: false,
                    init_path: None,
                    manifest_url: std::env::var("BAAS_MANIFEST_URL").ok(),
                }
            }
        }
    }

    fn apply(&self, config: &mut InitConfig) {
        if self.fetch_images {
            config.fetch_images = true;
        }
        if self.no_handoff {
            config.handoff = false;
        }
        if let Some(path) = &self.init_path {
            config.init_path = path.clone();
        }
        if let Some(url) = &self.manifest_url {
            config.manifest_url = url.clone();
        }
    }
}

#[cfg(target_os = "linux")]
fn main() {
    // PID 1 must never unwind silently
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("[PANIC] baas-init panicked: {}", panic_info);
        std::process::exit(1);
    }));

    // Respects RUST_LOG, defaults to "info"
    if let Err(e) = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
    {
        eprintln!("[ERROR] Failed to initialize tracing: {}", e);
        // Continue anyway - logging failure shouldn't stop boot
    }

    info!("baas-init starting");

    let args = InitArgs::parse_or_default();
    let config = load_config(&args);

    let err = match run(&config) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    error!("baas-init: {}", err);
    std::process::exit(err.exit_code());
}

#[cfg(target_os = "linux")]
fn load_config(args: &InitArgs) -> InitConfig {
    let mut config = InitConfig::load(&args.config).unwrap_or_else(|e| {
        warn!("{}; using built-in defaults", e);
        InitConfig::default()
    });
    args.apply(&mut config);
    config
}

#[cfg(target_os = "linux")]
fn run(config: &InitConfig) -> BaasResult<Infallible> {
    let mut supervisor = Supervisor::boot(config)?;
    supervisor.start()?;

    if let Err(e) = supervisor.provision(&config.provision) {
        error!("Provisioning aborted: {}", e);
    }

    if config.fetch_images {
        if let Err(e) = supervisor.launch_worker(config) {
            error!("Image worker not started: {}", e);
        }
    }

    if !config.handoff {
        supervisor.run_resident();
    }

    supervisor.report_requests();
    supervisor.stop_reap_alarm();
    let target = HandoffTarget {
        path: &config.init_path,
        argv: &config.init_argv,
        log_path: &config.log_path,
    };
    match handoff(&target, supervisor.saved_mask()) {
        Ok(never) => match never {},
        Err(e) => supervisor.terminate(e.exit_code()),
    }
}
