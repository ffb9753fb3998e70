//! Oxidized-Orbis - PS4 user-space loader
//!
//! Main entry point: loads the boot module and its system modules into this
//! process, links them and jumps to the guest entry point.

use anyhow::{bail, Context};
use ob_core::Config;
use ob_kernel::{exception, Runtime};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const EXIT_MISSING_CPU_FEATURE: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_LOAD_FAILED: u8 = 3;

/// Guest argv entries passed when none are given.
const DEFAULT_GUEST_ARGS: usize = 4;

struct Args {
    config: Option<PathBuf>,
    boot_path: PathBuf,
    guest_args: Vec<String>,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = std::env::args().skip(1);
    let mut config = None;

    let boot_path = loop {
        match args.next() {
            Some(arg) if arg == "--config" => {
                let path = args.next().context("--config needs a file")?;
                config = Some(PathBuf::from(path));
            }
            Some(arg) => break PathBuf::from(arg),
            None => return Ok(None),
        }
    };

    let mut guest_args: Vec<String> = args.collect();
    if guest_args.is_empty() {
        guest_args = vec![String::new(); DEFAULT_GUEST_ARGS];
    }
    Ok(Some(Args {
        config,
        boot_path,
        guest_args,
    }))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

fn init_logging(config: &Config) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.debug.log_level.as_filter())),
        )
        .init();
}

fn boot(runtime: &Runtime, boot_path: &Path) -> anyhow::Result<()> {
    let boot_path = std::path::absolute(boot_path)
        .with_context(|| format!("Invalid boot path {}", boot_path.display()))?;
    if !boot_path.is_file() {
        bail!("{} does not exist", boot_path.display());
    }
    runtime
        .load_executable(&boot_path)
        .with_context(|| format!("Failed to load {}", boot_path.display()))?;
    runtime
        .process_needed_and_relocate()
        .context("Failed to link modules")?;
    Ok(())
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => {
            eprintln!("usage: oxidized-orbis [--config <file>] <eboot> [args...]");
            return ExitCode::from(EXIT_USAGE);
        }
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}; using defaults", e);
            Config::default()
        }
    };
    init_logging(&config);
    tracing::info!("Starting Oxidized-Orbis");

    let runtime = match Runtime::install(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cpu = runtime.cpu();
    tracing::info!("Host CPU: {}", cpu);
    let missing = cpu.missing_required();
    if !missing.is_empty() {
        for feature in &missing {
            println!("Your CPU does not support {}.", feature);
        }
        if runtime.config().cpu.require_features {
            return ExitCode::from(EXIT_MISSING_CPU_FEATURE);
        }
        tracing::warn!("Continuing without required CPU features");
    }

    let emulate_bmi1 = runtime.config().cpu.emulate_bmi1 && !cpu.bmi1;
    if let Err(e) = exception::install(emulate_bmi1) {
        tracing::warn!("{}", e);
    }

    if let Err(e) = boot(&runtime, &args.boot_path) {
        tracing::error!("{:#}", e);
        return ExitCode::from(EXIT_LOAD_FAILED);
    }

    match runtime.run(&args.guest_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
