#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! `froth`: run, inspect and check the froth flotation controller.

mod cli;
mod error_fmt;
mod run;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use eyre::{Result, WrapErr};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

use crate::cli::{Cli, Commands, JSON_MODE};
use crate::error_fmt::{CliError, exit_code_for_error, format_error_json, humanize};
use crate::run::RunArgs;

fn main() {
    let _ = color_eyre::install();
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    if let Err(err) = real_main(cli) {
        tracing::error!(error = %err, "command failed");
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}

fn real_main(cli: Cli) -> Result<()> {
    let cfg = load_config(cli.config.as_deref())?;
    // Flushes the log file when dropped at the end of the command
    let _file_guard = init_tracing(cli.json, &cli.log_level, &cfg.logging);

    match cli.cmd {
        Commands::Run {
            duration_s,
            mode,
            setpoint,
        } => {
            let duration = duration_s
                .map(|s| {
                    Duration::try_from_secs_f64(s)
                        .wrap_err_with(|| format!("invalid --duration-s {s}"))
                })
                .transpose()?;
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = shutdown.clone();
            ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
                .wrap_err("install Ctrl-C handler")?;

            let snap = run::run_pipeline(
                &cfg,
                RunArgs {
                    duration,
                    mode: mode.map(Into::into),
                    setpoint,
                },
                shutdown,
            )?;
            if cli.json {
                println!("{}", run::snapshot_json(&snap));
            } else {
                run::print_snapshot(&snap);
                println!("run complete");
            }
        }
        Commands::Analyze { image } => {
            let m = run::analyze_image(&cfg, &image)?;
            if cli.json {
                println!("{}", run::metrics_json(&m));
            } else {
                run::print_metrics(&m);
            }
        }
        Commands::SelfCheck => {
            let report = run::self_check(&cfg)?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": "ok",
                        "frame": [report.frame_width, report.frame_height],
                        "channels": report.channels,
                    })
                );
            } else {
                println!(
                    "ok: camera {}x{}, {} channels zeroed",
                    report.frame_width, report.frame_height, report.channels
                );
            }
        }
    }
    Ok(())
}

/// Parse and validate the TOML at `path`; defaults when no path is given.
fn load_config(path: Option<&Path>) -> Result<froth_config::Config> {
    let Some(path) = path else {
        return Ok(froth_config::Config::default());
    };
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read config {}", path.display()))?;
    let invalid = |reason: String| CliError::Config {
        path: path.display().to_string(),
        reason,
    };
    let cfg: froth_config::Config = toml::from_str(&text).map_err(|e| invalid(e.to_string()))?;
    cfg.validate().map_err(|e| invalid(e.to_string()))?;
    Ok(cfg)
}

/// Console logs go to stderr so stdout stays clean for reports. `RUST_LOG`
/// overrides `--log-level`; `[logging] file` adds a JSON-lines file layer.
fn init_tracing(
    json: bool,
    level: &str,
    logging: &froth_config::Logging,
) -> Option<WorkerGuard> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if json {
        layers.push(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_filter(console_filter)
                .boxed(),
        );
    } else {
        layers.push(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(console_filter)
                .boxed(),
        );
    }

    let mut guard = None;
    if let Some(file) = logging.file.as_deref() {
        let path = Path::new(file);
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .map_or_else(|| "froth.log".into(), |n| n.to_os_string());
        let appender = match logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, name),
            Some("hourly") => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, g) = tracing_appender::non_blocking(appender);
        guard = Some(g);
        let file_level = logging.level.as_deref().unwrap_or(level);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new(file_level))
                .boxed(),
        );
    }

    let _ = tracing_subscriber::registry().with(layers).try_init();
    guard
}
