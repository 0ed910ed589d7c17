//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "froth", version, about = "Froth flotation monitor and controller")]
pub struct Cli {
    /// Path to config TOML; built-in defaults when omitted
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log and report as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ModeArg {
    /// PI control of the frother on the bubble count
    Auto,
    /// Fixed frother duty from control.manual_duty
    Manual,
}

impl From<ModeArg> for froth_core::Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Auto => froth_core::Mode::Auto,
            ModeArg::Manual => froth_core::Mode::Manual,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run sensing, control and the watchdog until Ctrl-C or the duration elapses
    Run {
        /// Stop after this many seconds (runs until Ctrl-C when omitted)
        #[arg(long = "duration-s", value_name = "SECS")]
        duration_s: Option<f64>,
        /// Override control.mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Override control.setpoint (target bubble count)
        #[arg(long, value_name = "COUNT")]
        setpoint: Option<f64>,
    },
    /// Analyse one still image and print its froth metrics
    Analyze {
        /// PNG or JPEG image of the froth surface
        #[arg(long, value_name = "FILE")]
        image: PathBuf,
    },
    /// Open the camera, start the actuators, then shut everything down
    SelfCheck,
}
