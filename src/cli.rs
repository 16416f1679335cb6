//! Command-line interface for procsentry.
use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{
    config::{SupervisorConfig, load_config},
    constants::DEFAULT_SAMPLING_WINDOW,
    error::SupervisorError,
};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" | "information" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for procsentry.
#[derive(Parser)]
#[command(name = "psentry", version, author)]
#[command(about = "Supervise external programs and sample host CPU and memory", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for psentry.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a program under supervision until it finishes (or forever with --repeat).
    Run(RunArgs),

    /// Print processor topology and memory figures.
    Info {
        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },

    /// List running processes.
    Ps {
        /// Resolve each process's command line.
        #[arg(long)]
        cmdline: bool,

        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Measure the fractional cores used by one or more processes.
    Usage {
        /// Process id to sample; repeat for a combined figure.
        #[arg(long = "pid", required = true)]
        pids: Vec<u32>,

        /// Sampling window in seconds (clamped to 0.1-10).
        #[arg(long, default_value_t = DEFAULT_SAMPLING_WINDOW.as_secs_f64())]
        seconds: f64,
    },
}

/// Options of `psentry run`.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// YAML supervisor configuration; replaces the program and flags below.
    #[arg(short, long, conflicts_with = "program")]
    pub config: Option<PathBuf>,

    /// Label used in log messages.
    #[arg(long)]
    pub name: Option<String>,

    /// Working directory of the program.
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Keep stdout in memory (reported at exit with --log-level debug).
    #[arg(long)]
    pub cache: bool,

    /// Do not echo the program's output.
    #[arg(short, long)]
    pub quiet: bool,

    /// Write the program's output to a file; derived from the program name when no path is given.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub output_file: Option<Option<PathBuf>>,

    /// Start the output file with a program/arguments banner.
    #[arg(long, requires = "output_file")]
    pub banner: bool,

    /// Liveness poll period in milliseconds (minimum 250).
    #[arg(long, value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Relaunch the program whenever it exits.
    #[arg(long)]
    pub repeat: bool,

    /// Seconds to wait before a relaunch.
    #[arg(long, value_name = "SECONDS")]
    pub hold_off: Option<f64>,

    /// Program to run, followed by its arguments.
    #[arg(required_unless_present = "config")]
    pub program: Option<PathBuf>,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl RunArgs {
    /// Builds the supervisor configuration from a YAML file or the flags.
    pub fn to_config(&self) -> Result<SupervisorConfig, SupervisorError> {
        if let Some(path) = &self.config {
            return load_config(path);
        }

        let program = self.program.clone().unwrap_or_default();
        let work_dir = self.work_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        let mut config = SupervisorConfig::new(program, work_dir);

        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        config.arguments = join_arguments(&self.args);
        config.cache_standard_output = self.cache;
        config.echo_output_to_console = !self.quiet;
        if let Some(output_file) = &self.output_file {
            config.write_console_output_to_file = true;
            config.console_output_file_path = output_file.clone();
        }
        config.write_output_file_banner = self.banner;
        if let Some(interval) = self.interval_ms {
            config.monitoring_interval_ms = interval;
        }
        config.repeat = self.repeat;
        if let Some(hold_off) = self.hold_off {
            config.repeat_hold_off_seconds = hold_off;
        }
        config.rethrow_on_exception = true;

        Ok(config)
    }
}

/// Joins already-split arguments into one string that splits back identically.
pub fn join_arguments(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote_argument(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_argument(arg: &str) -> String {
    let needs_quotes = arg.is_empty() || arg.chars().any(char::is_whitespace);
    match (arg.contains('"'), arg.contains('\'')) {
        // Adjacent quoted runs stay one argument: double quotes go in '"'.
        (true, true) => arg
            .split('"')
            .map(|part| {
                if part.is_empty() {
                    String::new()
                } else {
                    format!("\"{part}\"")
                }
            })
            .collect::<Vec<_>>()
            .join("'\"'"),
        (true, false) => format!("'{arg}'"),
        (false, true) => format!("\"{arg}\""),
        (false, false) if needs_quotes => format!("\"{arg}\""),
        (false, false) => arg.to_string(),
    }
}

/// Converts `--seconds` into a sampling window; invalid values fall back to the default.
pub fn sampling_window(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        DEFAULT_SAMPLING_WINDOW
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
