//! Configuration for a supervised program.
use regex::Regex;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use crate::{
    constants::{CONSOLE_OUTPUT_FILE_SUFFIX, DEFAULT_MONITORING_INTERVAL},
    error::SupervisorError,
};

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid env var pattern")
});

/// Everything a [`crate::supervisor::ProcessSupervisor`] needs to know before `start`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Caller-assigned label used in log messages.
    pub name: String,
    /// Path to the executable.
    pub program: PathBuf,
    /// Argument string passed to the program, split shell-style at launch.
    pub arguments: String,
    /// Working directory of the child process.
    pub work_dir: PathBuf,
    /// Suppress a console window for the child where the platform has one.
    pub create_no_window: bool,
    /// Accumulate stdout lines in memory.
    pub cache_standard_output: bool,
    /// Mirror each stdout line to our own stdout.
    pub echo_output_to_console: bool,
    /// Stream stdout lines into a file.
    pub write_console_output_to_file: bool,
    /// Target of the output file; derived from program and working directory when unset.
    pub console_output_file_path: Option<PathBuf>,
    /// Write a program/arguments banner at the top of the output file.
    pub write_output_file_banner: bool,
    /// Poll period of the liveness wait, in milliseconds.
    pub monitoring_interval_ms: u64,
    /// Relaunch the program when it exits on its own.
    pub repeat: bool,
    /// Pause before a relaunch, in seconds.
    pub repeat_hold_off_seconds: f64,
    /// Report failures to the console when no logger is registered.
    pub notify_on_exception: bool,
    /// Return configuration failures to the caller when no logger is registered.
    pub rethrow_on_exception: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            program: PathBuf::new(),
            arguments: String::new(),
            work_dir: PathBuf::from("."),
            create_no_window: false,
            cache_standard_output: false,
            echo_output_to_console: true,
            write_console_output_to_file: false,
            console_output_file_path: None,
            write_output_file_banner: false,
            monitoring_interval_ms: DEFAULT_MONITORING_INTERVAL.as_millis() as u64,
            repeat: false,
            repeat_hold_off_seconds: 0.0,
            notify_on_exception: true,
            rethrow_on_exception: false,
        }
    }
}

impl SupervisorConfig {
    /// Creates a configuration for `program` running inside `work_dir`.
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let name = program
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            program,
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    /// Label used in log messages, falling back to the program file name.
    pub fn display_name(&self) -> String {
        if !self.name.trim().is_empty() {
            return self.name.clone();
        }
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Whether the child's stdout/stderr must be piped back to us.
    pub fn needs_redirection(&self) -> bool {
        self.create_no_window
            || self.cache_standard_output
            || self.write_console_output_to_file
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    /// Hold-off before a relaunch; negative or non-finite values count as zero.
    pub fn repeat_hold_off(&self) -> Duration {
        if self.repeat_hold_off_seconds.is_finite() && self.repeat_hold_off_seconds > 0.0 {
            Duration::from_secs_f64(self.repeat_hold_off_seconds)
        } else {
            Duration::ZERO
        }
    }

    /// Resolves the console output file, deriving
    /// `<program stem>_ConsoleOutput.txt` inside the working directory when unset.
    pub fn resolved_output_file_path(&self) -> PathBuf {
        match &self.console_output_file_path {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => {
                let stem = self
                    .program
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "program".to_string());
                self.work_dir
                    .join(format!("{stem}{CONSOLE_OUTPUT_FILE_SUFFIX}"))
            }
        }
    }

    /// Splits the argument string into individual arguments.
    ///
    /// Whitespace separates arguments; single or double quotes group text that
    /// contains whitespace. Quotes themselves are not passed on.
    pub fn argument_list(&self) -> Vec<String> {
        split_arguments(&self.arguments)
    }
}

/// Splits a command-line style argument string.
pub fn split_arguments(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for ch in raw.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }

    if in_token {
        args.push(current);
    }
    args
}

/// Expands `${VAR}` and `$VAR` references within a string.
fn expand_env_vars(input: &str) -> Result<String, SupervisorError> {
    let mut missing = None;
    let result = ENV_VAR_PATTERN.replace_all(input, |caps: &regex::Captures| {
        let var_name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(SupervisorError::MissingEnvVar(var_name)),
        None => Ok(result.into_owned()),
    }
}

/// Loads and parses a YAML supervisor configuration, expanding environment variables.
///
/// A relative `work_dir` (or a missing one) is resolved against the directory
/// holding the configuration file.
pub fn load_config(config_path: &Path) -> Result<SupervisorConfig, SupervisorError> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        SupervisorError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded_content = expand_env_vars(&content)?;
    let mut config: SupervisorConfig = serde_yaml::from_str(&expanded_content)
        .map_err(SupervisorError::ConfigParseError)?;

    let base_path = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    if config.work_dir.is_relative() {
        config.work_dir = base_path.join(&config.work_dir);
    }
    if config.name.trim().is_empty() {
        config.name = config.display_name();
    }

    Ok(config)
}
