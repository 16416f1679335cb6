//! Error handling for procsentry.
use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible errors raised by the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A `${VAR}` reference in the configuration names an unset variable.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// The configured program does not exist on disk.
    #[error("Program '{}' does not exist", .0.display())]
    ProgramNotFound(PathBuf),

    /// The configured working directory does not exist.
    #[error("Working directory '{}' does not exist", .0.display())]
    WorkDirNotFound(PathBuf),

    /// Error spawning the supervised program.
    #[error("Failed to start '{program}': {source}")]
    LaunchError {
        /// The program that failed to start.
        program: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error spawning the monitoring thread.
    #[error("Failed to spawn monitoring thread for '{name}': {source}")]
    MonitorSpawnError {
        /// The supervisor label.
        name: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `SupervisorError`.
impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    /// Converts a `std::sync::PoisonError` into a `SupervisorError`.
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::MutexPoisonError(err.to_string())
    }
}

/// Error type for system probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Error reading a data source such as a `/proc` file.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A data source was readable but did not have the expected shape.
    #[error("Failed to parse {source_name}: {reason}")]
    ParseError {
        /// Human-readable name of the data source.
        source_name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// No performance-counter instance currently reports this process id.
    #[error("No performance counter instance reports PID {0}")]
    InstanceNotFound(u32),

    /// A performance counter could not be created or sampled.
    #[error("Performance counter '{counter}' failed with status {status:#x}")]
    CounterError {
        /// Counter path that failed.
        counter: String,
        /// Native status code.
        status: u32,
    },
}

/// Error type for archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Error configuring or running the archiver process.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// The archiver exited with a non-zero code.
    #[error("Archiver exited with code {code}: {output}")]
    Failed {
        /// Exit code reported by the archiver.
        code: i32,
        /// Captured standard error (or standard output when stderr was empty).
        output: String,
    },

    /// The archiver did not finish within the configured timeout.
    #[error("Archiver did not finish within {0:?}")]
    TimedOut(std::time::Duration),
}
