//! Create and extract archives by supervising an external `7z`-compatible archiver.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, info};

use crate::{
    config::SupervisorConfig,
    error::ArchiveError,
    supervisor::ProcessSupervisor,
};

/// Default upper bound for a single archiver run.
pub const DEFAULT_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Runs archiver commands to completion under a [`ProcessSupervisor`].
#[derive(Debug, Clone)]
pub struct ArchiveRunner {
    archiver: PathBuf,
    work_dir: PathBuf,
    timeout: Duration,
}

impl ArchiveRunner {
    pub fn new(archiver: impl Into<PathBuf>) -> Self {
        Self {
            archiver: archiver.into(),
            work_dir: PathBuf::from("."),
            timeout: DEFAULT_ARCHIVE_TIMEOUT,
        }
    }

    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds `inputs` to `archive`, creating it when needed.
    pub fn create<P: AsRef<Path>>(&self, archive: &Path, inputs: &[P]) -> Result<(), ArchiveError> {
        let mut arguments = format!("a {}", quote(archive));
        for input in inputs {
            arguments.push(' ');
            arguments.push_str(&quote(input.as_ref()));
        }
        self.run(arguments)
    }

    /// Extracts `archive` into `destination`, overwriting existing files.
    pub fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
        let arguments = format!("x {} -o{} -y", quote(archive), quote(destination));
        self.run(arguments)
    }

    fn run(&self, arguments: String) -> Result<(), ArchiveError> {
        let mut config = SupervisorConfig::new(&self.archiver, &self.work_dir);
        config.arguments = arguments;
        config.echo_output_to_console = false;
        config.cache_standard_output = true;
        config.create_no_window = true;
        config.repeat = false;
        config.rethrow_on_exception = true;
        config.notify_on_exception = false;

        debug!("Running archiver: {:?} {}", self.archiver, config.arguments);
        let supervisor = ProcessSupervisor::new(config);
        supervisor.start()?;

        if !supervisor.wait_for_idle(self.timeout) {
            supervisor.stop(true);
            return Err(ArchiveError::TimedOut(self.timeout));
        }

        let code = supervisor.exit_code();
        if code != 0 {
            let errors = supervisor.cached_error_output();
            let output = if errors.trim().is_empty() {
                supervisor.cached_console_output()
            } else {
                errors
            };
            return Err(ArchiveError::Failed {
                code,
                output: output.trim_end().to_string(),
            });
        }

        info!("Archiver finished: {}", supervisor.name());
        Ok(())
    }
}

/// Wraps a path in double quotes so paths containing spaces survive argument splitting.
fn quote(path: &Path) -> String {
    format!("\"{}\"", path.display())
}
