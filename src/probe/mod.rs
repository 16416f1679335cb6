//! Host CPU, memory and process sampling.
//!
//! [`CpuMemoryProbe`] is implemented once per operating system family; the
//! [`crate::system_info`] facade picks the right one at runtime.
use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::Serialize;

pub mod linux;
#[cfg(windows)]
pub mod windows;

pub use linux::LinuxProbe;
#[cfg(windows)]
pub use windows::WindowsProbe;

/// One process seen during enumeration.
///
/// The executable, argument and command-line fields are only filled when the
/// command line was requested and could be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub executable: Option<PathBuf>,
    pub arguments: Option<Vec<String>>,
    pub command_line: Option<String>,
}

impl ProcessSample {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            executable: None,
            arguments: None,
            command_line: None,
        }
    }

    /// Fills the command-line fields from already-split tokens; the first
    /// token is the executable.
    pub fn with_command_tokens(mut self, tokens: Vec<String>) -> Self {
        let Some((executable, arguments)) = tokens.split_first() else {
            return self;
        };
        self.command_line = Some(tokens.join(" "));
        self.executable = Some(PathBuf::from(executable));
        self.arguments = Some(arguments.to_vec());
        self
    }
}

/// Point-in-time queries about the host.
///
/// Counts never drop below one. Memory figures are in megabytes and `None`
/// when the source could not be read.
pub trait CpuMemoryProbe: Send + Sync {
    /// Physical cores, or logical processors when grouping data is unusable.
    fn core_count(&self) -> usize;

    fn logical_core_count(&self) -> usize;

    fn processor_package_count(&self) -> usize;

    fn numa_node_count(&self) -> usize;

    fn free_memory_mb(&self) -> Option<u64>;

    fn total_memory_mb(&self) -> Option<u64>;

    /// Running processes keyed by pid.
    fn processes(&self, lookup_command_line: bool) -> HashMap<u32, ProcessSample>;

    /// Combined fractional cores used by `pids` over `sampling` (clamped to
    /// 0.1-10 s). Blocks for the sampling window; returns 0.0 when any pid is
    /// not running or the sample is unusable.
    fn core_usage_by_process_id(&self, pids: &[u32], sampling: Duration) -> f64;
}
