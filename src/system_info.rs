//! Process-wide access to the host probe.
//!
//! The probe matching the running operating system is built on first use and
//! shared afterwards; the free functions here forward to it.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
    time::Duration,
};

use serde::Serialize;

use crate::probe::{CpuMemoryProbe, LinuxProbe, ProcessSample};

/// Operating system family the process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    Windows,
    Linux,
    Other,
}

impl OsKind {
    pub fn detect() -> Self {
        if cfg!(windows) {
            OsKind::Windows
        } else if cfg!(target_os = "linux") {
            OsKind::Linux
        } else {
            OsKind::Other
        }
    }
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OsKind::Windows => "windows",
            OsKind::Linux => "linux",
            OsKind::Other => "other",
        };
        f.write_str(label)
    }
}

static PROBE: OnceLock<Arc<dyn CpuMemoryProbe>> = OnceLock::new();

fn build_probe(os: OsKind) -> Arc<dyn CpuMemoryProbe> {
    match os {
        #[cfg(windows)]
        OsKind::Windows => Arc::new(crate::probe::WindowsProbe::new()),
        _ => Arc::new(LinuxProbe::new()),
    }
}

/// The shared probe for this host.
pub fn probe() -> Arc<dyn CpuMemoryProbe> {
    Arc::clone(PROBE.get_or_init(|| build_probe(OsKind::detect())))
}

pub fn core_count() -> usize {
    probe().core_count()
}

pub fn logical_core_count() -> usize {
    probe().logical_core_count()
}

pub fn processor_package_count() -> usize {
    probe().processor_package_count()
}

pub fn numa_node_count() -> usize {
    probe().numa_node_count()
}

pub fn free_memory_mb() -> Option<u64> {
    probe().free_memory_mb()
}

pub fn total_memory_mb() -> Option<u64> {
    probe().total_memory_mb()
}

pub fn processes(lookup_command_line: bool) -> HashMap<u32, ProcessSample> {
    probe().processes(lookup_command_line)
}

pub fn core_usage_by_process_id(pids: &[u32], sampling: Duration) -> f64 {
    probe().core_usage_by_process_id(pids, sampling)
}

/// Host summary printed by `psentry info`.
#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub os: OsKind,
    pub cores: usize,
    pub logical_cores: usize,
    pub processor_packages: usize,
    pub numa_nodes: usize,
    pub free_memory_mb: Option<u64>,
    pub total_memory_mb: Option<u64>,
}

impl HostSummary {
    pub fn collect() -> Self {
        let probe = probe();
        Self {
            os: OsKind::detect(),
            cores: probe.core_count(),
            logical_cores: probe.logical_core_count(),
            processor_packages: probe.processor_package_count(),
            numa_nodes: probe.numa_node_count(),
            free_memory_mb: probe.free_memory_mb(),
            total_memory_mb: probe.total_memory_mb(),
        }
    }
}
