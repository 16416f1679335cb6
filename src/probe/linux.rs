//! `/proc` and `/sys` backed probe.
//!
//! All paths are resolved against configurable roots so parsing can be
//! exercised against fixture trees.
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{LazyLock, OnceLock},
    thread,
    time::Duration,
};

use regex::Regex;
use tracing::{debug, warn};

use super::{CpuMemoryProbe, ProcessSample};
use crate::{
    constants::{
        DEFAULT_PROC_ROOT, DEFAULT_SYS_ROOT, DIAGNOSTIC_THROTTLE_WINDOW, PROC_STAT_TOTAL_COLUMNS,
        clamp_sampling_window,
    },
    error::ProbeError,
    logs::LogThrottle,
};

/// Command without parentheses: the common case.
static PROC_PID_STAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\s+\([^()]*\)\s+\S+\s+(?:-?\d+\s+){10}(\d+)\s+(\d+)")
        .expect("valid stat pattern")
});

/// Command containing parentheses: match greedily up to the last `)`.
static PROC_PID_STAT_FALLBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\d+\s+\(.*\)\s+\S+\s+(?:-?\d+\s+){10}(\d+)\s+(\d+)")
        .expect("valid fallback stat pattern")
});

static STAT_PARSE_THROTTLE: LogThrottle = LogThrottle::new(DIAGNOSTIC_THROTTLE_WINDOW);
static SAMPLE_READ_THROTTLE: LogThrottle = LogThrottle::new(DIAGNOSTIC_THROTTLE_WINDOW);
static MEMINFO_THROTTLE: LogThrottle = LogThrottle::new(DIAGNOSTIC_THROTTLE_WINDOW);

/// Processor grouping read from `cpuinfo`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CpuTopology {
    pub logical: usize,
    /// Distinct `(physical id, core id)` pairs.
    pub cores: HashSet<(u32, u32)>,
    /// Distinct `physical id` values.
    pub packages: HashSet<u32>,
}

impl CpuTopology {
    /// Physical cores when the grouping looks trustworthy, logical processors otherwise.
    pub fn core_count(&self) -> usize {
        let physical = self.cores.len();
        if physical == 0 || self.logical == 0 {
            return self.logical.max(1);
        }
        if self.logical % physical == 0 || self.logical >= 2 * physical {
            physical
        } else {
            self.logical
        }
    }

    fn close_record(&mut self, physical_id: Option<u32>, core_id: Option<u32>) {
        if let Some(package) = physical_id {
            self.packages.insert(package);
            if let Some(core) = core_id {
                self.cores.insert((package, core));
            }
        }
    }
}

/// Parses `cpuinfo` content. Records are separated by blank lines.
pub fn parse_cpuinfo(content: &str) -> CpuTopology {
    let mut topology = CpuTopology::default();
    let mut physical_id: Option<u32> = None;
    let mut core_id: Option<u32> = None;

    for line in content.lines() {
        if line.trim().is_empty() {
            topology.close_record(physical_id.take(), core_id.take());
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "processor" => topology.logical += 1,
            "physical id" => physical_id = value.parse().ok(),
            "core id" => core_id = value.parse().ok(),
            _ => {}
        }
    }
    topology.close_record(physical_id, core_id);

    topology
}

/// Memory figures in kilobytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
}

/// Parses `meminfo`. Available memory prefers `MemAvailable`, falling back to
/// `MemFree + Inactive(file) + SReclaimable` on kernels without it.
pub fn parse_meminfo(content: &str) -> Option<MemInfo> {
    let mut fields: HashMap<&str, u64> = HashMap::new();
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        if let Some(value) = rest
            .split_whitespace()
            .next()
            .and_then(|raw| raw.parse::<u64>().ok())
        {
            fields.insert(key.trim(), value);
        }
    }

    let total_kb = *fields.get("MemTotal")?;
    let available_kb = match fields.get("MemAvailable") {
        Some(available) => *available,
        None => {
            let free = *fields.get("MemFree")?;
            free + fields.get("Inactive(file)").copied().unwrap_or(0)
                + fields.get("SReclaimable").copied().unwrap_or(0)
        }
    };

    Some(MemInfo {
        total_kb,
        available_kb,
    })
}

/// Sums the first eight columns of the aggregate `cpu` line of `/proc/stat`.
/// Guest time is already folded into user time, so later columns are excluded.
pub fn parse_total_jiffies(content: &str) -> Option<u64> {
    let line = content
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(PROC_STAT_TOTAL_COLUMNS)
        .map(|raw| raw.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    if values.len() < 4 {
        return None;
    }
    Some(values.iter().sum())
}

/// Extracts `utime + stime` from `/proc/<pid>/stat`.
pub fn parse_process_jiffies(content: &str) -> Option<u64> {
    let caps = PROC_PID_STAT
        .captures(content)
        .or_else(|| PROC_PID_STAT_FALLBACK.captures(content))?;
    let utime: u64 = caps.get(1)?.as_str().parse().ok()?;
    let stime: u64 = caps.get(2)?.as_str().parse().ok()?;
    Some(utime + stime)
}

/// Splits NUL-separated `cmdline` content into tokens.
fn split_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|byte| *byte == 0)
        .filter(|token| !token.is_empty())
        .map(|token| String::from_utf8_lossy(token).into_owned())
        .collect()
}

fn fallback_parallelism() -> usize {
    thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

fn kb_to_mb(kb: u64) -> u64 {
    kb / 1024
}

/// Probe reading Linux procfs and sysfs.
#[derive(Debug)]
pub struct LinuxProbe {
    proc_root: PathBuf,
    sys_root: PathBuf,
    core_count: OnceLock<usize>,
    total_memory_mb: OnceLock<u64>,
}

impl Default for LinuxProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxProbe {
    pub fn new() -> Self {
        Self::with_roots(DEFAULT_PROC_ROOT, DEFAULT_SYS_ROOT)
    }

    /// Probe reading from alternate `proc` and `sys` trees.
    pub fn with_roots(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
            core_count: OnceLock::new(),
            total_memory_mb: OnceLock::new(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    fn read_proc(&self, relative: impl AsRef<Path>) -> Result<String, ProbeError> {
        let path = self.proc_root.join(relative);
        fs::read_to_string(&path).map_err(|source| ProbeError::ReadError { path, source })
    }

    pub fn cpu_topology(&self) -> Result<CpuTopology, ProbeError> {
        let content = self.read_proc("cpuinfo")?;
        let topology = parse_cpuinfo(&content);
        if topology.logical == 0 {
            return Err(ProbeError::ParseError {
                source_name: "cpuinfo".to_string(),
                reason: "no processor records".to_string(),
            });
        }
        Ok(topology)
    }

    pub fn mem_info(&self) -> Result<MemInfo, ProbeError> {
        let content = self.read_proc("meminfo")?;
        parse_meminfo(&content).ok_or_else(|| ProbeError::ParseError {
            source_name: "meminfo".to_string(),
            reason: "MemTotal or free memory fields missing".to_string(),
        })
    }

    pub fn total_jiffies(&self) -> Result<u64, ProbeError> {
        let content = self.read_proc("stat")?;
        parse_total_jiffies(&content).ok_or_else(|| ProbeError::ParseError {
            source_name: "stat".to_string(),
            reason: "aggregate cpu line missing or malformed".to_string(),
        })
    }

    pub fn process_jiffies(&self, pid: u32) -> Result<u64, ProbeError> {
        let content = self.read_proc(Path::new(&pid.to_string()).join("stat"))?;
        match parse_process_jiffies(&content) {
            Some(jiffies) => Ok(jiffies),
            None => {
                if STAT_PARSE_THROTTLE.allow() {
                    warn!("Unrecognised stat line for PID {pid}: {}", content.trim_end());
                }
                Err(ProbeError::ParseError {
                    source_name: format!("{pid}/stat"),
                    reason: "utime/stime not found".to_string(),
                })
            }
        }
    }

    /// Total jiffies and the summed jiffies of `pids`, or `None` if any read failed.
    fn sample(&self, pids: &[u32]) -> Option<(u64, u64)> {
        let total = match self.total_jiffies() {
            Ok(total) => total,
            Err(err) => {
                if SAMPLE_READ_THROTTLE.allow() {
                    warn!("CPU usage sample unavailable: {err}");
                }
                return None;
            }
        };

        let mut used = 0;
        for pid in pids {
            match self.process_jiffies(*pid) {
                Ok(jiffies) => used += jiffies,
                Err(err) => {
                    debug!("PID {pid} not sampled: {err}");
                    return None;
                }
            }
        }
        Some((total, used))
    }

    fn numa_nodes(&self) -> usize {
        let node_dir = self.sys_root.join("devices/system/node");
        let Ok(entries) = fs::read_dir(&node_dir) else {
            return 1;
        };
        entries
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("node"))
                    .is_some_and(|index| {
                        !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())
                    })
            })
            .count()
            .max(1)
    }

    fn read_process(&self, pid: u32, lookup_command_line: bool) -> Option<ProcessSample> {
        let dir = self.proc_root.join(pid.to_string());
        let name = fs::read_to_string(dir.join("comm")).ok()?;
        let sample = ProcessSample::new(pid, name.trim_end_matches('\n'));
        if !lookup_command_line {
            return Some(sample);
        }
        let raw = fs::read(dir.join("cmdline")).ok()?;
        Some(sample.with_command_tokens(split_cmdline(&raw)))
    }
}

impl CpuMemoryProbe for LinuxProbe {
    fn core_count(&self) -> usize {
        if let Some(count) = self.core_count.get() {
            return *count;
        }
        match self.cpu_topology() {
            Ok(topology) => *self.core_count.get_or_init(|| topology.core_count()),
            Err(err) => {
                debug!("Falling back to available parallelism: {err}");
                fallback_parallelism()
            }
        }
    }

    fn logical_core_count(&self) -> usize {
        match self.cpu_topology() {
            Ok(topology) => topology.logical,
            Err(_) => fallback_parallelism(),
        }
    }

    fn processor_package_count(&self) -> usize {
        self.cpu_topology()
            .map(|topology| topology.packages.len())
            .unwrap_or(1)
            .max(1)
    }

    fn numa_node_count(&self) -> usize {
        self.numa_nodes()
    }

    fn free_memory_mb(&self) -> Option<u64> {
        match self.mem_info() {
            Ok(info) => Some(kb_to_mb(info.available_kb)),
            Err(err) => {
                if MEMINFO_THROTTLE.allow() {
                    warn!("Free memory unavailable: {err}");
                }
                None
            }
        }
    }

    fn total_memory_mb(&self) -> Option<u64> {
        if let Some(total) = self.total_memory_mb.get() {
            return Some(*total);
        }
        match self.mem_info() {
            Ok(info) => Some(*self.total_memory_mb.get_or_init(|| kb_to_mb(info.total_kb))),
            Err(err) => {
                if MEMINFO_THROTTLE.allow() {
                    warn!("Total memory unavailable: {err}");
                }
                None
            }
        }
    }

    fn processes(&self, lookup_command_line: bool) -> HashMap<u32, ProcessSample> {
        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            debug!("Cannot list {:?}", self.proc_root);
            return HashMap::new();
        };

        entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter_map(|pid| self.read_process(pid, lookup_command_line))
            .map(|sample| (sample.pid, sample))
            .collect()
    }

    fn core_usage_by_process_id(&self, pids: &[u32], sampling: Duration) -> f64 {
        if pids.is_empty() {
            return 0.0;
        }
        let sampling = clamp_sampling_window(sampling);

        let Some((total_before, used_before)) = self.sample(pids) else {
            return 0.0;
        };
        thread::sleep(sampling);
        let Some((total_after, used_after)) = self.sample(pids) else {
            return 0.0;
        };

        let total_delta = total_after.saturating_sub(total_before);
        if total_delta == 0 {
            return 0.0;
        }
        let used_delta = used_after.saturating_sub(used_before);
        used_delta as f64 / total_delta as f64 * self.logical_core_count() as f64
    }
}
