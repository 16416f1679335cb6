//! Win32 backed probe: processor topology, global memory status, ToolHelp32
//! enumeration and PDH process counters.
use std::{
    collections::HashMap,
    ffi::OsStr,
    mem,
    os::windows::ffi::OsStrExt,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::Duration,
};

use dashmap::DashMap;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, warn};
use windows::{
    Win32::{
        Foundation::{CloseHandle, HANDLE},
        System::{
            Diagnostics::ToolHelp::{
                CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
                TH32CS_SNAPPROCESS,
            },
            Performance::{
                PDH_FMT, PDH_FMT_COUNTERVALUE, PDH_FMT_DOUBLE, PDH_FMT_LARGE, PDH_HCOUNTER, PDH_HQUERY,
                PdhAddEnglishCounterW, PdhCloseQuery, PdhCollectQueryData,
                PdhGetFormattedCounterValue, PdhOpenQueryW,
            },
            SystemInformation::{
                GetLogicalProcessorInformationEx, GlobalMemoryStatusEx, MEMORYSTATUSEX,
                RelationAll, RelationNumaNode, RelationProcessorCore, RelationProcessorPackage,
                SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX,
            },
        },
    },
    core::PCWSTR,
};

use super::{CpuMemoryProbe, ProcessSample};
use crate::{
    constants::{DIAGNOSTIC_THROTTLE_WINDOW, clamp_sampling_window},
    error::ProbeError,
    logs::LogThrottle,
};

const ERROR_SUCCESS: u32 = 0;
const BYTES_PER_MB: u64 = 1024 * 1024;

static COUNTER_THROTTLE: LogThrottle = LogThrottle::new(DIAGNOSTIC_THROTTLE_WINDOW);

/// Owned ToolHelp32 snapshot handle.
struct SnapshotHandle(HANDLE);

impl SnapshotHandle {
    fn processes() -> windows::core::Result<Self> {
        // SAFETY: the second argument is ignored for process snapshots.
        let handle = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)? };
        Ok(Self(handle))
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        // SAFETY: the handle came from CreateToolhelp32Snapshot and is closed once.
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

fn to_wide(value: &str) -> Vec<u16> {
    OsStr::new(value).encode_wide().chain(Some(0)).collect()
}

/// `(pid, image name)` for every running process.
fn snapshot_processes() -> windows::core::Result<Vec<(u32, String)>> {
    let snapshot = SnapshotHandle::processes()?;
    let mut entry = PROCESSENTRY32W {
        dwSize: mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };

    let mut processes = Vec::new();
    // SAFETY: valid snapshot handle and an entry with dwSize set.
    let mut next = unsafe { Process32FirstW(snapshot.0, &mut entry) };
    while next.is_ok() {
        processes.push((entry.th32ProcessID, wide_to_string(&entry.szExeFile)));
        // SAFETY: as above.
        next = unsafe { Process32NextW(snapshot.0, &mut entry) };
    }
    Ok(processes)
}

/// Candidate performance-counter instance names for every pid in `processes`.
///
/// PDH names same-image processes `name`, `name#1`, ... in an order it does
/// not document, so each pid gets every name of its image. The guess by pid
/// order comes first since it usually holds.
fn counter_candidates(processes: &[(u32, String)]) -> HashMap<u32, Vec<String>> {
    let mut by_name: HashMap<String, Vec<u32>> = HashMap::new();
    for (pid, image) in processes {
        let base = image
            .strip_suffix(".exe")
            .or_else(|| image.strip_suffix(".EXE"))
            .unwrap_or(image)
            .to_string();
        by_name.entry(base).or_default().push(*pid);
    }

    let mut candidates = HashMap::new();
    for (base, mut pids) in by_name {
        pids.sort_unstable();
        let names: Vec<String> = (0..pids.len())
            .map(|index| {
                if index == 0 {
                    base.clone()
                } else {
                    format!("{base}#{index}")
                }
            })
            .collect();
        for (guess, pid) in pids.into_iter().enumerate() {
            let mut ordered = Vec::with_capacity(names.len());
            ordered.push(names[guess].clone());
            ordered.extend(
                names
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| *index != guess)
                    .map(|(_, name)| name.clone()),
            );
            candidates.insert(pid, ordered);
        }
    }
    candidates
}

#[derive(Debug, Default, Clone, Copy)]
struct Topology {
    cores: usize,
    logical: usize,
    packages: usize,
    numa_nodes: usize,
}

fn read_topology() -> Result<Topology, ProbeError> {
    let mut length = 0u32;
    // SAFETY: a null buffer asks for the required length.
    let _ = unsafe { GetLogicalProcessorInformationEx(RelationAll, None, &mut length) };
    if length == 0 {
        return Err(ProbeError::ParseError {
            source_name: "GetLogicalProcessorInformationEx".to_string(),
            reason: "empty topology".to_string(),
        });
    }

    // u64 storage keeps the records suitably aligned.
    let mut buffer = vec![0u64; (length as usize).div_ceil(mem::size_of::<u64>())];
    let records = buffer.as_mut_ptr().cast::<SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX>();
    // SAFETY: the buffer holds at least `length` bytes.
    unsafe { GetLogicalProcessorInformationEx(RelationAll, Some(records), &mut length) }.map_err(
        |err| ProbeError::ParseError {
            source_name: "GetLogicalProcessorInformationEx".to_string(),
            reason: err.to_string(),
        },
    )?;

    let mut topology = Topology::default();
    let base = buffer.as_ptr().cast::<u8>();
    let mut offset = 0usize;
    while offset < length as usize {
        // SAFETY: offsets advance by each record's own Size within the returned length.
        let record = unsafe { &*base.add(offset).cast::<SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX>() };
        match record.Relationship {
            relation if relation == RelationProcessorCore => {
                topology.cores += 1;
                // SAFETY: core records carry a PROCESSOR_RELATIONSHIP payload.
                let processor = unsafe { &record.Anonymous.Processor };
                let masks = unsafe {
                    std::slice::from_raw_parts(
                        processor.GroupMask.as_ptr(),
                        processor.GroupCount as usize,
                    )
                };
                topology.logical += masks
                    .iter()
                    .map(|affinity| affinity.Mask.count_ones() as usize)
                    .sum::<usize>();
            }
            relation if relation == RelationProcessorPackage => topology.packages += 1,
            relation if relation == RelationNumaNode => topology.numa_nodes += 1,
            _ => {}
        }
        if record.Size == 0 {
            break;
        }
        offset += record.Size as usize;
    }

    Ok(Topology {
        cores: topology.cores.max(1),
        logical: topology.logical.max(1),
        packages: topology.packages.max(1),
        numa_nodes: topology.numa_nodes.max(1),
    })
}

fn memory_status() -> Option<MEMORYSTATUSEX> {
    let mut status = MEMORYSTATUSEX {
        dwLength: mem::size_of::<MEMORYSTATUSEX>() as u32,
        ..Default::default()
    };
    // SAFETY: dwLength is initialised as the API requires.
    match unsafe { GlobalMemoryStatusEx(&mut status) } {
        Ok(()) => Some(status),
        Err(err) => {
            warn!("GlobalMemoryStatusEx failed: {err}");
            None
        }
    }
}

/// One PDH query holding the `% Processor Time` and `ID Process` counters of
/// a single process instance.
struct PdhCounter {
    instance: String,
    query: PDH_HQUERY,
    cpu: PDH_HCOUNTER,
    id: PDH_HCOUNTER,
}

// SAFETY: PDH handles may be used from any thread; access is serialised by a Mutex.
unsafe impl Send for PdhCounter {}

fn add_counter(query: PDH_HQUERY, path: &str) -> Result<PDH_HCOUNTER, ProbeError> {
    let wide = to_wide(path);
    let mut counter = PDH_HCOUNTER::default();
    // SAFETY: `wide` is NUL-terminated and outlives the call.
    let status = unsafe { PdhAddEnglishCounterW(query, PCWSTR(wide.as_ptr()), 0, &mut counter) };
    if status != ERROR_SUCCESS {
        return Err(ProbeError::CounterError {
            counter: path.to_string(),
            status,
        });
    }
    Ok(counter)
}

impl PdhCounter {
    fn open(instance: &str) -> Result<Self, ProbeError> {
        let mut query = PDH_HQUERY::default();
        // SAFETY: out-pointer to a local handle.
        let status = unsafe { PdhOpenQueryW(PCWSTR::null(), 0, &mut query) };
        if status != ERROR_SUCCESS {
            return Err(ProbeError::CounterError {
                counter: format!(r"\Process({instance})"),
                status,
            });
        }

        let counters = add_counter(query, &format!(r"\Process({instance})\% Processor Time"))
            .and_then(|cpu| {
                add_counter(query, &format!(r"\Process({instance})\ID Process"))
                    .map(|id| (cpu, id))
            });
        match counters {
            Ok((cpu, id)) => Ok(Self {
                instance: instance.to_string(),
                query,
                cpu,
                id,
            }),
            Err(err) => {
                // SAFETY: the query was opened above.
                unsafe {
                    PdhCloseQuery(query);
                }
                Err(err)
            }
        }
    }

    /// Opens the candidate instance that currently reports `pid`.
    fn open_for_pid(pid: u32, candidates: &[String]) -> Result<Self, ProbeError> {
        for instance in candidates {
            match Self::open(instance) {
                Ok(counter) if counter.reports(pid) => return Ok(counter),
                Ok(_) => {}
                Err(err) => debug!("{err}"),
            }
        }
        Err(ProbeError::InstanceNotFound(pid))
    }

    fn collect(&self) -> Result<(), ProbeError> {
        // SAFETY: the query is open for the lifetime of self.
        let status = unsafe { PdhCollectQueryData(self.query) };
        if status == ERROR_SUCCESS {
            Ok(())
        } else {
            Err(ProbeError::CounterError {
                counter: self.instance.clone(),
                status,
            })
        }
    }

    fn formatted(
        &self,
        counter: PDH_HCOUNTER,
        format: PDH_FMT,
    ) -> Result<PDH_FMT_COUNTERVALUE, ProbeError> {
        let mut value = PDH_FMT_COUNTERVALUE::default();
        // SAFETY: the counter belongs to this open query.
        let status = unsafe { PdhGetFormattedCounterValue(counter, format, None, &mut value) };
        if status != ERROR_SUCCESS {
            return Err(ProbeError::CounterError {
                counter: self.instance.clone(),
                status,
            });
        }
        Ok(value)
    }

    /// Process id reported by the most recent collection.
    fn process_id(&self) -> Result<u32, ProbeError> {
        let value = self.formatted(self.id, PDH_FMT_LARGE)?;
        // SAFETY: PDH_FMT_LARGE selects the 64-bit integer member.
        Ok(unsafe { value.Anonymous.largeValue } as u32)
    }

    /// Collects once and checks the instance still belongs to `pid`.
    fn reports(&self, pid: u32) -> bool {
        self.collect().is_ok() && self.process_id().ok() == Some(pid)
    }

    /// Per-core percent between the last two collections.
    fn value(&self) -> Result<f64, ProbeError> {
        let value = self.formatted(self.cpu, PDH_FMT_DOUBLE)?;
        // SAFETY: PDH_FMT_DOUBLE selects the double member.
        Ok(unsafe { value.Anonymous.doubleValue })
    }
}

impl Drop for PdhCounter {
    fn drop(&mut self) {
        // SAFETY: closing the query releases its counters; done once.
        unsafe {
            PdhCloseQuery(self.query);
        }
    }
}

/// Probe built on Win32 system information and PDH.
#[derive(Default)]
pub struct WindowsProbe {
    core_count: OnceLock<usize>,
    total_memory_mb: OnceLock<u64>,
    counters: DashMap<u32, Arc<Mutex<PdhCounter>>>,
}

impl WindowsProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached counter for `pid` if its instance still reports that pid,
    /// otherwise a freshly resolved one from `candidates`.
    fn counter_for(
        &self,
        pid: u32,
        candidates: &[String],
    ) -> Result<Arc<Mutex<PdhCounter>>, ProbeError> {
        let cached = self.counters.get(&pid).map(|entry| Arc::clone(entry.value()));
        if let Some(existing) = cached {
            let current = existing
                .lock()
                .map(|counter| counter.reports(pid))
                .unwrap_or(false);
            if current {
                return Ok(existing);
            }
            self.counters.remove(&pid);
        }

        let counter = Arc::new(Mutex::new(PdhCounter::open_for_pid(pid, candidates)?));
        self.counters.insert(pid, Arc::clone(&counter));
        Ok(counter)
    }

    /// Drops cached counters of processes that are no longer running.
    fn prune_counters(&self, live: &HashMap<u32, Vec<String>>) {
        self.counters.retain(|pid, _| live.contains_key(pid));
    }

    fn collect_all(counters: &[(u32, Arc<Mutex<PdhCounter>>)]) -> Result<(), ProbeError> {
        for (_, counter) in counters {
            let guard = counter
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.collect()?;
        }
        Ok(())
    }
}

impl CpuMemoryProbe for WindowsProbe {
    fn core_count(&self) -> usize {
        if let Some(count) = self.core_count.get() {
            return *count;
        }
        match read_topology() {
            Ok(topology) => *self.core_count.get_or_init(|| topology.cores),
            Err(err) => {
                debug!("Processor topology unavailable: {err}");
                thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
            }
        }
    }

    fn logical_core_count(&self) -> usize {
        read_topology()
            .map(|topology| topology.logical)
            .unwrap_or_else(|_| thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }

    fn processor_package_count(&self) -> usize {
        read_topology().map(|topology| topology.packages).unwrap_or(1)
    }

    fn numa_node_count(&self) -> usize {
        read_topology().map(|topology| topology.numa_nodes).unwrap_or(1)
    }

    fn free_memory_mb(&self) -> Option<u64> {
        memory_status().map(|status| status.ullAvailPhys / BYTES_PER_MB)
    }

    fn total_memory_mb(&self) -> Option<u64> {
        if let Some(total) = self.total_memory_mb.get() {
            return Some(*total);
        }
        let status = memory_status()?;
        Some(*self.total_memory_mb.get_or_init(|| status.ullTotalPhys / BYTES_PER_MB))
    }

    fn processes(&self, lookup_command_line: bool) -> HashMap<u32, ProcessSample> {
        let snapshot = match snapshot_processes() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Process snapshot failed: {err}");
                return HashMap::new();
            }
        };

        // One bulk refresh serves every command-line lookup of this pass.
        let system = lookup_command_line.then(|| {
            let mut system = System::new();
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing()
                    .with_cmd(UpdateKind::Always)
                    .with_exe(UpdateKind::Always),
            );
            system
        });

        snapshot
            .into_iter()
            .map(|(pid, image)| {
                let mut sample = ProcessSample::new(pid, image);
                if let Some(process) = system
                    .as_ref()
                    .and_then(|system| system.process(sysinfo::Pid::from_u32(pid)))
                {
                    let tokens: Vec<String> = process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect();
                    sample = sample.with_command_tokens(tokens);
                    if let Some(exe) = process.exe() {
                        sample.executable = Some(PathBuf::from(exe));
                    }
                }
                (pid, sample)
            })
            .collect()
    }

    fn core_usage_by_process_id(&self, pids: &[u32], sampling: Duration) -> f64 {
        if pids.is_empty() {
            return 0.0;
        }
        let sampling = clamp_sampling_window(sampling);

        let snapshot = match snapshot_processes() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Process snapshot failed: {err}");
                return 0.0;
            }
        };
        let candidates = counter_candidates(&snapshot);
        self.prune_counters(&candidates);

        let mut counters = Vec::with_capacity(pids.len());
        for pid in pids {
            let Some(names) = candidates.get(pid) else {
                debug!("PID {pid} is not running");
                return 0.0;
            };
            match self.counter_for(*pid, names) {
                Ok(counter) => counters.push((*pid, counter)),
                Err(err) => {
                    if COUNTER_THROTTLE.allow() {
                        warn!("{err}");
                    }
                    return 0.0;
                }
            }
        }

        // A freshly added counter sometimes rejects its first collection.
        if Self::collect_all(&counters)
            .or_else(|_| Self::collect_all(&counters))
            .is_err()
        {
            return 0.0;
        }
        thread::sleep(sampling);
        if let Err(err) = Self::collect_all(&counters) {
            if COUNTER_THROTTLE.allow() {
                warn!("{err}");
            }
            return 0.0;
        }

        let mut percent = 0.0;
        for (pid, counter) in &counters {
            let guard = counter
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Instance names shift when a same-named process exits mid-sample.
            if guard.process_id().ok() != Some(*pid) {
                debug!("Counter instance {} no longer reports PID {pid}", guard.instance);
                return 0.0;
            }
            match guard.value() {
                Ok(value) => percent += value,
                Err(err) => {
                    debug!("{err}");
                    return 0.0;
                }
            }
        }
        percent / 100.0
    }
}
