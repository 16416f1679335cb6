//! Constants and tuning values shared by the supervisor and the system probes.
//!
//! Centralizes sentinels, timing floors and well-known file names so the
//! monitoring loop and the probes agree on them.

use std::time::Duration;

// ============================================================================
// Process Identity Sentinels
// ============================================================================

/// Process id reported while no child process exists.
pub const INVALID_PID: u32 = 0;

/// Exit code reported before the supervised program has run for the first time.
pub const EXIT_CODE_NOT_RUN: i32 = i32::MIN;

/// Exit code recorded when the operating system refused to start the program.
pub const EXIT_CODE_LAUNCH_FAILED: i32 = -1;

/// Exit code assumed when the exit status of a finished child cannot be read.
pub const EXIT_CODE_UNKNOWN: i32 = 0;

/// Offset added to a terminating signal number to form an exit code (shell convention).
pub const SIGNAL_EXIT_CODE_BASE: i32 = 128;

// ============================================================================
// Supervisor Timing
// ============================================================================

/// Default period of the "is the child still alive" wait.
pub const DEFAULT_MONITORING_INTERVAL: Duration = Duration::from_millis(1000);

/// Lower bound applied to the monitoring interval to avoid a tight spin loop.
pub const MIN_MONITORING_INTERVAL: Duration = Duration::from_millis(250);

/// Granularity used when polling the child or sleeping through the restart hold-off.
/// Every suspension point re-checks the stop flag at least this often.
pub const SUPERVISOR_POLL_STEP: Duration = Duration::from_millis(50);

/// Maximum time `stop` waits for the monitoring thread before abandoning it.
pub const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a cooperatively stopped child gets to exit before it is killed.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum time spent draining stdout/stderr reader threads after the child exits.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Output Capture
// ============================================================================

/// Suffix appended to the program stem when deriving the console output file name.
pub const CONSOLE_OUTPUT_FILE_SUFFIX: &str = "_ConsoleOutput.txt";

/// Width of the separator line written below the output file banner.
pub const BANNER_SEPARATOR_WIDTH: usize = 80;

// ============================================================================
// CPU Sampling
// ============================================================================

/// Shortest sampling window accepted by `core_usage_by_process_id`.
pub const MIN_SAMPLING_WINDOW: Duration = Duration::from_millis(100);

/// Sampling window used when callers do not choose one.
pub const DEFAULT_SAMPLING_WINDOW: Duration = Duration::from_secs(1);

/// Longest sampling window accepted by `core_usage_by_process_id`.
pub const MAX_SAMPLING_WINDOW: Duration = Duration::from_secs(10);

/// Minimum spacing between repeated diagnostic messages from one call site.
pub const DIAGNOSTIC_THROTTLE_WINDOW: Duration = Duration::from_secs(15);

// ============================================================================
// Linux Data Sources
// ============================================================================

/// Default mount point of procfs.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Default mount point of sysfs.
pub const DEFAULT_SYS_ROOT: &str = "/sys";

/// Number of leading `/proc/stat` cpu columns counted towards total time
/// (user, nice, system, idle, iowait, irq, softirq, steal). Guest columns are
/// already included in user time.
pub const PROC_STAT_TOTAL_COLUMNS: usize = 8;

/// Clamps a requested sampling window into the supported range.
pub fn clamp_sampling_window(requested: Duration) -> Duration {
    requested.clamp(MIN_SAMPLING_WINDOW, MAX_SAMPLING_WINDOW)
}

/// Clamps a requested monitoring interval to the supported floor.
pub fn clamp_monitoring_interval(requested: Duration) -> Duration {
    requested.max(MIN_MONITORING_INTERVAL)
}
