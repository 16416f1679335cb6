//! Supervision of a single external program.
//!
//! A [`ProcessSupervisor`] launches its program from a dedicated monitoring
//! thread, drains stdout/stderr on reader threads, records the exit code and
//! optionally relaunches the program after a hold-off. Callers only read the
//! runtime facts or issue `start`/`stop`.
mod output;
mod state;

pub use state::ProcessState;

use std::{
    env,
    error::Error,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        Arc, Condvar, Mutex, RwLock,
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    config::SupervisorConfig,
    constants::{
        EXIT_CODE_LAUNCH_FAILED, EXIT_CODE_NOT_RUN, EXIT_CODE_UNKNOWN,
        GRACEFUL_STOP_TIMEOUT, INVALID_PID, MONITOR_JOIN_TIMEOUT, OUTPUT_DRAIN_TIMEOUT,
        SUPERVISOR_POLL_STEP, clamp_monitoring_interval,
    },
    error::SupervisorError,
    logs::{EventLogger, Severity},
    system_info,
};

use output::{OutputFile, OutputRouter, SharedOutputFile, Stream, spawn_reader};

/// Notification raised by a supervisor.
///
/// State changes are produced only by the monitoring thread (or by `stop`),
/// output events by the reader threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    StateChanged(ProcessState),
    ConsoleOutput(String),
    ConsoleError(String),
}

/// Callback registered through [`ProcessSupervisor::subscribe`].
pub type EventHandler = Arc<dyn Fn(&SupervisorEvent) + Send + Sync>;

#[derive(Debug)]
struct Lifecycle {
    state: ProcessState,
    /// Incremented on every `start` and when `stop` abandons a monitoring
    /// thread; a monitoring thread may only move the state of its own epoch.
    epoch: u64,
    /// False between a state change and the end of its `StateChanged` delivery.
    settled: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: ProcessState::Idle,
            epoch: 0,
            settled: true,
        }
    }
}

/// State shared between the owning supervisor, its monitoring thread and the reader threads.
pub(crate) struct Shared {
    lifecycle: Mutex<Lifecycle>,
    lifecycle_changed: Condvar,
    pid: AtomicU32,
    exit_code: AtomicI32,
    launch_count: AtomicU64,
    last_started_at: Mutex<Option<DateTime<Utc>>>,
    stop_requested: AtomicBool,
    kill_requested: AtomicBool,
    child: Mutex<Option<Child>>,
    stdout_cache: Mutex<String>,
    stderr_cache: Mutex<String>,
    handlers: RwLock<Vec<EventHandler>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::default()),
            lifecycle_changed: Condvar::new(),
            pid: AtomicU32::new(INVALID_PID),
            exit_code: AtomicI32::new(EXIT_CODE_NOT_RUN),
            launch_count: AtomicU64::new(0),
            last_started_at: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
            child: Mutex::new(None),
            stdout_cache: Mutex::new(String::new()),
            stderr_cache: Mutex::new(String::new()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> (ProcessState, u64) {
        let guard = self.lifecycle();
        (guard.state, guard.epoch)
    }

    /// Moves `Idle -> Initializing` and opens a new epoch. Returns `None` when
    /// the supervisor is already active.
    fn begin(&self) -> Option<u64> {
        let mut guard = self.lifecycle();
        if guard.state != ProcessState::Idle {
            return None;
        }
        guard.state = ProcessState::Initializing;
        guard.epoch += 1;
        guard.settled = true;
        self.stop_requested.store(false, Ordering::SeqCst);
        self.kill_requested.store(false, Ordering::SeqCst);
        self.launch_count.store(0, Ordering::SeqCst);
        self.lifecycle_changed.notify_all();
        Some(guard.epoch)
    }

    /// Applies a lifecycle transition on behalf of `epoch`, raising
    /// `StateChanged` when `notify` is set. Disallowed or stale transitions
    /// are ignored.
    fn transition(&self, epoch: u64, next: ProcessState, notify: bool) -> bool {
        {
            let mut guard = self.lifecycle();
            if guard.epoch != epoch {
                debug!("Ignoring transition to {next} from stale epoch {epoch}");
                return false;
            }
            if !guard.state.can_transition_to(next) {
                debug!("Ignoring transition {} -> {next}", guard.state);
                return false;
            }
            guard.state = next;
            guard.settled = !notify;
            self.lifecycle_changed.notify_all();
        }

        if notify {
            self.emit(&SupervisorEvent::StateChanged(next));
            self.settle(epoch, next);
        }
        true
    }

    /// Marks the delivery of `state` as finished so idle waiters may return.
    fn settle(&self, epoch: u64, state: ProcessState) {
        let mut guard = self.lifecycle();
        if guard.epoch == epoch && guard.state == state {
            guard.settled = true;
            self.lifecycle_changed.notify_all();
        }
    }

    /// Forces the state back to `Idle` and invalidates the current epoch so a
    /// detached monitoring thread can no longer change it.
    fn abandon(&self) {
        let (previous, epoch) = {
            let mut guard = self.lifecycle();
            let previous = guard.state;
            guard.state = ProcessState::Idle;
            guard.epoch += 1;
            guard.settled = previous == ProcessState::Idle;
            self.lifecycle_changed.notify_all();
            (previous, guard.epoch)
        };
        self.pid.store(INVALID_PID, Ordering::SeqCst);
        lock_or_recover(&self.child).take();
        if previous != ProcessState::Idle {
            self.emit(&SupervisorEvent::StateChanged(ProcessState::Idle));
            self.settle(epoch, ProcessState::Idle);
        }
    }

    /// Runs `f` only while `epoch` is current. The lifecycle lock is held
    /// meanwhile, so `f` must not touch the lifecycle itself.
    pub(crate) fn for_epoch<T>(&self, epoch: u64, f: impl FnOnce() -> T) -> Option<T> {
        let guard = self.lifecycle();
        (guard.epoch == epoch).then(f)
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.lifecycle().epoch == epoch
    }

    fn wait_until_idle(&self, timeout: Duration) -> bool {
        let guard = self.lifecycle();
        let (guard, _) = self
            .lifecycle_changed
            .wait_timeout_while(guard, timeout, |lifecycle| {
                lifecycle.state != ProcessState::Idle || !lifecycle.settled
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.state == ProcessState::Idle && guard.settled
    }

    /// Delivers `event` to every handler. A panicking handler is logged and
    /// does not take the calling thread down.
    pub(crate) fn emit(&self, event: &SupervisorEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());

        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!("Supervisor event handler panicked while handling {event:?}");
            }
        }
    }

    /// Appends to the stdout cache unless `epoch` has been abandoned.
    pub(crate) fn append_stdout(&self, epoch: u64, line: &str) {
        self.for_epoch(epoch, || append_line(&self.stdout_cache, line));
    }

    pub(crate) fn append_stderr(&self, epoch: u64, line: &str) {
        self.for_epoch(epoch, || append_line(&self.stderr_cache, line));
    }

    fn clear_caches(&self) {
        lock_or_recover(&self.stdout_cache).clear();
        lock_or_recover(&self.stderr_cache).clear();
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Runs `f` against the current child while holding the child lock briefly.
    fn with_child<T>(&self, f: impl FnOnce(&mut Child) -> T) -> Option<T> {
        lock_or_recover(&self.child).as_mut().map(f)
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn append_line(buffer: &Mutex<String>, line: &str) {
    let mut guard = lock_or_recover(buffer);
    guard.push_str(line);
    guard.push('\n');
}

/// Routes supervisor diagnostics to the registered logger, the console or `tracing`.
#[derive(Clone)]
struct Reporter {
    name: String,
    logger: Option<Arc<dyn EventLogger>>,
    notify_on_exception: bool,
}

impl Reporter {
    fn event(&self, message: &str, severity: Severity) {
        let message = format!("[{}] {message}", self.name);
        match &self.logger {
            Some(logger) => logger.post_event(&message, severity, false),
            None => match severity {
                Severity::Debug => debug!("{message}"),
                Severity::Info => info!("{message}"),
                Severity::Warning => warn!("{message}"),
                Severity::Error => error!("{message}"),
            },
        }
    }

    fn error(&self, message: &str, err: Option<&dyn Error>) {
        let message = format!("[{}] {message}", self.name);
        match (&self.logger, err) {
            (Some(logger), _) => logger.post_error(&message, err, false),
            (None, Some(err)) if self.notify_on_exception => eprintln!("{message}: {err}"),
            (None, None) if self.notify_on_exception => eprintln!("{message}"),
            (None, Some(err)) => warn!("{message}: {err}"),
            (None, None) => warn!("{message}"),
        }
    }
}

/// Runs one external program under supervision.
///
/// Configure it through [`ProcessSupervisor::config_mut`] before calling
/// [`ProcessSupervisor::start`]; changes made while running apply to the next
/// `start`.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    logger: Option<Arc<dyn EventLogger>>,
    shared: Arc<Shared>,
    monitor: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            logger: None,
            shared: Arc::new(Shared::new()),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SupervisorConfig {
        &mut self.config
    }

    pub fn set_config(&mut self, config: SupervisorConfig) {
        self.config = config;
    }

    /// Registers the logger that receives events and errors.
    pub fn set_logger(&mut self, logger: Arc<dyn EventLogger>) {
        self.logger = Some(logger);
    }

    /// Registers a handler for state and output events.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&SupervisorEvent) + Send + Sync + 'static,
    {
        let mut guard = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(Arc::new(handler));
    }

    pub fn name(&self) -> String {
        self.config.display_name()
    }

    pub fn state(&self) -> ProcessState {
        self.shared.snapshot().0
    }

    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Id of the current child, or [`INVALID_PID`] when there is none.
    pub fn process_id(&self) -> u32 {
        self.shared.pid.load(Ordering::SeqCst)
    }

    /// Exit code of the last run, [`EXIT_CODE_NOT_RUN`] before the first one.
    pub fn exit_code(&self) -> i32 {
        self.shared.exit_code.load(Ordering::SeqCst)
    }

    /// Number of successful launches since the last `start`.
    pub fn launch_count(&self) -> u64 {
        self.shared.launch_count.load(Ordering::SeqCst)
    }

    pub fn last_started_at(&self) -> Option<DateTime<Utc>> {
        *lock_or_recover(&self.shared.last_started_at)
    }

    /// Stdout lines captured while `cache_standard_output` is enabled, newline-terminated.
    pub fn cached_console_output(&self) -> String {
        lock_or_recover(&self.shared.stdout_cache).clone()
    }

    /// Stderr lines of the current or last run, newline-terminated.
    pub fn cached_error_output(&self) -> String {
        lock_or_recover(&self.shared.stderr_cache).clone()
    }

    /// Fractional cores used by the current child over `sampling`; 0 when no child runs.
    pub fn cpu_usage(&self, sampling: Duration) -> f64 {
        match self.process_id() {
            INVALID_PID => 0.0,
            pid => system_info::core_usage_by_process_id(&[pid], sampling),
        }
    }

    /// Blocks until the supervisor is idle or `timeout` elapses; returns whether it is idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.shared.wait_until_idle(timeout)
    }

    fn reporter(&self) -> Reporter {
        Reporter {
            name: self.config.display_name(),
            logger: self.logger.clone(),
            notify_on_exception: self.config.notify_on_exception,
        }
    }

    /// Starts supervising the configured program on a new monitoring thread.
    ///
    /// Does nothing when already active. With `rethrow_on_exception` set and
    /// no logger registered, a missing program or working directory is
    /// returned here instead of being reported from the monitoring thread.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let config = self.config.clone();
        if config.rethrow_on_exception && self.logger.is_none() {
            resolve_launch_paths(&config)?;
        }

        let mut slot = self.monitor.lock()?;
        let Some(epoch) = self.shared.begin() else {
            debug!("Supervisor '{}' already running; start ignored", self.name());
            return Ok(());
        };

        if let Some(previous) = slot.take()
            && previous.is_finished()
        {
            let _ = previous.join();
        }

        let name = config.display_name();
        let shared = Arc::clone(&self.shared);
        let reporter = self.reporter();
        let spawn_result = thread::Builder::new()
            .name(format!("{name}-monitor"))
            .spawn(move || run_monitor(shared, config, reporter, epoch));

        match spawn_result {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.shared.transition(epoch, ProcessState::Idle, true);
                Err(SupervisorError::MonitorSpawnError { name, source })
            }
        }
    }

    /// Stops supervision.
    ///
    /// `kill` terminates the child immediately; otherwise the child is asked
    /// to exit and killed only if it ignores the request. Waits a bounded
    /// time for the monitoring thread, then abandons it. No-op when idle.
    pub fn stop(&self, kill: bool) {
        let (state, epoch) = self.shared.snapshot();
        if state == ProcessState::Idle {
            return;
        }

        let reporter = self.reporter();
        self.shared.kill_requested.store(kill, Ordering::SeqCst);
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.transition(epoch, ProcessState::CleaningUp, true);

        if kill
            && matches!(
                state,
                ProcessState::Initializing | ProcessState::Launching | ProcessState::Running
            )
        {
            kill_child(&self.shared, &reporter);
        }

        let handle = lock_or_recover(&self.monitor).take();
        if let Some(handle) = handle
            && let Err(handle) = join_with_timeout(handle, MONITOR_JOIN_TIMEOUT)
        {
            reporter.error(
                &format!(
                    "Monitoring thread did not finish within {MONITOR_JOIN_TIMEOUT:?}; abandoning it"
                ),
                None,
            );
            kill_child(&self.shared, &reporter);
            drop(handle);
            self.shared.abandon();
            return;
        }

        self.shared.transition(epoch, ProcessState::Idle, true);
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop(true);
        }
    }
}

/// Joins `handle` if it finishes within `timeout`; hands it back otherwise.
fn join_with_timeout(
    handle: thread::JoinHandle<()>,
    timeout: Duration,
) -> Result<(), thread::JoinHandle<()>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(handle);
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        warn!("Monitoring thread panicked");
    }
    Ok(())
}

/// Best-effort forced termination of the current child and its process group.
fn kill_child(shared: &Shared, reporter: &Reporter) {
    #[cfg(unix)]
    {
        use nix::{errno::Errno, sys::signal::Signal};

        if let Err(err) = signal_process_group(shared, Signal::SIGKILL)
            && err.raw_os_error() != Some(Errno::ESRCH as i32)
        {
            reporter.error("Failed to kill child process group", Some(&err));
        }
    }

    let result = shared.with_child(|child| child.kill());
    match result {
        Some(Ok(())) => debug!("Sent kill to child of '{}'", reporter.name),
        Some(Err(err)) if err.kind() == std::io::ErrorKind::InvalidInput => {
            debug!("Child of '{}' already exited", reporter.name);
        }
        Some(Err(err)) => reporter.error("Failed to kill child process", Some(&err)),
        None => debug!("No child to kill for '{}'", reporter.name),
    }
}

/// Checks that the program and working directory exist and returns the
/// resolved program path together with the working directory.
///
/// A relative program is looked up in the working directory, then relative
/// to the current directory, then (for bare names) on `PATH`.
pub fn resolve_launch_paths(
    config: &SupervisorConfig,
) -> Result<(PathBuf, PathBuf), SupervisorError> {
    if !config.work_dir.is_dir() {
        return Err(SupervisorError::WorkDirNotFound(config.work_dir.clone()));
    }
    let program = resolve_program(&config.program, &config.work_dir)
        .ok_or_else(|| SupervisorError::ProgramNotFound(config.program.clone()))?;
    Ok((program, config.work_dir.clone()))
}

fn resolve_program(program: &Path, work_dir: &Path) -> Option<PathBuf> {
    if program.as_os_str().is_empty() {
        return None;
    }
    if program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }

    let in_work_dir = work_dir.join(program);
    if in_work_dir.is_file() {
        return std::path::absolute(&in_work_dir).ok();
    }
    if program.is_file() {
        return std::path::absolute(program).ok();
    }

    if program.components().count() == 1 {
        let search_path = env::var_os("PATH")?;
        for dir in env::split_paths(&search_path) {
            let candidate = dir.join(program);
            if candidate.is_file() {
                return Some(candidate);
            }
            #[cfg(windows)]
            {
                let with_exe = candidate.with_extension("exe");
                if with_exe.is_file() {
                    return Some(with_exe);
                }
            }
        }
    }

    None
}

/// Translates an exit status into the recorded exit code.
fn exit_code_of(status: Option<ExitStatus>) -> i32 {
    let Some(status) = status else {
        return EXIT_CODE_UNKNOWN;
    };
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return crate::constants::SIGNAL_EXIT_CODE_BASE + signal;
        }
    }

    EXIT_CODE_UNKNOWN
}

fn build_command(program: &Path, config: &SupervisorConfig, redirect: bool) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(config.argument_list());
    cmd.current_dir(&config.work_dir);

    if redirect {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
    }

    // Own process group, so stops reach descendants the program did not exec into.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        if redirect {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
    }

    cmd
}

fn open_output_file(
    config: &SupervisorConfig,
    reporter: &Reporter,
) -> Option<OutputFile> {
    let path = config.resolved_output_file_path();
    let program = config.program.display().to_string();
    let banner = config
        .write_output_file_banner
        .then_some((program.as_str(), config.arguments.as_str()));

    match OutputFile::create(&path, banner) {
        Ok(file) => {
            debug!("Writing console output of '{}' to {:?}", reporter.name, file.path());
            Some(file)
        }
        Err(err) => {
            reporter.error(
                &format!(
                    "Failed to open console output file {}; continuing without it",
                    path.display()
                ),
                Some(&err),
            );
            None
        }
    }
}

/// Monitoring thread body: validate, then launch/watch/relaunch until done.
fn run_monitor(
    shared: Arc<Shared>,
    config: SupervisorConfig,
    reporter: Reporter,
    epoch: u64,
) {
    let (program, _) = match resolve_launch_paths(&config) {
        Ok(paths) => paths,
        Err(err) => {
            reporter.error("Cannot start supervised program", Some(&err));
            shared.transition(epoch, ProcessState::Idle, true);
            return;
        }
    };

    let redirect = config.needs_redirection();
    let output_file: SharedOutputFile = Arc::new(Mutex::new(None));
    if config.write_console_output_to_file {
        *lock_or_recover(&output_file) = open_output_file(&config, &reporter);
    }
    shared.clear_caches();

    let router = Arc::new(OutputRouter::new(
        Arc::clone(&shared),
        epoch,
        config.echo_output_to_console,
        config.cache_standard_output,
        Arc::clone(&output_file),
    ));
    let interval = clamp_monitoring_interval(config.monitoring_interval());

    loop {
        if shared.stop_requested() {
            break;
        }
        if !shared.transition(epoch, ProcessState::Launching, false) {
            break;
        }

        if shared
            .for_epoch(epoch, || lock_or_recover(&shared.stderr_cache).clear())
            .is_none()
        {
            break;
        }
        let mut command = build_command(&program, &config, redirect);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::LaunchError {
                    program: program.display().to_string(),
                    source,
                };
                reporter.error("Launch failed", Some(&err));
                shared.for_epoch(epoch, || {
                    shared
                        .exit_code
                        .store(EXIT_CODE_LAUNCH_FAILED, Ordering::SeqCst)
                });
                break;
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut pending = Some(child);
        let accepted = shared
            .for_epoch(epoch, || {
                shared.pid.store(pid, Ordering::SeqCst);
                shared.launch_count.fetch_add(1, Ordering::SeqCst);
                *lock_or_recover(&shared.last_started_at) = Some(Utc::now());
                *lock_or_recover(&shared.child) = pending.take();
            })
            .is_some();
        if !accepted {
            if let Some(mut child) = pending {
                debug!("Discarding child of abandoned run of '{}'", reporter.name);
                let _ = child.kill();
                let _ = child.wait();
            }
            break;
        }
        info!("Supervised program '{}' started with PID {pid}", reporter.name);

        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            match spawn_reader(&reporter.name, Stream::Stdout, stdout, Arc::clone(&router)) {
                Ok(handle) => readers.push(handle),
                Err(err) => reporter.error("Failed to start stdout reader", Some(&err)),
            }
        }
        if let Some(stderr) = stderr {
            match spawn_reader(&reporter.name, Stream::Stderr, stderr, Arc::clone(&router)) {
                Ok(handle) => readers.push(handle),
                Err(err) => reporter.error("Failed to start stderr reader", Some(&err)),
            }
        }

        shared.transition(epoch, ProcessState::Running, true);

        let status = wait_for_exit(&shared, epoch, interval, &reporter);

        let exit_code = exit_code_of(status);
        let current = shared
            .for_epoch(epoch, || {
                shared.pid.store(INVALID_PID, Ordering::SeqCst);
                lock_or_recover(&shared.child).take();
                shared.exit_code.store(exit_code, Ordering::SeqCst);
            })
            .is_some();

        drain_readers(readers, &reporter);
        if let Some(file) = lock_or_recover(&output_file).as_mut() {
            file.flush();
        }
        if !current {
            debug!("Run of '{}' was abandoned; leaving its results", reporter.name);
            break;
        }
        report_termination(&shared, &reporter, exit_code);

        if !config.repeat || shared.stop_requested() {
            break;
        }

        if !shared.transition(epoch, ProcessState::WaitingToRestart, true) {
            break;
        }
        let hold_off = config.repeat_hold_off();
        info!(
            "Relaunching '{}' after {:.1}s hold-off",
            reporter.name,
            hold_off.as_secs_f64()
        );
        if !sleep_unless_stopped(&shared, hold_off) {
            break;
        }
    }

    if let Some(mut file) = lock_or_recover(&output_file).take() {
        file.close();
    }
    shared.transition(epoch, ProcessState::Idle, true);
    debug!("Monitoring thread for '{}' finished", reporter.name);
}

/// Waits for the child to exit, polling in monitoring-interval slices.
///
/// A stop request ends the wait: forced stops kill the child, cooperative
/// stops ask it to exit first. A failing status query is treated as "not
/// running" and yields `None`, as does an abandoned epoch.
fn wait_for_exit(
    shared: &Shared,
    epoch: u64,
    interval: Duration,
    reporter: &Reporter,
) -> Option<ExitStatus> {
    loop {
        if !shared.is_current(epoch) {
            return None;
        }
        if shared.stop_requested() {
            let force = shared.kill_requested.load(Ordering::SeqCst);
            return terminate_child(shared, reporter, force);
        }

        match wait_with_timeout(shared, epoch, interval) {
            Ok(Some(status)) => return Some(status),
            Ok(None) => debug!("'{}' still running", reporter.name),
            Err(err) => {
                reporter.error("Failed to query child status", Some(&err));
                return None;
            }
        }
    }
}

/// Polls the child until it exits, `timeout` elapses or a stop is requested.
fn wait_with_timeout(
    shared: &Shared,
    epoch: u64,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        let polled = shared.for_epoch(epoch, || shared.with_child(|child| child.try_wait()));
        match polled.flatten() {
            Some(Ok(Some(status))) => return Ok(Some(status)),
            Some(Ok(None)) => {}
            Some(Err(err)) => return Err(err),
            None => return Ok(None),
        }

        if Instant::now() >= deadline || shared.stop_requested() {
            return Ok(None);
        }
        thread::sleep(SUPERVISOR_POLL_STEP);
    }
}

/// Ends the child for a stop request and reaps it.
fn terminate_child(shared: &Shared, reporter: &Reporter, force: bool) -> Option<ExitStatus> {
    if !force && request_exit(shared, reporter) {
        let deadline = Instant::now() + GRACEFUL_STOP_TIMEOUT;
        while Instant::now() < deadline {
            match shared.with_child(|child| child.try_wait()) {
                Some(Ok(Some(status))) => return Some(status),
                Some(Ok(None)) => thread::sleep(SUPERVISOR_POLL_STEP),
                Some(Err(_)) | None => break,
            }
        }
        warn!(
            "'{}' did not exit within {GRACEFUL_STOP_TIMEOUT:?}; killing it",
            reporter.name
        );
    }

    kill_child(shared, reporter);
    match shared.with_child(|child| child.wait()) {
        Some(Ok(status)) => Some(status),
        Some(Err(err)) => {
            reporter.error("Failed to reap child process", Some(&err));
            None
        }
        None => None,
    }
}

/// Sends `signal` to the process group led by the current child.
#[cfg(unix)]
fn signal_process_group(
    shared: &Shared,
    signal: nix::sys::signal::Signal,
) -> std::io::Result<()> {
    use nix::{sys::signal::killpg, unistd::Pid};

    let pid = shared.pid.load(Ordering::SeqCst);
    if pid == INVALID_PID {
        return Ok(());
    }
    killpg(Pid::from_raw(pid as i32), signal)
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

/// Asks the child's process group to exit on its own; returns whether the
/// request was delivered.
#[cfg(unix)]
fn request_exit(shared: &Shared, reporter: &Reporter) -> bool {
    use nix::{errno::Errno, sys::signal::Signal};

    if shared.pid.load(Ordering::SeqCst) == INVALID_PID {
        return false;
    }
    match signal_process_group(shared, Signal::SIGTERM) {
        Ok(()) => {
            debug!("Sent SIGTERM to process group of '{}'", reporter.name);
            true
        }
        Err(err) if err.raw_os_error() == Some(Errno::ESRCH as i32) => {
            debug!("'{}' exited before SIGTERM", reporter.name);
            true
        }
        Err(err) => {
            reporter.error("Failed to signal child process group", Some(&err));
            false
        }
    }
}

/// Windows has no polite-exit request for arbitrary console programs, so
/// cooperative stops fall through to termination.
#[cfg(not(unix))]
fn request_exit(_shared: &Shared, _reporter: &Reporter) -> bool {
    false
}

/// Joins reader threads so the caches are complete, within a bounded time.
fn drain_readers(readers: Vec<thread::JoinHandle<()>>, reporter: &Reporter) {
    let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
    for handle in readers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if join_with_timeout(handle, remaining).is_err() {
            debug!(
                "Output of '{}' still open after exit (inherited by a descendant?)",
                reporter.name
            );
        }
    }
}

fn report_termination(shared: &Shared, reporter: &Reporter, exit_code: i32) {
    let errors = lock_or_recover(&shared.stderr_cache).clone();
    let mut message = format!("Program terminated with exit code {exit_code}");
    if !errors.trim().is_empty() {
        message.push_str("\nError output:\n");
        message.push_str(errors.trim_end());
    }
    let severity = if exit_code == 0 {
        Severity::Info
    } else {
        Severity::Warning
    };
    reporter.event(&message, severity);
}

/// Sleeps for `duration` in small steps; returns `false` if a stop was requested.
fn sleep_unless_stopped(shared: &Shared, duration: Duration) -> bool {
    let mut slept = Duration::ZERO;
    while slept < duration {
        if shared.stop_requested() {
            return false;
        }
        let step = duration.saturating_sub(slept).min(SUPERVISOR_POLL_STEP);
        thread::sleep(step);
        slept += step;
    }
    !shared.stop_requested()
}
