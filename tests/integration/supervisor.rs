#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{
    error::Error,
    fs,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use common::{EventRecorder, wait_for_pid, wait_for_state, wait_until, write_script};
use procsentry::{
    config::SupervisorConfig,
    constants::{EXIT_CODE_LAUNCH_FAILED, INVALID_PID},
    logs::{EventLogger, Severity},
    supervisor::{ProcessState, ProcessSupervisor, SupervisorEvent},
};
use tempfile::tempdir;

fn quiet_config(program: impl Into<std::path::PathBuf>, work_dir: &std::path::Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::new(program, work_dir);
    config.echo_output_to_console = false;
    config.cache_standard_output = true;
    config.notify_on_exception = false;
    config
}

#[test]
fn exit_code_of_short_lived_program_is_recorded() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "exit7.sh", "exit 7");

    let supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
    supervisor.start().expect("start failed");

    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));
    assert_eq!(supervisor.state(), ProcessState::Idle);
    assert_eq!(supervisor.exit_code(), 7);
    assert_eq!(supervisor.process_id(), INVALID_PID);
    assert_eq!(supervisor.launch_count(), 1);
    assert!(supervisor.last_started_at().is_some());
}

#[test]
fn echo_hello_is_cached_exactly() {
    let temp = tempdir().expect("failed to create tempdir");
    let mut config = quiet_config("/bin/echo", temp.path());
    config.arguments = "hello".to_string();

    let supervisor = ProcessSupervisor::new(config);
    let recorder = EventRecorder::attach(&supervisor);
    supervisor.start().expect("start failed");

    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));
    assert_eq!(supervisor.exit_code(), 0);
    assert_eq!(supervisor.cached_console_output(), "hello\n");
    assert_eq!(recorder.output_lines(), vec!["hello".to_string()]);
    assert_eq!(
        recorder.states(),
        vec![ProcessState::Running, ProcessState::Idle]
    );
}

#[test]
fn cached_output_keeps_every_line_in_order() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(
        temp.path(),
        "count.sh",
        "i=1\nwhile [ $i -le 200 ]; do\n  echo \"line $i\"\n  i=$((i+1))\ndone",
    );

    let supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
    supervisor.start().expect("start failed");
    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));

    let expected: Vec<String> = (1..=200).map(|i| format!("line {i}")).collect();
    let cached: Vec<String> = supervisor
        .cached_console_output()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(cached, expected);
}

#[test]
fn stderr_lines_go_to_error_cache_only() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(
        temp.path(),
        "mixed.sh",
        "echo out\necho boom >&2\nexit 3",
    );

    let supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
    let recorder = EventRecorder::attach(&supervisor);
    supervisor.start().expect("start failed");
    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));

    assert_eq!(supervisor.exit_code(), 3);
    assert_eq!(supervisor.cached_console_output(), "out\n");
    assert_eq!(supervisor.cached_error_output(), "boom\n");
    assert_eq!(recorder.error_lines(), vec!["boom".to_string()]);
}

#[test]
fn graceful_stop_terminates_running_child() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "sleeper.sh", "exec sleep 30");

    let supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
    supervisor.start().expect("start failed");
    wait_for_state(&supervisor, ProcessState::Running);
    let pid = wait_for_pid(&supervisor);

    let started = Instant::now();
    supervisor.stop(false);
    assert!(started.elapsed() < Duration::from_secs(6));

    assert_eq!(supervisor.state(), ProcessState::Idle);
    assert_eq!(supervisor.exit_code(), 128 + 15);
    assert!(wait_until(Duration::from_secs(5), || !common::is_process_alive(pid)));
}

#[test]
fn kill_stop_ends_child_and_reaches_idle() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "sleeper.sh", "exec sleep 30");

    let supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
    let recorder = EventRecorder::attach(&supervisor);
    supervisor.start().expect("start failed");
    let pid = wait_for_pid(&supervisor);

    let started = Instant::now();
    supervisor.stop(true);
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(supervisor.state(), ProcessState::Idle);
    assert_eq!(supervisor.exit_code(), 128 + 9);
    assert!(wait_until(Duration::from_secs(5), || !common::is_process_alive(pid)));

    let states = recorder.states();
    assert!(states.contains(&ProcessState::CleaningUp));
    assert_eq!(states.last(), Some(&ProcessState::Idle));
}

#[test]
fn repeat_relaunches_until_stopped() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "tick.sh", "echo tick");
    let mut config = quiet_config(&script, temp.path());
    config.repeat = true;
    config.repeat_hold_off_seconds = 0.0;

    let supervisor = ProcessSupervisor::new(config);
    let recorder = EventRecorder::attach(&supervisor);
    supervisor.start().expect("start failed");

    assert!(wait_until(Duration::from_secs(10), || supervisor.launch_count() >= 2));
    supervisor.stop(true);

    assert_eq!(supervisor.state(), ProcessState::Idle);
    assert!(recorder.states().contains(&ProcessState::WaitingToRestart));
    assert!(supervisor.cached_console_output().lines().count() >= 2);
}

#[test]
fn without_repeat_program_runs_once() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "once.sh", "echo once");

    let supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
    let recorder = EventRecorder::attach(&supervisor);
    supervisor.start().expect("start failed");
    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));
    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(supervisor.launch_count(), 1);
    assert!(!recorder.states().contains(&ProcessState::WaitingToRestart));
}

#[test]
fn stop_during_hold_off_returns_promptly() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "quick.sh", "exit 0");
    let mut config = quiet_config(&script, temp.path());
    config.repeat = true;
    config.repeat_hold_off_seconds = 30.0;

    let supervisor = ProcessSupervisor::new(config);
    supervisor.start().expect("start failed");
    wait_for_state(&supervisor, ProcessState::WaitingToRestart);

    let started = Instant::now();
    supervisor.stop(false);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(supervisor.state(), ProcessState::Idle);
    assert_eq!(supervisor.launch_count(), 1);
}

#[test]
fn launch_failure_records_sentinel_and_does_not_relaunch() {
    let temp = tempdir().expect("failed to create tempdir");
    let not_executable = temp.path().join("plain.txt");
    fs::write(&not_executable, "not a program").expect("failed to write file");
    let mut config = quiet_config(&not_executable, temp.path());
    config.repeat = true;

    let supervisor = ProcessSupervisor::new(config);
    supervisor.start().expect("start failed");

    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));
    assert_eq!(supervisor.exit_code(), EXIT_CODE_LAUNCH_FAILED);
    assert_eq!(supervisor.launch_count(), 0);
}

#[test]
fn output_file_receives_banner_and_lines() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "report.sh", "echo first\necho second");
    let output_path = temp.path().join("report.log");

    let mut config = quiet_config(&script, temp.path());
    config.cache_standard_output = false;
    config.write_console_output_to_file = true;
    config.console_output_file_path = Some(output_path.clone());
    config.write_output_file_banner = true;
    config.arguments = "--verbose".to_string();

    let supervisor = ProcessSupervisor::new(config);
    supervisor.start().expect("start failed");
    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));

    let lines = common::wait_for_lines(&output_path, 4);
    assert_eq!(lines[0], format!("{} --verbose", script.display()));
    assert_eq!(lines[1], "-".repeat(80));
    assert_eq!(&lines[2..], ["first", "second"]);
    assert_eq!(supervisor.cached_console_output(), "");
}

#[test]
fn output_file_path_defaults_to_work_dir() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "nightly.sh", "echo done");

    let mut config = quiet_config(&script, temp.path());
    config.write_console_output_to_file = true;

    let supervisor = ProcessSupervisor::new(config);
    supervisor.start().expect("start failed");
    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));

    let expected = temp.path().join("nightly_ConsoleOutput.txt");
    common::wait_for_path(&expected);
    assert_eq!(fs::read_to_string(expected).unwrap(), "done\n");
}

#[test]
fn second_start_while_running_is_ignored() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "sleeper.sh", "exec sleep 30");

    let supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
    supervisor.start().expect("start failed");
    let pid = wait_for_pid(&supervisor);

    supervisor.start().expect("second start failed");
    assert_eq!(supervisor.process_id(), pid);
    assert_eq!(supervisor.launch_count(), 1);

    supervisor.stop(true);
    assert_eq!(supervisor.state(), ProcessState::Idle);
}

#[test]
fn supervisor_can_be_restarted_after_idle() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "hello.sh", "echo again");

    let supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
    for _ in 0..2 {
        supervisor.start().expect("start failed");
        assert!(supervisor.wait_for_idle(Duration::from_secs(10)));
        assert_eq!(supervisor.cached_console_output(), "again\n");
        assert_eq!(supervisor.launch_count(), 1);
    }
}

#[cfg(target_os = "linux")]
#[test]
fn dropping_active_supervisor_kills_child() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "sleeper.sh", "exec sleep 30");

    let pid = {
        let supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
        supervisor.start().expect("start failed");
        wait_for_pid(&supervisor)
    };

    common::wait_for_process_exit(pid);
}

#[cfg(target_os = "linux")]
fn spawn_background_worker(temp: &std::path::Path) -> (ProcessSupervisor, u32) {
    let script = write_script(
        temp,
        "forks.sh",
        "sleep 30 &
echo $! > worker.pid
wait",
    );
    let supervisor = ProcessSupervisor::new(quiet_config(&script, temp));
    supervisor.start().expect("start failed");
    wait_for_state(&supervisor, ProcessState::Running);

    let pid_file = temp.join("worker.pid");
    let mut worker = 0;
    assert!(
        wait_until(Duration::from_secs(5), || {
            worker = fs::read_to_string(&pid_file)
                .ok()
                .and_then(|content| content.trim().parse().ok())
                .unwrap_or(0);
            worker != 0
        }),
        "background worker never reported its PID"
    );
    (supervisor, worker)
}

#[cfg(target_os = "linux")]
#[test]
fn kill_stop_reaches_background_workers() {
    let temp = tempdir().expect("failed to create tempdir");
    let (supervisor, worker) = spawn_background_worker(temp.path());

    let started = Instant::now();
    supervisor.stop(true);
    let elapsed = started.elapsed();

    assert_eq!(supervisor.state(), ProcessState::Idle);
    assert!(
        elapsed < Duration::from_millis(1500),
        "stop waited on pipes held by the worker: {elapsed:?}"
    );
    common::wait_for_process_exit(worker);
}

#[cfg(target_os = "linux")]
#[test]
fn graceful_stop_reaches_background_workers() {
    let temp = tempdir().expect("failed to create tempdir");
    let (supervisor, worker) = spawn_background_worker(temp.path());

    supervisor.stop(false);

    assert_eq!(supervisor.state(), ProcessState::Idle);
    common::wait_for_process_exit(worker);
}

#[derive(Default)]
struct RecordingLogger {
    entries: Mutex<Vec<(Severity, String)>>,
}

impl EventLogger for RecordingLogger {
    fn post_event(&self, message: &str, severity: Severity, _local_only: bool) {
        self.entries
            .lock()
            .unwrap()
            .push((severity, message.to_string()));
    }

    fn post_error(&self, message: &str, error: Option<&dyn Error>, _local_only: bool) {
        let text = match error {
            Some(err) => format!("{message}: {err}"),
            None => message.to_string(),
        };
        self.entries.lock().unwrap().push((Severity::Error, text));
    }
}

#[test]
fn logger_receives_termination_with_error_output() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "fails.sh", "echo 'disk full' >&2\nexit 4");
    let logger = Arc::new(RecordingLogger::default());

    let mut supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
    supervisor.set_logger(logger.clone());
    supervisor.start().expect("start failed");
    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));

    let entries = logger.entries.lock().unwrap();
    let (severity, message) = entries
        .iter()
        .find(|(_, message)| message.contains("exit code 4"))
        .expect("termination message missing");
    assert_eq!(*severity, Severity::Warning);
    assert!(message.contains("disk full"));
}

#[test]
fn logger_receives_missing_program_error() {
    let temp = tempdir().expect("failed to create tempdir");
    let logger = Arc::new(RecordingLogger::default());

    let mut config = quiet_config(temp.path().join("absent"), temp.path());
    config.rethrow_on_exception = true;
    let mut supervisor = ProcessSupervisor::new(config);
    supervisor.set_logger(logger.clone());

    supervisor.start().expect("with a logger, errors are reported not returned");
    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));

    let entries = logger.entries.lock().unwrap();
    assert!(
        entries
            .iter()
            .any(|(severity, message)| *severity == Severity::Error
                && message.contains("does not exist"))
    );
}

#[test]
fn cpu_usage_is_zero_without_child() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor = ProcessSupervisor::new(quiet_config("/bin/true", temp.path()));
    assert_eq!(supervisor.cpu_usage(Duration::from_millis(100)), 0.0);
}

#[test]
fn handlers_see_output_before_idle() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(temp.path(), "two.sh", "echo a\necho b");

    let supervisor = ProcessSupervisor::new(quiet_config(&script, temp.path()));
    let recorder = EventRecorder::attach(&supervisor);
    supervisor.start().expect("start failed");
    assert!(supervisor.wait_for_idle(Duration::from_secs(10)));

    let events = recorder.events();
    let idle_at = events
        .iter()
        .position(|event| *event == SupervisorEvent::StateChanged(ProcessState::Idle))
        .expect("idle event missing");
    let last_output = events
        .iter()
        .rposition(|event| matches!(event, SupervisorEvent::ConsoleOutput(_)))
        .expect("output events missing");
    assert!(last_output < idle_at);
}
