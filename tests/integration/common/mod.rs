#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use procsentry::supervisor::{ProcessState, ProcessSupervisor, SupervisorEvent};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Writes an executable `sh` script into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("failed to chmod script");
    path
}

/// Records every event a supervisor raises.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<SupervisorEvent>>>,
}

impl EventRecorder {
    pub fn attach(supervisor: &ProcessSupervisor) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.events);
        supervisor.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        recorder
    }

    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<ProcessState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SupervisorEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn output_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SupervisorEvent::ConsoleOutput(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SupervisorEvent::ConsoleError(line) => Some(line),
                _ => None,
            })
            .collect()
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(25));
    }
}

pub fn wait_for_state(supervisor: &ProcessSupervisor, expected: ProcessState) {
    assert!(
        wait_until(Duration::from_secs(5), || supervisor.state() == expected),
        "Timed out waiting for state {expected}; still {}",
        supervisor.state()
    );
}

pub fn wait_for_pid(supervisor: &ProcessSupervisor) -> u32 {
    let mut pid = 0;
    assert!(
        wait_until(Duration::from_secs(5), || {
            pid = supervisor.process_id();
            pid != 0
        }),
        "Timed out waiting for a child PID"
    );
    pid
}

pub fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            let lines: Vec<_> = content.lines().map(|line| line.to_string()).collect();
            if lines.len() >= expected {
                return lines;
            }
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {expected} lines in {:?}", path);
        }

        thread::sleep(Duration::from_millis(100));
    }
}

pub fn wait_for_path(path: &Path) {
    assert!(
        wait_until(Duration::from_secs(5), || path.exists()),
        "Timed out waiting for {:?} to exist",
        path
    );
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(target_os = "linux")]
pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let stat_path = PathBuf::from(format!("/proc/{pid}/stat"));

    while Instant::now() < deadline {
        let Ok(stat) = fs::read_to_string(&stat_path) else {
            return;
        };
        // Zombies and dead entries count as exited.
        if let Some(state_start) = stat.rfind(')')
            && let Some(state) = stat[state_start + 1..].trim().chars().next()
            && (state == 'Z' || state == 'X')
        {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }

    panic!("Timed out waiting for PID {pid} to exit");
}
