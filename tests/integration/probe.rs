#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use procsentry::{probe::ProcessSample, system_info};

#[test]
fn total_memory_is_stable_across_calls() {
    let first = system_info::total_memory_mb();
    let second = system_info::total_memory_mb();
    assert_eq!(first, second);
}

#[test]
fn usage_of_missing_process_is_zero() {
    let usage = system_info::core_usage_by_process_id(&[u32::MAX - 1], Duration::from_millis(200));
    assert_eq!(usage, 0.0);
}

#[test]
fn own_process_is_enumerated() {
    let processes = system_info::processes(true);
    let own = processes
        .get(&std::process::id())
        .expect("current process missing from enumeration");
    assert!(!own.name.is_empty());
    assert!(own.executable.is_some());
    assert!(own.command_line.is_some());
}

#[test]
fn process_sample_serializes_with_snake_case_fields() {
    let sample = ProcessSample::new(7, "worker")
        .with_command_tokens(vec!["/opt/worker".to_string(), "-v".to_string()]);
    let json = serde_json::to_value(&sample).unwrap();
    assert_eq!(json["pid"], 7);
    assert_eq!(json["name"], "worker");
    assert_eq!(json["command_line"], "/opt/worker -v");
    assert_eq!(json["arguments"][0], "-v");
}

#[cfg(target_os = "linux")]
#[test]
fn busy_loop_uses_about_one_core() {
    use std::process::{Command, Stdio};

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg("while :; do :; done")
        .stdout(Stdio::null())
        .spawn()
        .expect("failed to spawn busy loop");
    let pid = child.id();

    let usage = system_info::core_usage_by_process_id(&[pid], Duration::from_secs(2));

    child.kill().expect("failed to kill busy loop");
    child.wait().expect("failed to reap busy loop");

    assert!(usage > 0.3, "busy loop usage too low: {usage}");
    assert!(usage < 1.5, "busy loop usage too high: {usage}");
}

#[cfg(target_os = "linux")]
#[test]
fn sleeping_process_uses_almost_nothing() {
    use std::process::Command;

    let mut child = Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("failed to spawn sleep");
    let pid = child.id();
    assert!(common::is_process_alive(pid));

    let usage = system_info::core_usage_by_process_id(&[pid], Duration::from_millis(500));

    child.kill().expect("failed to kill sleep");
    child.wait().expect("failed to reap sleep");

    assert!(usage < 0.1, "idle process usage too high: {usage}");
}
