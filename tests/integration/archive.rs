#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{fs, path::PathBuf, time::Duration};

use common::write_script;
use procsentry::{archive::ArchiveRunner, error::ArchiveError};
use tempfile::tempdir;

const FAKE_ARCHIVER: &str = r#"case "$1" in
  a)
    archive="$2"
    shift 2
    cat "$@" > "$archive"
    ;;
  x)
    archive="$2"
    dest="${3#-o}"
    mkdir -p "$dest"
    cp "$archive" "$dest/extracted.txt"
    ;;
  *)
    echo "unsupported command: $1" >&2
    exit 2
    ;;
esac"#;

fn fake_archiver(dir: &std::path::Path) -> PathBuf {
    write_script(dir, "fake7z", FAKE_ARCHIVER)
}

#[test]
fn create_then_extract_through_archiver() {
    let temp = tempdir().expect("failed to create tempdir");
    let archiver = fake_archiver(temp.path());
    let input_dir = temp.path().join("input files");
    fs::create_dir_all(&input_dir).unwrap();
    fs::write(input_dir.join("a.txt"), "alpha\n").unwrap();
    fs::write(input_dir.join("b.txt"), "beta\n").unwrap();

    let runner = ArchiveRunner::new(&archiver)
        .work_dir(temp.path())
        .timeout(Duration::from_secs(10));
    let archive = temp.path().join("bundle.7z");
    runner
        .create(&archive, &[input_dir.join("a.txt"), input_dir.join("b.txt")])
        .expect("create failed");
    assert_eq!(fs::read_to_string(&archive).unwrap(), "alpha\nbeta\n");

    let destination = temp.path().join("out dir");
    runner.extract(&archive, &destination).expect("extract failed");
    assert_eq!(
        fs::read_to_string(destination.join("extracted.txt")).unwrap(),
        "alpha\nbeta\n"
    );
}

#[test]
fn non_zero_exit_carries_error_output() {
    let temp = tempdir().expect("failed to create tempdir");
    let archiver = write_script(temp.path(), "broken7z", "echo 'cannot open archive' >&2\nexit 2");

    let runner = ArchiveRunner::new(&archiver).work_dir(temp.path());
    match runner.extract(&temp.path().join("missing.7z"), temp.path()) {
        Err(ArchiveError::Failed { code, output }) => {
            assert_eq!(code, 2);
            assert_eq!(output, "cannot open archive");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn slow_archiver_times_out() {
    let temp = tempdir().expect("failed to create tempdir");
    let archiver = write_script(temp.path(), "slow7z", "exec sleep 30");

    let runner = ArchiveRunner::new(&archiver)
        .work_dir(temp.path())
        .timeout(Duration::from_millis(500));
    let started = std::time::Instant::now();
    let result = runner.create(&temp.path().join("never.7z"), &[temp.path().join("x")]);

    assert!(matches!(result, Err(ArchiveError::TimedOut(_))));
    assert!(started.elapsed() < Duration::from_secs(6));
}
