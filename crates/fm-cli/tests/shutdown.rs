//! Integration tests for graceful shutdown of `fm serve`.
//! Verifies that closing stdin (EOF) and sending signals cause clean exit.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn fm_binary() -> std::path::PathBuf {
    assert_cmd::cargo::cargo_bin!("fm").into()
}

fn spawn_serve(data_dir: &TempDir) -> (Child, BufReader<ChildStdout>) {
    let mut child = Command::new(fm_binary())
        .args(["serve", "--store", "test-shutdown", "--interval-ms", "50"])
        .env("FM_DATA_DIR", data_dir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn fm serve");
    let stdout = BufReader::new(child.stdout.take().expect("stdout pipe"));
    (child, stdout)
}

/// Block until the server announces itself.
fn wait_ready(stdout: &mut BufReader<ChildStdout>) {
    let mut line = String::new();
    stdout.read_line(&mut line).expect("read ready line");
    assert!(line.starts_with("serving store"), "unexpected banner: {line:?}");
}

fn wait_with_deadline(mut child: Child) -> std::process::ExitStatus {
    let start = Instant::now();
    let status = child.wait().expect("wait");
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    status
}

#[test]
fn serve_exits_on_stdin_eof() {
    let dir = TempDir::new().unwrap();
    let (mut child, mut stdout) = spawn_serve(&dir);
    wait_ready(&mut stdout);

    drop(child.stdin.take());

    let status = wait_with_deadline(child);
    assert!(status.success(), "fm serve should exit 0 on stdin EOF, got {status}");
}

#[test]
fn serve_ingests_lines_and_checkpoints() {
    let dir = TempDir::new().unwrap();
    let (mut child, mut stdout) = spawn_serve(&dir);
    wait_ready(&mut stdout);

    let stdin = child.stdin.as_mut().expect("stdin pipe");
    writeln!(
        stdin,
        "Glaciers carve U-shaped valleys as they grind slowly downhill over centuries."
    )
    .unwrap();
    stdin.flush().unwrap();

    let mut id = String::new();
    stdout.read_line(&mut id).expect("read fragment id");
    assert_eq!(id.trim().len(), 36, "expected a UUID, got {id:?}");

    drop(child.stdin.take());
    assert!(wait_with_deadline(child).success());

    // The fragment survives into the next process
    let output = Command::new(fm_binary())
        .args(["stats", "--store", "test-shutdown"])
        .env("FM_DATA_DIR", dir.path())
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&output.stdout).contains("fragments:  1"));
}

#[test]
fn serve_answers_queries() {
    let dir = TempDir::new().unwrap();
    let (mut child, mut stdout) = spawn_serve(&dir);
    wait_ready(&mut stdout);

    let stdin = child.stdin.as_mut().expect("stdin pipe");
    writeln!(stdin, "Tides rise and fall twice a day under the pull of the moon.").unwrap();
    writeln!(stdin, "? moon tides").unwrap();
    stdin.flush().unwrap();

    let mut id = String::new();
    stdout.read_line(&mut id).unwrap();
    let mut hit = String::new();
    stdout.read_line(&mut hit).unwrap();
    assert!(hit.starts_with(id.trim()), "query should return {id:?}, got {hit:?}");
    let mut end = String::new();
    stdout.read_line(&mut end).unwrap();
    assert_eq!(end.trim(), ".");

    drop(child.stdin.take());
    assert!(wait_with_deadline(child).success());

    let output = Command::new(fm_binary())
        .args(["stats", "--store", "test-shutdown"])
        .env("FM_DATA_DIR", dir.path())
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&output.stdout).contains("events:     1"));
}

#[cfg(unix)]
#[test]
fn serve_exits_on_sigterm() {
    let dir = TempDir::new().unwrap();
    let (child, mut stdout) = spawn_serve(&dir);
    wait_ready(&mut stdout);

    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .expect("run kill");
    assert!(status.success());

    let status = wait_with_deadline(child);
    assert!(status.success(), "SIGTERM should shut down cleanly, got {status}");
}

#[test]
fn wal_checkpoint_on_exit() {
    let dir = TempDir::new().unwrap();
    let (mut child, mut stdout) = spawn_serve(&dir);
    wait_ready(&mut stdout);

    let stdin = child.stdin.as_mut().expect("stdin pipe");
    writeln!(
        stdin,
        "WAL checkpoint test content. Multiple sentences for the analyzer. And one more."
    )
    .unwrap();
    stdin.flush().unwrap();
    let mut id = String::new();
    stdout.read_line(&mut id).unwrap();

    drop(child.stdin.take());
    child.wait().expect("wait");

    // TRUNCATE checkpoint leaves the WAL empty or absent
    let wal_path = dir.path().join("stores/test-shutdown.db-wal");
    if wal_path.exists() {
        let wal_size = std::fs::metadata(&wal_path).unwrap().len();
        assert_eq!(
            wal_size, 0,
            "WAL should be empty after TRUNCATE checkpoint, was {wal_size} bytes"
        );
    }
}
