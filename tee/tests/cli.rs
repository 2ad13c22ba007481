use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::tempdir;

fn run_tee(args: &[&str], destination: &Path, input: &[u8]) -> Result<Output, Box<dyn Error>> {
    let mut child = Command::new(env!("CARGO_BIN_EXE_tee"))
        .args(args)
        .arg(destination)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    {
        let mut stdin = child.stdin.take().ok_or("stdin not captured")?;
        // tee may exit before reading anything when it fails at start-up.
        match stdin.write_all(input) {
            Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e.into()),
            _ => {}
        }
    }
    Ok(child.wait_with_output()?)
}

fn numbered_lines(count: usize) -> Vec<u8> {
    (0..count)
        .map(|i| format!("{:05} the quick brown fox\n", i))
        .collect::<String>()
        .into_bytes()
}

#[test]
fn copies_stdin_to_stdout_and_destination() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let destination = dir.path().join("copy.txt");
    let input = numbered_lines(2_500);

    let output = run_tee(&[], &destination, &input)?;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, input);
    assert_eq!(fs::read(&destination)?, input);
    Ok(())
}

#[test]
fn empty_input_exits_cleanly() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let destination = dir.path().join("empty.txt");

    let output = run_tee(&[], &destination, b"")?;

    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    assert_eq!(fs::read(&destination)?, Vec::<u8>::new());
    Ok(())
}

#[test]
fn existing_destination_is_truncated() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let destination = dir.path().join("old.txt");
    fs::write(&destination, numbered_lines(50))?;

    let output = run_tee(&["--chunk-capacity", "3"], &destination, b"short\n")?;

    assert!(output.status.success());
    assert_eq!(fs::read(&destination)?, b"short\n".to_vec());
    Ok(())
}

#[test]
fn unopenable_destination_fails_before_echoing() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let destination = dir.path().join("missing").join("copy.txt");

    let output = run_tee(&[], &destination, b"never echoed\n")?;

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to open destination"), "stderr: {}", stderr);
    // Reported through the log subscriber and again by the returned error.
    assert!(stderr.contains("ERROR"), "stderr: {}", stderr);
    assert!(stderr.contains("Error: Destination"), "stderr: {}", stderr);
    Ok(())
}

#[test]
fn zero_chunk_capacity_is_rejected() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let destination = dir.path().join("copy.txt");

    let output = run_tee(&["--chunk-capacity", "0"], &destination, b"x\n")?;

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    Ok(())
}

#[test]
fn config_file_sets_the_chunk_capacity() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let config = dir.path().join("tee.toml");
    fs::write(&config, "[queue]\nchunk_capacity = 2\n\n[sink]\nflush_each_record = true\n")?;
    let destination = dir.path().join("copy.txt");
    let input = numbered_lines(11);

    let config = config.to_str().ok_or("non-utf8 temp path")?;
    let output = run_tee(&["-c", config], &destination, &input)?;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, input);
    assert_eq!(fs::read(&destination)?, input);
    Ok(())
}

#[test]
fn missing_destination_argument_is_a_usage_error() -> Result<(), Box<dyn Error>> {
    let output = Command::new(env!("CARGO_BIN_EXE_tee"))
        .stdin(Stdio::null())
        .output()?;
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    Ok(())
}
