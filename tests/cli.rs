//! End-to-end runs of the `ubigen` binary.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

const PEB_SIZE: usize = 128 * 1024;

fn ubigen() -> Command {
    Command::new(env!("CARGO_BIN_EXE_ubigen"))
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn write_input(dir: &Path, len: usize) -> anyhow::Result<std::path::PathBuf> {
    let path = dir.join("input.bin");
    let data: Vec<u8> = (0..len).map(|x| (x % 251) as u8).collect();
    fs::write(&path, data)?;
    Ok(path)
}

#[test]
fn dynamic_volume_to_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_input(dir.path(), 100)?;
    let image = dir.path().join("image.ubi");

    let output = ubigen()
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&image)
        .args(["-b", "128KiB", "-m", "2KiB", "-I", "0", "-t", "dynamic"])
        .output()?;
    assert!(output.status.success(), "{}", stderr(&output));

    let len = fs::metadata(&image)?.len() as usize;
    assert!(len > 0);
    assert_eq!(len % PEB_SIZE, 0);

    // EC header magic at the start, VID header magic in the second page
    let bytes = fs::read(&image)?;
    assert_eq!(&bytes[..4], b"UBI#");
    assert_eq!(&bytes[2048..2052], b"UBI!");
    Ok(())
}

#[test]
fn missing_volume_id() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_input(dir.path(), 100)?;

    let output = ubigen()
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(dir.path().join("image.ubi"))
        .args(["-b", "128KiB", "-m", "2KiB"])
        .output()?;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("volume ID"), "{}", stderr(&output));
    Ok(())
}

#[test]
fn zero_peb_size() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_input(dir.path(), 100)?;

    let output = ubigen()
        .arg("-i")
        .arg(&input)
        .args(["-b", "0", "-m", "2KiB", "-I", "0"])
        .output()?;
    assert!(!output.status.success());
    let message = stderr(&output);
    assert!(message.contains("physical eraseblock size"), "{message}");
    assert!(message.contains("peb-size"), "{message}");
    assert!(output.stdout.is_empty());
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn static_volume_from_pipe() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let image = dir.path().join("image.ubi");

    let mut child = ubigen()
        .args(["-i", "/dev/stdin", "-o"])
        .arg(&image)
        .args(["-b", "128KiB", "-m", "2KiB", "-I", "1", "-t", "static"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(&[0x5A; 5000])?;
    drop(stdin);

    let output = child.wait_with_output()?;
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stderr(&output).contains("unknown"), "{}", stderr(&output));
    assert_eq!(fs::metadata(&image)?.len() as usize, PEB_SIZE);
    Ok(())
}

#[test]
fn image_to_stdout() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_input(dir.path(), 300_000)?;

    let output = ubigen()
        .arg("--infile")
        .arg(&input)
        .args([
            "--peb-size",
            "0x20000",
            "--min-io-size",
            "2048",
            "--vol-id",
            "4",
            "--type",
            "static",
            "--erase-counter",
            "9",
        ])
        .output()?;
    assert!(output.status.success(), "{}", stderr(&output));

    // 300000 bytes over 126976-byte LEBs
    assert_eq!(output.stdout.len(), 3 * PEB_SIZE);
    Ok(())
}

#[test]
fn unreadable_input_leaves_no_output() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let image = dir.path().join("image.ubi");

    let output = ubigen()
        .arg("-i")
        .arg(dir.path().join("nope.bin"))
        .arg("-o")
        .arg(&image)
        .args(["-b", "128KiB", "-m", "2KiB", "-I", "0"])
        .output()?;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("cannot open file"));
    assert!(!image.exists());
    Ok(())
}

#[test]
fn bad_unit() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_input(dir.path(), 10)?;

    let output = ubigen()
        .arg("-i")
        .arg(&input)
        .args(["-b", "128KiB", "-m", "2KB", "-I", "0"])
        .output()?;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("bad size specifier"));
    Ok(())
}

#[test]
fn rejected_layout() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = write_input(dir.path(), 10)?;
    let image = dir.path().join("image.ubi");

    let output = ubigen()
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&image)
        .args(["-b", "128KiB", "-m", "2KiB", "-s", "4KiB", "-I", "0"])
        .output()?;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("cannot create UBI image generator"));
    assert_eq!(fs::metadata(&image)?.len(), 0);
    Ok(())
}

#[test]
fn help_and_version() -> anyhow::Result<()> {
    let output = ubigen().arg("--help").output()?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("--peb-size"));

    let output = ubigen().arg("-V").output()?;
    assert!(output.status.success());
    Ok(())
}
