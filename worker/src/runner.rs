//! External search-program supervision: one subprocess per compute
//! device, live output streaming, and per-device output recombination.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use colored::Colorize;
use shared::{
    types::{Address, KeyRange, ProgramKind},
    utils::dedup_preserving_order,
};
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::*;

use crate::{config::WorkDir, keyspace::split_keyspace};

const DEVICE_LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("program not found")]
    NotFound,
    #[error("failed to start program: {0}")]
    Spawn(String),
}

/// Outcome of one full block attempt across all devices.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub succeeded: bool,
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct GpuDevice {
    pub id: u32,
    pub label: String,
}

/// Query the program's own device list (`<program> -l`). Falls back to
/// a single device 0 when the probe fails or prints nothing usable.
pub async fn detect_devices(program: &Path) -> Vec<GpuDevice> {
    let output = tokio::time::timeout(
        DEVICE_LIST_TIMEOUT,
        Command::new(program).arg("-l").stdin(Stdio::null()).kill_on_drop(true).output(),
    )
    .await;

    let mut devices = vec![];
    if let Ok(Ok(out)) = output {
        let text = String::from_utf8_lossy(&out.stdout);
        let mut seen = HashSet::new();
        for line in text.lines() {
            if let Some((id, name)) = parse_device_line(line) {
                if seen.insert(id) {
                    devices.push(GpuDevice {
                        id,
                        label: format!("GPU#{id} {name}"),
                    });
                }
            }
        }
        devices.sort_by_key(|d| d.id);
    }

    if devices.is_empty() {
        devices.push(GpuDevice {
            id: 0,
            label: "-".to_string(),
        });
    }
    devices
}

/// `GPU #0 NVIDIA RTX 3090 (82x SM)` -> `(0, "NVIDIA RTX 3090")`.
fn parse_device_line(line: &str) -> Option<(u32, String)> {
    let trimmed = line.trim();
    let rest = trimmed.strip_prefix("GPU").or_else(|| trimmed.strip_prefix("gpu"))?;
    let rest = rest.trim_start().trim_start_matches('#');
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let id = digits.parse().ok()?;
    let mut name = rest[digits.len()..].trim().to_string();
    if let Some(paren) = name.find('(') {
        name.truncate(paren);
        name = name.trim().to_string();
    }
    Some((id, name))
}

/// Write the address input file consumed by the search program:
/// assignment addresses first, then the configured targets, deduped
/// preserving order.
pub async fn write_input_file(
    files: &WorkDir,
    addresses: &[Address],
    targets: &[Address],
) -> anyhow::Result<usize> {
    let mut all: Vec<Address> = addresses.to_vec();
    all.extend(targets.iter().filter(|a| !a.as_str().trim().is_empty()).cloned());
    let all = dedup_preserving_order(&all);
    let body = all.iter().map(Address::as_str).collect::<Vec<_>>().join("\n") + "\n";
    fs::write(files.in_file(), body).await?;
    info!("addresses saved to {:?}, total: {}", files.in_file(), all.len());
    Ok(all.len())
}

pub async fn clean_io_files(files: &WorkDir) {
    let _ = fs::write(files.in_file(), "").await;
    let _ = fs::write(files.out_file(), "").await;
    clean_device_out_files(files).await;
}

pub async fn clean_out_file(files: &WorkDir) {
    let _ = fs::write(files.out_file(), "").await;
}

pub async fn clean_device_out_files(files: &WorkDir) {
    for path in files.device_out_files() {
        if fs::remove_file(&path).await.is_err() {
            let _ = fs::write(&path, "").await;
        }
    }
}

/// Concatenate per-device output files into `out.txt`, device order.
/// Missing files contribute nothing.
pub async fn combine_device_outputs(files: &WorkDir, count: usize) -> anyhow::Result<()> {
    let mut combined = String::new();
    for idx in 0..count {
        match fs::read_to_string(files.device_out_file(idx)).await {
            Ok(content) => combined.push_str(&content),
            Err(_) => continue,
        }
    }
    fs::write(files.out_file(), combined).await?;
    Ok(())
}

pub struct DeviceRunner {
    program: PathBuf,
    args: Vec<String>,
    kind: ProgramKind,
    files: WorkDir,
}

impl DeviceRunner {
    pub fn new(program: PathBuf, args: Vec<String>, kind: ProgramKind, files: WorkDir) -> DeviceRunner {
        DeviceRunner {
            program,
            args,
            kind,
            files,
        }
    }

    /// Run the block across the given devices and block until every
    /// launched process has exited. Success means every device exited
    /// with code 0. A spawn failure aborts the whole run; any already
    /// started peers get a best-effort kill.
    pub async fn run(&self, range: &KeyRange, devices: &[GpuDevice]) -> Result<RunResult, RunError> {
        clean_out_file(&self.files).await;
        clean_device_out_files(&self.files).await;
        info!("running with keyspace: {}", range.keyspace().green());

        if devices.len() > 1 {
            self.run_multi(range, devices).await
        } else {
            let id = devices.first().map(|d| d.id).unwrap_or(0);
            self.run_single(range, id).await
        }
    }

    async fn run_multi(&self, range: &KeyRange, devices: &[GpuDevice]) -> Result<RunResult, RunError> {
        let segments = split_keyspace(range, devices.len());
        let mut children: Vec<tokio::process::Child> = vec![];
        let mut streams = vec![];

        for (idx, device) in devices.iter().enumerate() {
            let segment = &segments[idx];
            let mut args = strip_device_flag(&self.args);
            args.extend([
                "-i".to_string(),
                path_str(&self.files.in_file()),
                "-o".to_string(),
                path_str(&self.files.device_out_file(idx)),
                "--keyspace".to_string(),
                segment.keyspace(),
            ]);
            if self.kind.needs_device_flag() {
                args.extend(["-gpuId".to_string(), device.id.to_string()]);
            }

            let spawned = Command::new(&self.program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn();

            let mut child = match spawned {
                Ok(child) => child,
                Err(err) => {
                    // abort the whole run, do not leave peers running
                    for peer in children.iter_mut() {
                        let _ = peer.start_kill();
                    }
                    if err.kind() == std::io::ErrorKind::NotFound {
                        return Err(RunError::NotFound);
                    }
                    return Err(RunError::Spawn(format!("device {}: {err}", device.id)));
                }
            };

            println!("{}", format!("[GPU {}] started {}", device.id, segment.keyspace()).cyan());
            if let Some(stdout) = child.stdout.take() {
                streams.push(tokio::spawn(stream_device_output(stdout, device.id)));
            }
            children.push(child);
        }

        let mut all_ok = true;
        let mut first_fail = 0;
        for child in &mut children {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            if code != 0 {
                if all_ok {
                    first_fail = code;
                }
                all_ok = false;
            }
        }
        for stream in streams {
            let _ = stream.await;
        }

        if let Err(err) = combine_device_outputs(&self.files, devices.len()).await {
            warn!("failed to combine device outputs: {err:#}");
        }
        if all_ok {
            info!("external program finished successfully");
            clean_device_out_files(&self.files).await;
        }
        Ok(RunResult {
            succeeded: all_ok,
            exit_code: if all_ok { 0 } else { first_fail },
        })
    }

    async fn run_single(&self, range: &KeyRange, device_id: u32) -> Result<RunResult, RunError> {
        let mut args = self.args.clone();
        if self.kind.needs_device_flag() && !has_device_flag(&args) {
            args.extend(["-gpuId".to_string(), device_id.to_string()]);
        }
        args.extend([
            "-i".to_string(),
            path_str(&self.files.in_file()),
            "-o".to_string(),
            path_str(&self.files.out_file()),
            "--keyspace".to_string(),
            range.keyspace(),
        ]);

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if std::env::var_os("CUDA_VISIBLE_DEVICES").is_none() {
            command.env("CUDA_VISIBLE_DEVICES", device_id.to_string());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(RunError::NotFound),
            Err(err) => return Err(RunError::Spawn(format!("{err}"))),
        };

        let stream = child.stdout.take().map(|out| tokio::spawn(stream_device_output(out, device_id)));
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => return Err(RunError::Spawn(format!("{err}"))),
        };
        if let Some(stream) = stream {
            let _ = stream.await;
        }

        if code == 0 {
            info!("external program finished successfully");
            clean_device_out_files(&self.files).await;
        }
        Ok(RunResult {
            succeeded: code == 0,
            exit_code: code,
        })
    }
}

/// Mirror each stdout line for operator visibility. Never parsed live.
async fn stream_device_output(stdout: tokio::process::ChildStdout, device_id: u32) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let text = line.trim();
        if !text.is_empty() {
            println!("{}", format!("[GPU {device_id}] {text}").cyan());
        }
    }
}

/// Drop any user-supplied `-gpuId <n>` pair; the runner assigns devices
/// itself in multi-device mode.
fn strip_device_flag(args: &[String]) -> Vec<String> {
    let mut out = vec![];
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "-gpuId" && iter.peek().is_some() {
            iter.next();
            continue;
        }
        out.push(arg.clone());
    }
    out
}

fn has_device_flag(args: &[String]) -> bool {
    args.iter().any(|a| a == "-gpuId")
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use num_bigint::BigUint;
    use tempfile::tempdir;

    use super::*;

    fn range(start: u64, end: u64) -> KeyRange {
        KeyRange {
            start: BigUint::from(start),
            end: BigUint::from(end),
        }
    }

    fn devices(n: u32) -> Vec<GpuDevice> {
        (0..n)
            .map(|id| GpuDevice {
                id,
                label: format!("GPU#{id}"),
            })
            .collect()
    }

    /// Shell stand-in for the search program: writes a marker line to
    /// whatever `-o` names, then exits with the requested code.
    fn fake_program(dir: &Path, marker: &str, exit_code: i32) -> PathBuf {
        let path = dir.join(format!("prog_{marker}.sh"));
        let script = format!(
            "#!/bin/sh\nout=\"\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n  shift\ndone\nif [ -n \"$out\" ]; then echo \"{marker} $$\" > \"$out\"; fi\nexit {exit_code}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn device_line_parsing() {
        assert_eq!(
            parse_device_line("GPU #0 NVIDIA RTX 3090 (82x SM)"),
            Some((0, "NVIDIA RTX 3090".to_string()))
        );
        assert_eq!(parse_device_line("  GPU 1 Radeon VII"), Some((1, "Radeon VII".to_string())));
        assert_eq!(parse_device_line("Total GPUs: 2"), None);
        assert_eq!(parse_device_line("random text"), None);
    }

    #[test]
    fn strip_and_detect_device_flag() {
        let args: Vec<String> =
            ["-t", "256", "-gpuId", "1", "-r"].iter().map(|s| s.to_string()).collect();
        assert_eq!(strip_device_flag(&args), vec!["-t", "256", "-r"]);
        assert!(has_device_flag(&args));
        assert!(!has_device_flag(&strip_device_flag(&args)));
    }

    #[tokio::test]
    async fn combiner_keeps_device_order_and_skips_missing() {
        let dir = tempdir().unwrap();
        let files = WorkDir::new(dir.path().to_path_buf());
        std::fs::write(files.device_out_file(0), "first\n").unwrap();
        // device 1 file intentionally missing
        std::fs::write(files.device_out_file(2), "third\n").unwrap();
        combine_device_outputs(&files, 3).await.unwrap();
        let combined = std::fs::read_to_string(files.out_file()).unwrap();
        assert_eq!(combined, "first\nthird\n");
    }

    #[tokio::test]
    async fn input_file_dedups_preserving_order() {
        let dir = tempdir().unwrap();
        let files = WorkDir::new(dir.path().to_path_buf());
        let block = vec![Address("1A".into()), Address("1B".into())];
        let targets = vec![Address("1B".into()), Address("1C".into()), Address(" ".into())];
        let count = write_input_file(&files, &block, &targets).await.unwrap();
        assert_eq!(count, 3);
        let body = std::fs::read_to_string(files.in_file()).unwrap();
        assert_eq!(body, "1A\n1B\n1C\n");
    }

    #[tokio::test]
    async fn multi_device_run_combines_in_order() {
        let dir = tempdir().unwrap();
        let files = WorkDir::new(dir.path().to_path_buf());
        let program = fake_program(dir.path(), "hit", 0);
        let runner =
            DeviceRunner::new(program, vec![], ProgramKind::BitCrack, files.clone());
        let result = runner.run(&range(0, 1000), &devices(2)).await.unwrap();
        assert!(result.succeeded);
        assert_eq!(result.exit_code, 0);
        let combined = std::fs::read_to_string(files.out_file()).unwrap();
        assert_eq!(combined.lines().count(), 2);
        // per-device files are cleaned up after a successful run
        assert!(files.device_out_files().is_empty());
    }

    #[tokio::test]
    async fn failing_device_fails_the_run() {
        let dir = tempdir().unwrap();
        let files = WorkDir::new(dir.path().to_path_buf());
        let program = fake_program(dir.path(), "boom", 3);
        let runner =
            DeviceRunner::new(program, vec![], ProgramKind::BitCrack, files.clone());
        let result = runner.run(&range(0, 1000), &devices(2)).await.unwrap();
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn missing_program_reports_not_found() {
        let dir = tempdir().unwrap();
        let files = WorkDir::new(dir.path().to_path_buf());
        let runner = DeviceRunner::new(
            dir.path().join("no_such_binary"),
            vec![],
            ProgramKind::Vanity,
            files,
        );
        let err = runner.run(&range(0, 100), &devices(1)).await.unwrap_err();
        assert!(matches!(err, RunError::NotFound));
    }
}
