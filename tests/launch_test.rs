// End-to-end tests for the launcher binary
//
// Each test writes a settings file whose trainer is `sh -c <script>`, so the
// full path (spawn, rendezvous, worker, trainer, teardown) runs without
// accelerators. Only the concurrent-launch test needs python3 and it is
// skipped when none is installed.

#![cfg(unix)]

use anyhow::{bail, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const LAUNCHER: &str = env!("CARGO_BIN_EXE_lisa-launch");

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(trainer_script: &str) -> Result<Self> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("dataset/reason_seg"))?;
        fs::write(dir.path().join("dataset/reason_seg/sample.json"), "{}")?;
        write_settings(
            &dir.path().join("config.toml"),
            &dir.path().join("runs"),
            2,
            trainer_script,
        )?;
        Ok(Self { dir })
    }

    fn runs(&self) -> PathBuf {
        self.dir.path().join("runs")
    }

    fn dataset(&self) -> PathBuf {
        self.dir.path().join("dataset")
    }

    fn launch(&self, port: &str, dataset: &Path, extra: &[&str]) -> Result<Output> {
        self.launch_with_batch(port, "1", dataset, extra)
    }

    fn launch_with_batch(
        &self,
        port: &str,
        batch_size: &str,
        dataset: &Path,
        extra: &[&str],
    ) -> Result<Output> {
        Ok(self.command(port, batch_size, dataset, extra).output()?)
    }

    fn command(&self, port: &str, batch_size: &str, dataset: &Path, extra: &[&str]) -> Command {
        let mut cmd = Command::new(LAUNCHER);
        cmd.arg(format!("--master_port={}", port))
            .arg("--version=org/model-v1")
            .arg(format!("--dataset_dir={}", dataset.display()))
            .arg("--precision=bf16")
            .arg(format!("--batch_size={}", batch_size))
            .arg("--exp_name=run-a")
            .arg(format!("--config={}", self.dir.path().join("config.toml").display()))
            .args(extra)
            .env_remove("LISA_LAUNCH_WORKER")
            .env_remove("RUST_LOG");
        cmd
    }

    /// Start the launcher without waiting for it
    fn spawn(&self, port: u16) -> Result<std::process::Child> {
        let child = self
            .command(&port.to_string(), "1", &self.dataset(), &[])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(child)
    }

    fn manifest(&self) -> Result<serde_json::Value> {
        let raw = fs::read_to_string(self.runs().join("run-a/launch.json"))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Launcher settings whose trainer is `sh -c <trainer_script>`
fn write_settings(path: &Path, runs: &Path, nproc: i64, trainer_script: &str) -> Result<()> {
    let mut settings = toml::Table::new();
    settings.insert("nproc_per_node".into(), toml::Value::Integer(nproc));
    settings.insert("rendezvous_timeout_secs".into(), toml::Value::Integer(30));
    settings.insert("shutdown_grace_secs".into(), toml::Value::Integer(2));
    settings.insert("runs_dir".into(), runs.display().to_string().into());
    settings.insert("verify_checkpoint".into(), false.into());
    settings.insert("trainer_program".into(), "sh".into());
    settings.insert(
        "trainer_args".into(),
        toml::Value::Array(vec!["-c".into(), trainer_script.into(), "trainer".into()]),
    );
    fs::write(path, toml::to_string(&settings)?)?;
    Ok(())
}

fn wait_for(what: &str, timeout: Duration, ready: impl Fn() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !ready() {
        if Instant::now() >= deadline {
            bail!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(100));
    }
    Ok(())
}

fn python3_available() -> bool {
    Command::new("python3")
        .args(["-c", "pass"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn test_example_launch_succeeds() -> Result<()> {
    let fixture = Fixture::new("exit 0")?;
    let port = free_port()?;

    let output = fixture.launch(&port.to_string(), &fixture.dataset(), &[])?;
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let manifest = fixture.manifest()?;
    assert_eq!(manifest["outcome"], "succeeded");
    assert_eq!(manifest["world_size"], 2);
    assert_eq!(manifest["master_port"], port);
    assert_eq!(manifest["exits"].as_array().map(Vec::len), Some(2));

    let logs = fixture.runs().join("run-a/logs");
    assert!(logs.join("rank-0.log").is_file());
    assert!(logs.join("rank-1.log").is_file());
    Ok(())
}

#[test]
fn test_trainer_receives_forwarded_flags() -> Result<()> {
    let seen = TempDir::new()?;
    // Each rank records its distributed environment and arguments
    let script = format!(
        r#"echo "$RANK $WORLD_SIZE $MASTER_PORT $*" > {}/rank$RANK"#,
        seen.path().display()
    );
    let fixture = Fixture::new(&script)?;
    let port = free_port()?;

    let output = fixture.launch(
        &port.to_string(),
        &fixture.dataset(),
        &["--lora_r=16", "--load_in_8bit", "--", "--epochs", "10"],
    )?;
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    for rank in 0..2 {
        let line = fs::read_to_string(seen.path().join(format!("rank{}", rank)))?;
        assert!(line.starts_with(&format!("{} 2 {} ", rank, port)), "{}", line);
        assert!(line.contains("--version org/model-v1"));
        assert!(line.contains("--precision bf16 --batch_size 1 --exp_name run-a"));
        assert!(line.contains(&format!("--local_rank {}", rank)));
        assert!(line.contains("--lora_r 16"));
        assert!(line.trim_end().ends_with("--load_in_8bit --epochs 10"));
    }
    Ok(())
}

#[test]
fn test_missing_dataset_fails_job() -> Result<()> {
    let fixture = Fixture::new("exit 0")?;
    let port = free_port()?;
    let missing = fixture.dir.path().join("no-such-dataset");

    let output = fixture.launch(&port.to_string(), &missing, &[])?;
    assert_ne!(output.status.code(), Some(0));

    let manifest = fixture.manifest()?;
    assert_eq!(manifest["outcome"], "failed");
    let log = fs::read_to_string(fixture.runs().join("run-a/logs/rank-0.log"))?;
    assert!(log.contains("no-such-dataset"));
    Ok(())
}

#[test]
fn test_invalid_batch_size_spawns_nothing() -> Result<()> {
    let fixture = Fixture::new("exit 0")?;
    let port = free_port()?.to_string();

    for batch in ["0", "-3"] {
        let output = fixture.launch_with_batch(&port, batch, &fixture.dataset(), &[])?;
        assert_eq!(output.status.code(), Some(2), "batch {}", batch);
        assert!(stderr(&output).contains("batch size"));
    }
    assert!(!fixture.runs().exists());
    Ok(())
}

#[test]
fn test_invalid_port_rejected() -> Result<()> {
    let fixture = Fixture::new("exit 0")?;

    for port in ["0", "70000", "-1"] {
        let output = fixture.launch(port, &fixture.dataset(), &[])?;
        assert_eq!(output.status.code(), Some(2), "port {}", port);
    }
    assert!(!fixture.runs().exists());
    Ok(())
}

#[test]
fn test_unknown_precision_rejected() -> Result<()> {
    let fixture = Fixture::new("exit 0")?;
    let output = Command::new(LAUNCHER)
        .args([
            "--master_port=24999",
            "--version=org/model-v1",
            "--dataset_dir=./dataset",
            "--precision=int3",
            "--batch_size=1",
            "--exp_name=run-a",
        ])
        .env_remove("LISA_LAUNCH_WORKER")
        .output()?;

    assert_eq!(output.status.code(), Some(2));
    assert!(!fixture.runs().exists());
    Ok(())
}

#[test]
fn test_port_held_by_another_process() -> Result<()> {
    let fixture = Fixture::new("exit 0")?;
    let holder = TcpListener::bind("127.0.0.1:0")?;
    let port = holder.local_addr()?.port();

    let output = fixture.launch(&port.to_string(), &fixture.dataset(), &[])?;
    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("already in use"));
    assert!(!fixture.runs().join("run-a").exists());
    Ok(())
}

#[test]
fn test_port_reusable_after_job() -> Result<()> {
    let fixture = Fixture::new("exit 0")?;
    let port = free_port()?.to_string();

    let first = fixture.launch(&port, &fixture.dataset(), &[])?;
    assert_eq!(first.status.code(), Some(0), "stderr: {}", stderr(&first));
    let second = fixture.launch(&port, &fixture.dataset(), &[])?;
    assert_eq!(second.status.code(), Some(0), "stderr: {}", stderr(&second));
    Ok(())
}

#[test]
fn test_trainer_failure_code_propagates() -> Result<()> {
    let fixture = Fixture::new("exit 7")?;
    let port = free_port()?;

    let output = fixture.launch(&port.to_string(), &fixture.dataset(), &[])?;
    assert_eq!(output.status.code(), Some(7), "stderr: {}", stderr(&output));
    assert_eq!(fixture.manifest()?["outcome"], "failed");
    Ok(())
}

#[test]
fn test_failed_rank_tears_down_peers() -> Result<()> {
    // Rank 1 fails at once, rank 0 would otherwise run for a minute
    let fixture = Fixture::new(r#"[ "$RANK" = 1 ] && exit 5; sleep 60"#)?;
    let port = free_port()?;

    let started = std::time::Instant::now();
    let output = fixture.launch(&port.to_string(), &fixture.dataset(), &[])?;
    assert_eq!(output.status.code(), Some(5), "stderr: {}", stderr(&output));
    assert!(started.elapsed() < std::time::Duration::from_secs(30));
    Ok(())
}

#[test]
fn test_dry_run_prints_plan() -> Result<()> {
    let fixture = Fixture::new("exit 0")?;
    let port = free_port()?;

    let output = fixture.launch(&port.to_string(), &fixture.dataset(), &["--dry_run"])?;
    assert_eq!(output.status.code(), Some(0));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("World size:    2"));
    assert!(stdout.contains("[rank 1]"));
    assert!(stdout.contains("--version org/model-v1"));
    assert!(!fixture.runs().exists());
    Ok(())
}

#[test]
fn test_trainer_binds_master_port() -> Result<()> {
    // Rank 0's trainer is itself a launcher on MASTER_PORT, so it only
    // succeeds when the outer launcher has let go of the port
    let inner = TempDir::new()?;
    let inner_config = inner.path().join("config.toml");
    write_settings(&inner_config, &inner.path().join("runs"), 1, "exit 0")?;

    let script = format!(
        r#"[ "$RANK" = 0 ] || exit 0
LISA_LAUNCH_WORKER=0 {launcher} --master_port="$MASTER_PORT" --version=org/model-v1 \
    --dataset_dir={dataset} --precision=bf16 --batch_size=1 --exp_name=inner \
    --config={config}"#,
        launcher = LAUNCHER,
        dataset = inner.path().display(),
        config = inner_config.display(),
    );
    let fixture = Fixture::new(&script)?;
    let port = free_port()?;

    let output = fixture.launch(&port.to_string(), &fixture.dataset(), &[])?;
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let log = fs::read_to_string(fixture.runs().join("run-a/logs/rank-0.log"))?;
    assert!(!log.contains("already in use"), "{}", log);
    assert!(inner.path().join("runs/inner/launch.json").is_file());
    Ok(())
}

fn interrupt_running_job(signal: Signal) -> Result<()> {
    let seen = TempDir::new()?;
    let script = format!(
        "touch {dir}/started$RANK; sleep 5; touch {dir}/survived$RANK",
        dir = seen.path().display()
    );
    let fixture = Fixture::new(&script)?;
    let port = free_port()?;

    let mut launcher = fixture.spawn(port)?;
    wait_for("every trainer to start", Duration::from_secs(30), || {
        (0..2).all(|rank| seen.path().join(format!("started{}", rank)).exists())
    })?;

    kill(Pid::from_raw(launcher.id() as i32), signal)?;
    let status = launcher.wait()?;
    assert_eq!(status.code(), Some(130), "{:?}", signal);

    let manifest = fixture.manifest()?;
    assert_eq!(manifest["outcome"], "interrupted");
    assert_eq!(manifest["exits"].as_array().map(Vec::len), Some(2));

    // Trainers were killed with their workers, not left to finish
    sleep(Duration::from_secs(6));
    for rank in 0..2 {
        assert!(!seen.path().join(format!("survived{}", rank)).exists());
    }
    Ok(())
}

#[test]
fn test_sigint_stops_job_with_130() -> Result<()> {
    interrupt_running_job(Signal::SIGINT)
}

#[test]
fn test_sigterm_stops_job_with_130() -> Result<()> {
    interrupt_running_job(Signal::SIGTERM)
}

#[test]
fn test_concurrent_launches_on_one_port() -> Result<()> {
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return Ok(());
    }

    // Rank 0 holds MASTER_PORT the way a distributed trainer does
    let seen = TempDir::new()?;
    let marker = seen.path().join("bound");
    let script = format!(
        r#"[ "$RANK" = 0 ] || exit 0
exec python3 -c '
import os, socket, sys, time
s = socket.socket()
s.bind((os.environ["MASTER_ADDR"], int(os.environ["MASTER_PORT"])))
s.listen()
open(sys.argv[1], "w").close()
time.sleep(3)
' {marker}"#,
        marker = marker.display()
    );
    let first = Fixture::new(&script)?;
    let second = Fixture::new("exit 0")?;
    let port = free_port()?;

    let mut running = first.spawn(port)?;
    wait_for("the trainer to bind the port", Duration::from_secs(30), || {
        marker.exists()
    })?;

    let output = second.launch(&port.to_string(), &second.dataset(), &[])?;
    assert_eq!(output.status.code(), Some(3), "stderr: {}", stderr(&output));
    assert!(!second.runs().join("run-a").exists());

    assert_eq!(running.wait()?.code(), Some(0));
    assert_eq!(first.manifest()?["outcome"], "succeeded");
    Ok(())
}
