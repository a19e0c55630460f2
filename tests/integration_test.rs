//! End-to-end smoke tests against the `nxtrtd` binary, covering a couple of
//! the scenarios a supervisor run has to get right: a foreground single-role
//! start that shuts down cleanly on SIGTERM, and a startup flag that must
//! fail before any process state is touched.

use std::process::{Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

fn nxtrtd_bin() -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_BIN_EXE_nxtrtd"))
}

#[tokio::test]
async fn single_role_start_exits_cleanly_on_sigterm() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = tempfile::tempdir()?;
    let pid_path = dir.path().join("nxtrtd.pid");
    let log_path = dir.path().join("nxtrtd.log");

    let mut child = Command::new(nxtrtd_bin())
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--no-daemonize")
        .arg("--pid")
        .arg(&pid_path)
        .arg("--log")
        .arg(&log_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        child.try_wait()?.is_none(),
        "nxtrtd exited before receiving a signal"
    );
    assert!(pid_path.exists(), "pid file was not created on start");

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM)?;

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok::<_, anyhow::Error>(status);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await??;

    assert!(status.success(), "nxtrtd did not exit cleanly: {status:?}");
    assert!(!pid_path.exists(), "pid file was not removed on shutdown");

    Ok(())
}

#[tokio::test]
async fn zero_workers_fails_start_before_touching_any_state() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pid_path = dir.path().join("nxtrtd.pid");

    let output = Command::new(nxtrtd_bin())
        .arg("--workers")
        .arg("0")
        .arg("--no-daemonize")
        .arg("--pid")
        .arg(&pid_path)
        .output()?;

    assert!(!output.status.success(), "zero workers should fail start");
    assert!(!pid_path.exists(), "pid file must not be created on a failed start");

    Ok(())
}
