//! Spawn, steer and tear down ffmpeg/ffprobe child processes.
use anyhow::{bail, Context, Result};
use log::warn;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;

/// Grace period between SIGTERM and SIGKILL when stopping a process early.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A running ffmpeg/ffprobe child process with its stdout exposed line by
/// line, stderr left inherited so operators see it directly.
pub struct ManagedProcess {
    child: Child,
    pid: i32,
}

impl ManagedProcess {
    /// Spawn `binary` with `args`, piping stdout and inheriting stderr.
    pub fn spawn(binary: &str, args: &[String]) -> Result<Self> {
        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {binary}"))?;
        let pid = child
            .id()
            .context("child exited before its pid could be read")? as i32;
        Ok(Self { child, pid })
    }

    /// Stdout as an async stream of lines (one ffmpeg segment filename per
    /// line, per the `-segment_list pipe:1` protocol).
    pub fn lines(&mut self) -> Lines<BufReader<ChildStdout>> {
        let out = self.child.stdout.take().expect("stdout already taken");
        BufReader::new(out).lines()
    }

    /// Send SIGTERM, then SIGKILL after [`KILL_GRACE`] if the process is
    /// still alive.
    pub async fn kill(&mut self) -> Result<()> {
        unsafe {
            libc::kill(self.pid, libc::SIGTERM);
        }
        if timeout(KILL_GRACE, self.child.wait()).await.is_err() {
            warn!("pid {} ignored SIGTERM, sending SIGKILL", self.pid);
            self.child.kill().await.ok();
        }
        Ok(())
    }

    /// Await the process exit code, force-killing it if `deadline` elapses
    /// first. Returns the exit code, or `255` for a process killed by the
    /// deadline (matches the encoder-exit convention in the backend).
    pub async fn wait_timeout(&mut self, deadline: Duration) -> Result<i32> {
        match timeout(deadline, self.child.wait()).await {
            Ok(status) => Ok(status?.code().unwrap_or(-1)),
            Err(_) => {
                warn!("pid {} exceeded its deadline, killing", self.pid);
                self.kill().await?;
                Ok(255)
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }
}

/// Run a short-lived process to completion and collect its stdout lines,
/// used for ffprobe invocations (§6.2). Fails if the deadline elapses or the
/// process exits non-zero.
pub async fn run_collecting_lines(
    binary: &str,
    args: &[String],
    deadline: Duration,
) -> Result<Vec<String>> {
    let mut proc = ManagedProcess::spawn(binary, args)?;
    let mut lines = proc.lines();
    let mut out = Vec::new();
    while let Some(line) = lines.next_line().await? {
        out.push(line);
    }
    let code = proc.wait_timeout(deadline).await?;
    if code != 0 {
        bail!("{binary} exited with code {code}");
    }
    Ok(out)
}
