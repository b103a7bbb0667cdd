//! Spawning external commands with piped I/O and a timeout.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Captured result of one external command.
#[derive(Debug)]
pub struct ProcessOutput {
    /// `None` when the command was killed by the timeout.
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn timed_out(&self) -> bool {
        self.status.is_none()
    }

    /// Trimmed stderr, or trimmed stdout when stderr is empty.
    pub fn diagnostics(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Run `cmd` to completion, feeding `stdin` when given. The child is killed
/// if it outlives `timeout`.
pub async fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<String>,
    timeout: Duration,
) -> std::io::Result<ProcessOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    let feed = {
        let pipe = child.stdin.take();
        async move {
            if let (Some(mut pipe), Some(input)) = (pipe, stdin) {
                // The child may exit without reading its input.
                let _ = pipe.write_all(input.as_bytes()).await;
                let _ = pipe.shutdown().await;
            }
        }
    };
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    // Agents may print non-UTF-8 bytes; decode lossily rather than drop the stream.
    let collect = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let read_out = async {
            if let Some(pipe) = stdout.as_mut() {
                let _ = pipe.read_to_end(&mut out).await;
            }
        };
        let read_err = async {
            if let Some(pipe) = stderr.as_mut() {
                let _ = pipe.read_to_end(&mut err).await;
            }
        };
        tokio::join!(feed, read_out, read_err);
        (
            String::from_utf8_lossy(&out).into_owned(),
            String::from_utf8_lossy(&err).into_owned(),
        )
    };

    let run = async {
        let (stdout, stderr) = collect.await;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, stdout, stderr))
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(result) => {
            let (status, stdout, stderr) = result?;
            Ok(ProcessOutput {
                status: Some(status),
                stdout,
                stderr,
            })
        }
        Err(_) => Ok(ProcessOutput {
            status: None,
            stdout: String::new(),
            stderr: format!("timed out after {}s", timeout.as_secs()),
        }),
    }
}
