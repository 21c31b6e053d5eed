//! Long-lived shell sessions owned by plugins.
//!
//! `Shell.new()` in a script maps to one [`ShellSession`]: a platform shell
//! (`cmd.exe` on Windows, `$SHELL`/`sh` elsewhere) held open with piped
//! stdio. Each `run` writes the command followed by a per-run sentinel echo
//! on both streams and collects output until the sentinels come back. A
//! timed-out run leaves the subprocess in an unknown state, so the session
//! respawns its process; the id survives.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("shell command timed out")]
    Timeout,

    #[error("shell session I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

struct SessionPipes {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Lines<BufReader<ChildStderr>>,
}

pub struct ShellSession {
    id: u64,
    pipes: SessionPipes,
    runs: u64,
}

impl ShellSession {
    pub async fn spawn() -> std::io::Result<Self> {
        Ok(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            pipes: Self::spawn_process()?,
            runs: 0,
        })
    }

    fn spawn_process() -> std::io::Result<SessionPipes> {
        let mut command = if cfg!(windows) {
            let mut command = Command::new("cmd.exe");
            command.arg("/Q");
            command
        } else {
            Command::new(std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string()))
        };

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let take = |name: &str| std::io::Error::other(format!("shell {name} pipe missing"));
        let stdin = child.stdin.take().ok_or_else(|| take("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| take("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| take("stderr"))?;

        Ok(SessionPipes {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr: BufReader::new(stderr).lines(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run one command and collect `(stdout, stderr)` delimited by this
    /// run's sentinel, within `timeout`.
    pub async fn run(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<(String, String), ShellError> {
        self.runs += 1;
        let sentinel = format!("__scope_done_{}_{}__", self.id, self.runs);

        let script = if cfg!(windows) {
            format!("{command}\r\necho {sentinel}\r\necho {sentinel} 1>&2\r\n")
        } else {
            format!("{command}\nprintf '%s\\n' {sentinel}\nprintf '%s\\n' {sentinel} 1>&2\n")
        };

        let exchange = async {
            self.pipes.stdin.write_all(script.as_bytes()).await?;
            self.pipes.stdin.flush().await?;
            let (stdout, stderr) = tokio::join!(
                collect_until(&mut self.pipes.stdout, &sentinel),
                collect_until(&mut self.pipes.stderr, &sentinel),
            );
            Ok::<_, std::io::Error>((stdout?, stderr?))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(streams)) => Ok(streams),
            Ok(Err(err)) => Err(ShellError::Io(err)),
            Err(_) => {
                // The command is still running and owns the pipes; a fresh
                // process keeps the session usable.
                if let Ok(pipes) = Self::spawn_process() {
                    let _ = self.pipes.child.start_kill();
                    self.pipes = pipes;
                }
                Err(ShellError::Timeout)
            }
        }
    }

    /// Platform probe for a program on PATH (`where` / `command -v`).
    pub async fn exist(program: &str) -> bool {
        let status = if cfg!(windows) {
            Command::new("cmd.exe")
                .args(["/C", "where"])
                .arg(program)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
        } else {
            Command::new("sh")
                .arg("-c")
                .arg(format!("command -v -- {program}"))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
        };

        matches!(status, Ok(status) if status.success())
    }

    pub async fn kill(&mut self) {
        if self.pipes.child.start_kill().is_ok() {
            let _ = self.pipes.child.wait().await;
        }
    }
}

async fn collect_until<T: tokio::io::AsyncBufRead + Unpin>(
    lines: &mut Lines<T>,
    sentinel: &str,
) -> std::io::Result<String> {
    let mut collected = String::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim_end_matches('\r') == sentinel {
            return Ok(collected);
        }
        collected.push_str(line.trim_end_matches('\r'));
        collected.push('\n');
    }
    // Stream closed before the sentinel: the shell died mid-command.
    Err(std::io::Error::other("shell exited before completing command"))
}

/// Per-plugin shell registry; all sessions die with the plugin.
#[derive(Default)]
pub struct ShellRegistry {
    sessions: HashMap<u64, ShellSession>,
}

impl ShellRegistry {
    pub async fn create(&mut self) -> std::io::Result<u64> {
        let session = ShellSession::spawn().await?;
        let id = session.id();
        self.sessions.insert(id, session);
        Ok(id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut ShellSession> {
        self.sessions.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn kill_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.kill().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_collects_stdout_and_stderr_separately() {
        let mut session = ShellSession::spawn().await.unwrap();
        let (stdout, stderr) = session
            .run("echo Hello; echo oops 1>&2", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stdout, "Hello\n");
        assert_eq!(stderr, "oops\n");
        session.kill().await;
    }

    #[tokio::test]
    async fn sequential_runs_share_one_process() {
        let mut session = ShellSession::spawn().await.unwrap();
        session
            .run("STATE=carried", Duration::from_secs(5))
            .await
            .unwrap();
        let (stdout, _) = session
            .run("echo $STATE", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stdout, "carried\n");
        session.kill().await;
    }

    #[tokio::test]
    async fn timeout_reports_and_session_recovers() {
        let mut session = ShellSession::spawn().await.unwrap();
        let err = session
            .run("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Timeout));

        // Respawned process answers cleanly.
        let (stdout, _) = session
            .run("echo back", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stdout, "back\n");
        session.kill().await;
    }

    #[tokio::test]
    async fn exist_probes_the_path() {
        assert!(ShellSession::exist("sh").await);
        assert!(!ShellSession::exist("definitely-not-a-real-program-xyz").await);
    }

    #[tokio::test]
    async fn registry_assigns_increasing_ids_and_kills_all() {
        let mut registry = ShellRegistry::default();
        let first = registry.create().await.unwrap();
        let second = registry.create().await.unwrap();
        assert!(second > first);
        assert_eq!(registry.len(), 2);

        registry.kill_all().await;
        assert!(registry.is_empty());
    }
}
