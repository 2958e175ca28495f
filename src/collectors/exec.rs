use crate::config::{Config, HostConfig, SshConfig};
use async_trait::async_trait;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("i/o error while waiting for command: {0}")]
    Io(#[from] io::Error),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("command exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

impl ExecError {
    /// Label used for the `kind` dimension of the collect error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::Spawn { .. } => "spawn",
            ExecError::Io(_) => "io",
            ExecError::Timeout(_) => "timeout",
            ExecError::Failed { .. } => "exit",
        }
    }
}

/// Runs the metrics command for a host and hands back its stdout.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, host: &HostConfig) -> Result<String, ExecError>;
}

/// Single-shot deferred action. Dropping (or disarming) cancels it, so it
/// fires at most once and only while the owner is still in scope.
pub struct KillTimer {
    handle: Option<JoinHandle<()>>,
}

impl KillTimer {
    pub fn arm<F>(after: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            time::sleep(after).await;
            on_fire();
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn disarm(self) {
        drop(self);
    }
}

impl Drop for KillTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pid, error = %err, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

pub struct CommandExecutor {
    pub local_address: String,
    pub command: String,
    pub ssh: SshConfig,
    pub exec_timeout: Duration,
    pub kill_grace: Duration,
}

impl CommandExecutor {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            local_address: cfg.local_address.clone(),
            command: cfg.collector.command.clone(),
            ssh: cfg.ssh.clone(),
            exec_timeout: cfg.collector.exec_timeout(),
            kill_grace: cfg.collector.kill_grace(),
        }
    }

    pub fn is_local(&self, host: &HostConfig) -> bool {
        host.address == self.local_address
    }

    pub fn build_command(&self, host: &HostConfig) -> Command {
        if self.is_local(host) {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            return cmd;
        }

        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.ssh.connect_timeout_secs));
        let strict = if self.ssh.strict_host_key_checking {
            "yes"
        } else {
            "no"
        };
        cmd.arg("-o").arg(format!("StrictHostKeyChecking={strict}"));

        let identity = host
            .identity_file
            .as_ref()
            .or(self.ssh.default_identity_file.as_ref());
        if let Some(key) = identity {
            cmd.arg("-i").arg(key);
        }

        let user = host.ssh_user.as_deref().unwrap_or(&self.ssh.default_user);
        cmd.arg(format!("{user}@{}", host.address));
        cmd.arg(&self.command);
        cmd
    }

    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        // A group id stays allocated while any member is alive, even after
        // the leader has been reaped.
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Err(err) = child.start_kill() {
            debug!(error = %err, "start_kill after timeout");
        }
        if time::timeout(self.kill_grace, child.wait()).await.is_err() {
            warn!(?pid, "child not reaped within kill grace");
        }
    }
}

#[async_trait]
impl Runner for CommandExecutor {
    async fn run(&self, host: &HostConfig) -> Result<String, ExecError> {
        let mut cmd = self.build_command(host);
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|source| ExecError::Spawn { program, source })?;
        let pid = child.id();
        let safety_net = KillTimer::arm(self.exec_timeout + self.kill_grace, move || {
            if let Some(pid) = pid {
                warn!(pid, "deferred kill fired");
                kill_process_group(pid);
            }
        });

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let waited = time::timeout(self.exec_timeout, async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (status, _, _) = tokio::try_join!(
                child.wait(),
                drain(stdout_pipe.as_mut(), &mut out),
                drain(stderr_pipe.as_mut(), &mut err)
            )?;
            Ok::<_, io::Error>((status, out, err))
        })
        .await;

        match waited {
            Ok(Ok((status, out, err))) => {
                safety_net.disarm();
                if !status.success() {
                    return Err(ExecError::Failed {
                        status,
                        stderr: String::from_utf8_lossy(&err).trim().to_string(),
                    });
                }
                Ok(String::from_utf8_lossy(&out).trim().to_string())
            }
            Ok(Err(err)) => {
                self.terminate(&mut child, pid).await;
                Err(ExecError::Io(err))
            }
            Err(_elapsed) => {
                warn!(host = %host.id, address = %host.address, ?pid, "command timed out, killing");
                self.terminate(&mut child, pid).await;
                Err(ExecError::Timeout(self.exec_timeout))
            }
        }
    }
}

async fn drain<R>(pipe: Option<&mut R>, buf: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match pipe {
        Some(p) => p.read_to_end(buf).await,
        None => Ok(0),
    }
}
