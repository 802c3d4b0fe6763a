//! A running backend process

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::error::SupervisorError;
use crate::proxy::backend::ExitReason;

/// The supervised child process
///
/// Killed if dropped while still running, so an instance never leaks past
/// its owner.
#[derive(Debug)]
pub struct BackendProcess {
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
}

impl BackendProcess {
    /// Launch the backend command with its environment
    pub fn spawn(config: &ProxyConfig) -> Result<Self, SupervisorError> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or(SupervisorError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(config.launch_env())
            .envs(&config.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            command: config.command_line(),
            source,
        })?;

        Ok(Self {
            pid: child.id(),
            child,
            started_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wait for the process to exit and reap it
    ///
    /// Cancel safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Send a signal; a process that is already gone is not an error
    pub fn signal(&self, signal: Signal) -> Result<(), SupervisorError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };

        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    ///
    /// Cancelling `force` skips whatever is left of the grace period.
    pub async fn terminate(&mut self, grace: Duration, force: &CancellationToken) -> Result<ExitReason, SupervisorError> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.into());
        }

        if !force.is_cancelled() {
            self.signal(Signal::SIGTERM)?;

            tokio::select! {
                status = self.child.wait() => return Ok(status?.into()),
                _ = sleep(grace) => {
                    tracing::warn!(
                        pid = self.pid,
                        grace_ms = grace.as_millis() as u64,
                        "Backend still running after grace period, killing"
                    );
                }
                _ = force.cancelled() => {
                    tracing::warn!(pid = self.pid, "Forced shutdown, killing backend");
                }
            }
        }

        self.child.kill().await?;
        Ok(self.child.wait().await?.into())
    }
}
