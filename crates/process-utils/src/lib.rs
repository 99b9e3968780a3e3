//! Process helpers shared by the external tool adapters.
//!
//! Children spawned through [`tokio_command`] never open a console window on
//! Windows, and [`spawn_process_waiter`] ties a child's lifetime to a
//! cancellation token so cancelled work is killed rather than abandoned.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` that is killed when dropped and has
/// `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// How a waited-on child process finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own with the given code.
    Exited(i32),
    /// The process was terminated by a signal and reported no code.
    Terminated,
    /// The cancellation token fired and the process was killed.
    Cancelled,
    /// Waiting on the process failed.
    Failed(String),
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short description suitable for status messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {code}"),
            Self::Terminated => "terminated by signal".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            Self::Failed(reason) => format!("wait failed: {reason}"),
        }
    }
}

#[cfg(feature = "tokio")]
pub use waiter::spawn_process_waiter;

#[cfg(feature = "tokio")]
mod waiter {
    use super::ExitOutcome;
    use tokio::process::Child;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, error, warn};

    /// Spawn a task that waits for `child` to exit and reports the outcome
    /// through a oneshot channel.
    ///
    /// If `cancellation_token` fires first the child is killed and
    /// [`ExitOutcome::Cancelled`] is sent.
    pub fn spawn_process_waiter(
        mut child: Child,
        cancellation_token: CancellationToken,
    ) -> oneshot::Receiver<ExitOutcome> {
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancellation_token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill cancelled process: {}", e);
                    } else {
                        debug!(pid = ?child.id(), "Killed cancelled process");
                    }
                    ExitOutcome::Cancelled
                }
                status = child.wait() => {
                    match status {
                        Ok(exit_status) => match exit_status.code() {
                            Some(code) => {
                                if code != 0 {
                                    warn!("Process exited with code: {}", code);
                                }
                                ExitOutcome::Exited(code)
                            }
                            None => ExitOutcome::Terminated,
                        },
                        Err(e) => {
                            error!("Error waiting for process: {}", e);
                            ExitOutcome::Failed(e.to_string())
                        }
                    }
                }
            };
            let _ = tx.send(outcome);
        });

        rx
    }
}
