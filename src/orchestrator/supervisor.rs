//! Capture process supervision.
//!
//! One external capture process per recording session. The supervisor
//! can start it, probe whether it is still running, and ask it to stop.
//! Termination is best-effort: success means the signal was delivered,
//! not that the process has exited.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{info, info_span, warn};

use crate::config::CaptureConfig;
use crate::{AppError, Result};

/// A running (or recently running) capture process.
pub trait CaptureProcess: Send + Sync {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Non-invasive liveness probe; never changes the process state.
    fn is_live(&mut self) -> bool;

    /// Request termination without waiting for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SignalFailure` if the request could not be delivered.
    fn terminate(&mut self) -> Result<()>;
}

/// Owned handle to a capture process.
///
/// The session store holds one only while the session is `Active`.
pub struct ProcessHandle(Box<dyn CaptureProcess>);

impl ProcessHandle {
    /// Wrap a capture process.
    #[must_use]
    pub fn new(process: impl CaptureProcess + 'static) -> Self {
        Self(Box::new(process))
    }

    /// OS process id, if known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.0.pid()
    }

    /// See [`CaptureProcess::is_live`].
    pub fn is_live(&mut self) -> bool {
        self.0.is_live()
    }

    /// See [`CaptureProcess::terminate`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::SignalFailure` if the request could not be delivered.
    pub fn terminate(&mut self) -> Result<()> {
        self.0.terminate()
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid())
            .finish()
    }
}

/// Starts capture processes and re-attaches to ones left by a prior run.
pub trait ProcessSupervisor: Send + Sync {
    /// Start a capture of `camera_url` into `output_path` for `duration_seconds`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SpawnFailure` if the process cannot be started.
    fn spawn(
        &self,
        camera_url: &str,
        output_path: &Path,
        duration_seconds: u64,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessHandle>> + Send + '_>>;

    /// Re-attach to a process started by an earlier agent run.
    fn adopt(&self, pid: u32) -> ProcessHandle;
}

/// Supervisor that runs the configured capture command.
#[derive(Debug, Clone)]
pub struct CommandSupervisor {
    capture: CaptureConfig,
}

impl CommandSupervisor {
    /// Create a supervisor for the given capture template.
    #[must_use]
    pub fn new(capture: CaptureConfig) -> Self {
        Self { capture }
    }

    fn start(
        &self,
        camera_url: &str,
        output_path: &Path,
        duration_seconds: u64,
    ) -> Result<ProcessHandle> {
        let span = info_span!("spawn_capture", program = %self.capture.program);
        let _guard = span.enter();

        let args = self
            .capture
            .render_args(camera_url, duration_seconds, output_path);

        // The capture must outlive an agent restart so it can be adopted.
        let child = Command::new(&self.capture.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|err| {
                AppError::SpawnFailure(format!(
                    "failed to start {}: {err}",
                    self.capture.program
                ))
            })?;

        info!(
            pid = child.id().unwrap_or(0),
            output = %output_path.display(),
            "capture process started"
        );
        Ok(ProcessHandle::new(SpawnedProcess { child }))
    }
}

impl ProcessSupervisor for CommandSupervisor {
    fn spawn(
        &self,
        camera_url: &str,
        output_path: &Path,
        duration_seconds: u64,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessHandle>> + Send + '_>> {
        let result = self.start(camera_url, output_path, duration_seconds);
        Box::pin(async move { result })
    }

    fn adopt(&self, pid: u32) -> ProcessHandle {
        ProcessHandle::new(AdoptedProcess { pid })
    }
}

/// Capture process started by this agent.
struct SpawnedProcess {
    child: Child,
}

impl CaptureProcess for SpawnedProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_live(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(err) => {
                warn!(%err, "failed to poll capture process status");
                false
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        let pid = self
            .child
            .id()
            .ok_or_else(|| AppError::SignalFailure("process already reaped".into()))?;
        send_sigterm(pid)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.child
            .start_kill()
            .map_err(|err| AppError::SignalFailure(format!("kill failed: {err}")))
    }
}

/// Capture process inherited from an earlier agent run, known only by pid.
struct AdoptedProcess {
    pid: u32,
}

impl CaptureProcess for AdoptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    #[cfg(unix)]
    fn is_live(&mut self) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(self.pid) else {
            return false;
        };
        // Signal 0 checks existence only. EPERM means the pid now belongs
        // to another user, so it is not our capture.
        kill(Pid::from_raw(raw), None).is_ok()
    }

    #[cfg(not(unix))]
    fn is_live(&mut self) -> bool {
        false
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        send_sigterm(self.pid)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        Err(AppError::SignalFailure(
            "adopted processes cannot be signalled on this platform".into(),
        ))
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| AppError::SignalFailure(format!("pid {pid} out of range")))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .map_err(|err| AppError::SignalFailure(format!("SIGTERM to {pid} failed: {err}")))
}
