//! Capture process supervision.
//!
//! Starts the capture executable, relays its stdout and stderr to the
//! logging sink line by line, and reports its exit. It knows nothing of the
//! command protocol; lifecycle commands travel over the transport.
//!
//! # Shutdown
//!
//! [`CaptureProcess::terminate`] only closes the child's stdin, which the
//! capture process treats as end of session. [`CaptureProcess::shutdown`]
//! additionally waits for the exit and kills the child once a grace period
//! runs out.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, watch};

use crate::config::{Config, Logger};
use crate::error::{Result, SessionError};

/// Lifecycle of the capture process as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProcessStatus {
    /// No process was launched (or the session is externally managed).
    #[default]
    NotStarted,
    /// The process is running.
    Running,
    /// The process exited; `None` when it was ended by a signal.
    Exited(Option<i32>),
    /// Spawning or waiting on the process failed.
    Failed(String),
}

impl ProcessStatus {
    /// Whether the process is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Command line of the capture process, in its fixed flag order.
///
/// Path separators in the data path are normalized to `/`.
#[must_use]
pub fn build_args(config: &Config) -> Vec<String> {
    vec![
        "-Region".to_string(),
        config.region.to_string(),
        "-Port".to_string(),
        config.port.to_string(),
        "-LocalIP".to_string(),
        config.network_device.clone(),
        "-Dev".to_string(),
        config.is_dev.to_string(),
        "-DataPath".to_string(),
        config.data_path.replace('\\', "/"),
    ]
}

/// Fail unless `path` exists on disk.
///
/// # Errors
///
/// Returns [`SessionError::ExecutableNotFound`] naming `path`.
pub fn ensure_executable(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(SessionError::ExecutableNotFound(path.to_path_buf()))
    }
}

/// Handle to a running capture process.
#[derive(Debug)]
pub struct CaptureProcess {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    status: watch::Receiver<ProcessStatus>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl CaptureProcess {
    /// Spawn `executable` with `args`.
    ///
    /// Output lines, spawn-time errors and the exit code are reported to
    /// `logger`. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Spawn`] if the OS refuses to start it.
    pub fn launch(executable: &Path, args: &[String], logger: &Logger) -> Result<Self> {
        log::info!(
            "[Capture] Launching {} {}",
            executable.display(),
            args.join(" ")
        );

        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                logger.log(e.to_string());
                SessionError::Spawn(e.to_string())
            })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, logger.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, logger.clone()));
        }

        let (status_tx, status) = watch::channel(ProcessStatus::Running);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let exit_logger = logger.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                result = child.wait() => result,
                Ok(()) = &mut kill_rx => {
                    log::debug!("[Capture] Killing process {:?}", pid);
                    if let Err(e) = child.start_kill() {
                        log::warn!("[Capture] Kill failed: {}", e);
                    }
                    child.wait().await
                }
            };

            let status = match result {
                Ok(exit) => {
                    let code = exit
                        .code()
                        .map_or_else(|| "null".to_string(), |c| c.to_string());
                    exit_logger.log(format!("ZanarkandWrapper closed with code: {code}"));
                    ProcessStatus::Exited(exit.code())
                }
                Err(e) => {
                    exit_logger.log(e.to_string());
                    ProcessStatus::Failed(e.to_string())
                }
            };
            status_tx.send_replace(status);
        });

        Ok(Self {
            pid,
            stdin,
            status,
            kill_tx: Some(kill_tx),
        })
    }

    /// OS process id, if the process is still known to the OS.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ProcessStatus {
        self.status.borrow().clone()
    }

    /// Receiver observing the exit of the process.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ProcessStatus> {
        self.status.clone()
    }

    /// Close the child's stdin. The process is left to exit on its own.
    pub fn terminate(&mut self) {
        if self.stdin.take().is_some() {
            log::debug!("[Capture] Closed stdin of process {:?}", self.pid);
        }
    }

    /// Kill the process immediately.
    pub fn force_kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    /// Terminate, wait up to `grace` for the exit, then kill.
    ///
    /// Returns the final status.
    pub async fn shutdown(mut self, grace: Duration) -> ProcessStatus {
        self.terminate();

        let mut status = self.watch_status();
        let timed_out = tokio::time::timeout(grace, status.wait_for(|s| !s.is_running()))
            .await
            .is_err();
        if timed_out {
            log::debug!(
                "[Capture] Process {:?} still running after {:?}, killing",
                self.pid,
                grace
            );
            self.force_kill();
            let _ = status.wait_for(|s| !s.is_running()).await;
        }

        self.status()
    }
}

/// Relay each line of `stream` to the sink until EOF.
async fn forward_lines(stream: impl AsyncRead + Unpin, logger: Logger) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => logger.log(line),
            Ok(None) => break,
            Err(e) => {
                log::debug!("[Capture] Output stream error: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Options, Region};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    const WAIT_GRACE: Duration = Duration::from_secs(3);

    fn recording_logger() -> (Logger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        (
            Logger::new(move |line| sink.lock().unwrap().push(line.to_string())),
            lines,
        )
    }

    #[test]
    fn test_build_args_order() {
        let options = Options::new()
            .region(Region::CN)
            .port(4000)
            .network_device("10.0.0.5")
            .dev(true)
            .data_path("C:\\Users\\me\\data");
        let config = Config::resolve(&options).unwrap();

        assert_eq!(
            build_args(&config),
            vec![
                "-Region", "CN", "-Port", "4000", "-LocalIP", "10.0.0.5", "-Dev", "true",
                "-DataPath", "C:/Users/me/data",
            ]
        );
    }

    #[test]
    fn test_build_args_defaults() {
        let config = Config::resolve(&Options::new()).unwrap();
        let args = build_args(&config);
        assert_eq!(args[1], "Global");
        assert_eq!(args[3], "13346");
        assert_eq!(args[5], "localhost");
        assert_eq!(args[7], "false");
        assert_eq!(args[9], "");
    }

    #[test]
    fn test_ensure_executable_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("ZanarkandWrapperJSON.exe");
        assert!(matches!(
            ensure_executable(&missing),
            Err(SessionError::ExecutableNotFound(path)) if path == missing
        ));
    }

    #[test]
    fn test_ensure_executable_present() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(ensure_executable(file.path()).is_ok());
    }

    #[tokio::test]
    async fn test_launch_missing_binary_fails() {
        let (logger, lines) = recording_logger();
        let result = CaptureProcess::launch(
            &PathBuf::from("/nonexistent/zanarkand-wrapper"),
            &[],
            &logger,
        );
        assert!(matches!(result, Err(SessionError::Spawn(_))));
        assert_eq!(lines.lock().unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_and_exit_code_are_logged() {
        let (logger, lines) = recording_logger();
        let args = vec![
            "-c".to_string(),
            "echo ready; read line; echo stderr-line >&2; exit 3".to_string(),
        ];
        let mut process = CaptureProcess::launch(Path::new("/bin/sh"), &args, &logger).unwrap();
        assert!(process.pid().is_some());
        assert_eq!(process.status(), ProcessStatus::Running);

        process.terminate();
        let mut status = process.watch_status();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| !s.is_running()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(process.status(), ProcessStatus::Exited(Some(3)));

        // Output forwarders may trail the exit slightly.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let lines = lines.lock().unwrap();
        assert!(lines.contains(&"ready".to_string()), "log: {lines:?}");
        assert!(lines.contains(&"stderr-line".to_string()), "log: {lines:?}");
        assert!(lines.contains(&"ZanarkandWrapper closed with code: 3".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_returns_exit_within_grace() {
        let (logger, _lines) = recording_logger();
        let args = vec!["-c".to_string(), "read line; exit 4".to_string()];
        let process = CaptureProcess::launch(Path::new("/bin/sh"), &args, &logger).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), process.shutdown(WAIT_GRACE))
            .await
            .unwrap();
        assert_eq!(status, ProcessStatus::Exited(Some(4)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_kills_after_grace() {
        let (logger, _lines) = recording_logger();
        let args = vec!["-c".to_string(), "exec sleep 30".to_string()];
        let process = CaptureProcess::launch(Path::new("/bin/sh"), &args, &logger).unwrap();

        let status = tokio::time::timeout(
            Duration::from_secs(5),
            process.shutdown(Duration::from_millis(100)),
        )
        .await
        .unwrap();
        assert_eq!(status, ProcessStatus::Exited(None));
    }
}
