//! Public session controller.
//!
//! A [`CaptureSession`] owns the resolved [`Config`], the capture process (unless
//! externally managed), the transport and the packet pipeline. It exposes the
//! lifecycle commands and the subscription surface.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──start──► Running ──stop──► Stopped ──start──► Running
//!       │                     │
//!       └───────kill──────────┴──kill──► Killed ──reset──► Running
//! ```
//!
//! Lifecycle operations are serialized by an async mutex, so a `reset` never
//! interleaves with a `start` issued from another task. Every operation that
//! shuts the transport down cancels its pending reconnect timer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use crate::config::{Config, Options};
use crate::constants::{COMMAND_KILL, COMMAND_START, COMMAND_STOP, PROCESS_EXIT_GRACE};
use crate::error::{Result, SessionError};
use crate::filter::{PacketFilter, SharedFilter};
use crate::packet::PacketEnvelope;
use crate::pipeline::Pipeline;
use crate::postprocess::PostprocessorRegistry;
use crate::process::{self, CaptureProcess, ProcessStatus};
use crate::router::{SharedRouter, SubscriptionId};
use crate::transport::{ConnectionState, TransportClient};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Constructed; no lifecycle command issued yet.
    #[default]
    Uninitialized,
    /// `start` succeeded.
    Running,
    /// `stop` succeeded.
    Stopped,
    /// `kill` succeeded; only `reset` brings the session back.
    Killed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Mutable session data. Never held across an await point.
#[derive(Debug)]
struct Inner {
    state: SessionState,
    process: Option<CaptureProcess>,
    /// Status of the most recently launched process, kept after release.
    process_status: watch::Receiver<ProcessStatus>,
}

/// Client-side bridge to one capture process.
#[derive(Debug)]
pub struct CaptureSession {
    config: Config,
    /// Launch arguments; `None` when externally managed.
    args: Option<Vec<String>>,
    filter: SharedFilter,
    router: SharedRouter,
    transport: TransportClient,
    lifecycle: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

impl CaptureSession {
    /// Create a session with the built-in postprocessors.
    ///
    /// Launches the capture process (unless `noExe`) and starts connecting
    /// the transport. Fails if the executable does not exist. A process that
    /// exists but cannot be spawned is reported to the logging sink and
    /// surfaces later as [`SessionError::Uninitialized`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] for unusable options and
    /// [`SessionError::ExecutableNotFound`] when the executable is missing.
    pub fn new(options: Options) -> Result<Self> {
        Self::with_postprocessors(options, PostprocessorRegistry::with_defaults())
    }

    /// Create a session with a caller-supplied postprocessor registry.
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`].
    pub fn with_postprocessors(options: Options, registry: PostprocessorRegistry) -> Result<Self> {
        let config = Config::resolve(&options)?;

        let (args, process, process_status) = if config.no_exe {
            log::info!("[Session] Externally managed; not launching a capture process");
            (None, None, not_started())
        } else {
            process::ensure_executable(&config.executable_path)?;
            let args = process::build_args(&config);
            config.logger.log(format!(
                "Starting ZanarkandWrapper from executable {}",
                config.executable_path.display()
            ));
            let (process, status) = launch(&config, &args);
            (Some(args), process, status)
        };

        let filter = SharedFilter::new();
        let router = SharedRouter::new();
        let pipeline = Pipeline::new(
            filter.clone(),
            Arc::new(registry),
            router.clone(),
            config.logger.clone(),
        );
        let transport = TransportClient::new(&config, pipeline);
        transport.connect();

        Ok(Self {
            config,
            args,
            filter,
            router,
            transport,
            lifecycle: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                process,
                process_status,
            }),
        })
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("session mutex poisoned")
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    /// Transport connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Status of the capture process.
    #[must_use]
    pub fn process_status(&self) -> ProcessStatus {
        self.inner().process_status.borrow().clone()
    }

    /// Wait until the transport is open.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Timeout`] once `timeout` elapses and
    /// [`SessionError::Cancelled`] if the session is closed meanwhile.
    pub async fn wait_ready(&self, timeout: Option<Duration>) -> Result<()> {
        self.transport.wait_open(timeout).await
    }

    /// Send `start` to the capture process.
    ///
    /// No-op when externally managed. Waits for the transport to open,
    /// bounded by the configured ready timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Uninitialized`] when no capture process
    /// exists, or the transport error if the endpoint does not open in time
    /// or the send fails.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<()> {
        if self.config.no_exe {
            log::debug!("[Session] start ignored: externally managed");
            return Ok(());
        }
        self.require_process()?;

        self.transport.connect();
        self.send_when_open(COMMAND_START, self.config.ready_timeout)
            .await?;

        self.set_state(SessionState::Running);
        self.config.logger.log("ZanarkandWrapper started!");
        Ok(())
    }

    /// Send `stop`, then close the transport.
    ///
    /// Reconnects first when no transport run is alive.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Uninitialized`] when no capture process
    /// exists, or the transport error if the endpoint does not open within
    /// the ready timeout or the send fails.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        if self.config.no_exe {
            log::debug!("[Session] stop ignored: externally managed");
            return Ok(());
        }
        self.require_process()?;

        self.transport.connect();
        self.send_when_open(COMMAND_STOP, self.config.ready_timeout)
            .await?;
        self.transport.close().await;

        self.set_state(SessionState::Stopped);
        self.config.logger.log("ZanarkandWrapper stopped!");
        Ok(())
    }

    /// Send `kill`, close the transport and shut the process down.
    ///
    /// Reconnects first when no transport run is alive, waiting at most the
    /// ready timeout (or [`PROCESS_EXIT_GRACE`] when none is set). The process
    /// then gets [`PROCESS_EXIT_GRACE`] to exit before it is force-killed, so
    /// a killed session never leaves it running.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Uninitialized`] when no capture process
    /// exists. A failed send is returned after the process is gone; the
    /// session is `Killed` either way.
    pub async fn kill(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        if self.config.no_exe {
            log::debug!("[Session] kill ignored: externally managed");
            return Ok(());
        }
        self.require_process()?;

        self.transport.connect();
        let limit = self.config.ready_timeout.unwrap_or(PROCESS_EXIT_GRACE);
        let sent = self.send_when_open(COMMAND_KILL, Some(limit)).await;
        self.transport.close().await;

        let process = self.inner().process.take();
        if let Some(process) = process {
            let status = process.shutdown(PROCESS_EXIT_GRACE).await;
            log::debug!("[Session] Killed capture process ended: {:?}", status);
        }
        self.set_state(SessionState::Killed);

        if let Err(e) = sent {
            log::warn!("[Session] kill command was not delivered: {}", e);
            return Err(e);
        }
        self.config.logger.log("ZanarkandWrapper killed!");
        Ok(())
    }

    /// Kill, relaunch the capture process with its launch arguments and
    /// start it again.
    ///
    /// Any pending reconnect of the previous transport run is cancelled
    /// before the relaunch.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoInstanceToReset`] when externally managed,
    /// [`SessionError::Uninitialized`] when the relaunch fails to spawn, and
    /// any error of the following `start`.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let Some(args) = self.args.as_ref() else {
            return Err(SessionError::NoInstanceToReset);
        };

        if self.transport.state().is_open() {
            if let Err(e) = self.transport.send(COMMAND_KILL).await {
                log::warn!("[Session] kill before reset failed: {}", e);
            }
        }
        self.transport.close().await;

        let previous = self.inner().process.take();
        if let Some(previous) = previous {
            let status = previous.shutdown(PROCESS_EXIT_GRACE).await;
            log::debug!("[Session] Previous capture process ended: {:?}", status);
        }

        let (process, status) = launch(&self.config, args);
        {
            let mut inner = self.inner();
            inner.process = process;
            inner.process_status = status;
        }

        self.transport.connect();
        self.start_locked().await?;
        self.config.logger.log("ZanarkandWrapper reset!");
        Ok(())
    }

    /// Close the transport and shut down the capture process, in any mode.
    ///
    /// Stops all reconnect attempts. The session can be restarted with
    /// [`Self::start`] (or [`Self::reset`] once the process is gone).
    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;

        self.transport.close().await;
        let process = self.inner().process.take();
        if let Some(process) = process {
            let status = process.shutdown(PROCESS_EXIT_GRACE).await;
            log::debug!("[Session] Capture process ended: {:?}", status);
        }
        log::info!("[Session] Closed");
    }

    /// Replace the packet allow-list. An empty list accepts everything.
    pub fn set_filter<I, S>(&self, identifiers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filter = PacketFilter::from_identifiers(identifiers);
        log::debug!("[Session] Filter set to {:?}", filter.identifiers());
        self.filter.replace(filter);
    }

    /// Current packet allow-list.
    #[must_use]
    pub fn filter(&self) -> PacketFilter {
        self.filter.snapshot()
    }

    /// Subscribe to a channel: `"any"`, a packet type, super- or subtype, or `"raw"`.
    pub fn subscribe<F>(&self, channel: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<PacketEnvelope>) + Send + Sync + 'static,
    {
        self.router.subscribe(channel, callback)
    }

    /// Remove a subscription. Returns `false` if it did not exist.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.router.unsubscribe(id)
    }

    /// Receiver resolving with the next packet on `channel`.
    ///
    /// The subscription is registered immediately.
    pub fn once(&self, channel: &str) -> oneshot::Receiver<Arc<PacketEnvelope>> {
        self.router.once(channel)
    }

    /// Parse a raw capture message. Unsupported.
    ///
    /// # Errors
    ///
    /// Always returns [`SessionError::NotImplemented`].
    pub fn parse(&self, _raw: &[u8]) -> Result<PacketEnvelope> {
        Err(SessionError::NotImplemented("Raw message parsing"))
    }

    async fn send_when_open(&self, command: &str, timeout: Option<Duration>) -> Result<()> {
        self.transport.wait_open(timeout).await?;
        self.transport.send(command).await
    }

    fn require_process(&self) -> Result<()> {
        if self.inner().process.is_some() {
            Ok(())
        } else {
            Err(SessionError::Uninitialized)
        }
    }

    fn set_state(&self, state: SessionState) {
        let mut inner = self.inner();
        if inner.state != state {
            log::debug!("[Session] {} -> {}", inner.state, state);
            inner.state = state;
        }
    }
}

fn not_started() -> watch::Receiver<ProcessStatus> {
    watch::channel(ProcessStatus::NotStarted).1
}

/// Launch the capture process. Spawn failures are logged and leave no process.
fn launch(
    config: &Config,
    args: &[String],
) -> (Option<CaptureProcess>, watch::Receiver<ProcessStatus>) {
    match CaptureProcess::launch(&config.executable_path, args, &config.logger) {
        Ok(process) => {
            let status = process.watch_status();
            (Some(process), status)
        }
        Err(e) => {
            log::error!("[Session] {}", e);
            (None, watch::channel(ProcessStatus::Failed(e.to_string())).1)
        }
    }
}
