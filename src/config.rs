//! Session configuration.
//!
//! Callers describe a session with [`Options`], where every field is
//! optional. [`Config::resolve`] fills the gaps from the defaults in
//! [`crate::constants`] and produces the immutable [`Config`] a session owns.
//! The caller's `Options` is only borrowed, never mutated.
//!
//! Options can also be filled from `ZANARKAND_*` environment variables via
//! [`Options::apply_env_overrides`]; explicitly set fields always win.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_EXECUTABLE, DEFAULT_NETWORK_DEVICE, DEFAULT_PORT, RECONNECT_DELAY,
};
use crate::error::SessionError;

/// Game client region, selecting the opcode table of the capture process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Region {
    /// Global client.
    #[default]
    Global,
    /// Korean client.
    KR,
    /// Chinese client.
    CN,
}

impl Region {
    /// Name as passed on the capture process command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "Global",
            Self::KR => "KR",
            Self::CN => "CN",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Global" | "global" => Ok(Self::Global),
            "KR" | "kr" => Ok(Self::KR),
            "CN" | "cn" => Ok(Self::CN),
            other => Err(SessionError::Config(format!("unknown region: {other}"))),
        }
    }
}

/// Logging sink receiving one line of text per call.
///
/// The default sink forwards to the `log` facade at info level under the
/// `zanarkand` target.
#[derive(Clone)]
pub struct Logger(Arc<dyn Fn(&str) + Send + Sync>);

impl Logger {
    /// Wrap a closure as a sink.
    pub fn new(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(sink))
    }

    /// A sink that discards every line.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Write one line to the sink.
    pub fn log(&self, line: impl AsRef<str>) {
        (self.0)(line.as_ref());
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(|line| log::info!(target: "zanarkand", "{}", line))
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

/// Caller-supplied session options. Every field is optional.
///
/// Deserializes from the camelCase option object of the JavaScript API, so
/// `{"port": 13346, "networkDevice": "localhost", "noExe": true}` is accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// Opcode region of the game client.
    pub region: Option<Region>,
    /// Port of the capture process endpoint.
    pub port: Option<u16>,
    /// Host or device IP to capture on and to connect to.
    pub network_device: Option<String>,
    /// Developer mode, enabling raw data output in the capture process.
    pub is_dev: Option<bool>,
    /// Logging sink. Not deserializable.
    #[serde(skip)]
    pub logger: Option<Logger>,
    /// Location of the capture executable.
    pub executable_path: Option<PathBuf>,
    /// Externally-managed mode: never spawn or terminate a process.
    pub no_exe: Option<bool>,
    /// Directory for remote resources the capture process downloads.
    pub data_path: Option<String>,
    /// Upper bound on waiting for the transport to open, in milliseconds.
    pub ready_timeout_ms: Option<u64>,
    /// Delay between transport reconnect attempts, in milliseconds.
    pub reconnect_delay_ms: Option<u64>,
}

impl Options {
    /// Empty options; every field falls back to its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the region.
    pub fn region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    /// Set the endpoint port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the network device (host).
    pub fn network_device(mut self, device: impl Into<String>) -> Self {
        self.network_device = Some(device.into());
        self
    }

    /// Enable or disable developer mode.
    pub fn dev(mut self, enable: bool) -> Self {
        self.is_dev = Some(enable);
        self
    }

    /// Set the logging sink.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Set the capture executable location.
    pub fn executable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable_path = Some(path.into());
        self
    }

    /// Enable or disable externally-managed mode.
    pub fn no_exe(mut self, enable: bool) -> Self {
        self.no_exe = Some(enable);
        self
    }

    /// Set the data path.
    pub fn data_path(mut self, path: impl Into<String>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Bound every wait for the transport to open.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Override the reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Fill unset fields from `ZANARKAND_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Fill unset fields from a key lookup. Unparseable values are skipped.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.region.is_none() {
            if let Some(value) = lookup("ZANARKAND_REGION") {
                match value.parse() {
                    Ok(region) => self.region = Some(region),
                    Err(e) => log::warn!("[Config] Ignoring ZANARKAND_REGION: {}", e),
                }
            }
        }

        if self.port.is_none() {
            if let Some(port) = lookup("ZANARKAND_PORT").and_then(|v| v.parse().ok()) {
                self.port = Some(port);
            }
        }

        if self.network_device.is_none() {
            self.network_device = lookup("ZANARKAND_NETWORK_DEVICE");
        }

        if self.is_dev.is_none() {
            self.is_dev = lookup("ZANARKAND_DEV").and_then(|v| parse_flag(&v));
        }

        if self.no_exe.is_none() {
            self.no_exe = lookup("ZANARKAND_NO_EXE").and_then(|v| parse_flag(&v));
        }

        if self.executable_path.is_none() {
            self.executable_path = lookup("ZANARKAND_EXE_PATH").map(PathBuf::from);
        }

        if self.data_path.is_none() {
            self.data_path = lookup("ZANARKAND_DATA_PATH");
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Resolved, immutable session configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Opcode region of the game client.
    pub region: Region,
    /// Port of the capture process endpoint.
    pub port: u16,
    /// Host or device IP to capture on and to connect to.
    pub network_device: String,
    /// Developer mode flag forwarded to the capture process.
    pub is_dev: bool,
    /// Logging sink.
    pub logger: Logger,
    /// Location of the capture executable.
    pub executable_path: PathBuf,
    /// Externally-managed mode.
    pub no_exe: bool,
    /// Data path forwarded to the capture process.
    pub data_path: String,
    /// Upper bound on waiting for the transport to open. `None` waits forever.
    pub ready_timeout: Option<Duration>,
    /// Delay between transport reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: Region::Global,
            port: DEFAULT_PORT,
            network_device: DEFAULT_NETWORK_DEVICE.to_string(),
            is_dev: false,
            logger: Logger::default(),
            executable_path: default_executable_path(),
            no_exe: false,
            data_path: String::new(),
            ready_timeout: None,
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

impl Config {
    /// Resolve options against the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] when a resolved value is unusable.
    pub fn resolve(options: &Options) -> Result<Self, SessionError> {
        let defaults = Self::default();

        if options.network_device.as_deref() == Some("") {
            return Err(SessionError::Config("network device must not be empty".into()));
        }

        Ok(Self {
            region: options.region.unwrap_or(defaults.region),
            port: options.port.unwrap_or(defaults.port),
            network_device: options
                .network_device
                .clone()
                .unwrap_or(defaults.network_device),
            is_dev: options.is_dev.unwrap_or(defaults.is_dev),
            logger: options.logger.clone().unwrap_or(defaults.logger),
            executable_path: options
                .executable_path
                .clone()
                .unwrap_or(defaults.executable_path),
            no_exe: options.no_exe.unwrap_or(defaults.no_exe),
            data_path: options.data_path.clone().unwrap_or(defaults.data_path),
            ready_timeout: options.ready_timeout_ms.map(Duration::from_millis),
            reconnect_delay: options
                .reconnect_delay_ms
                .map_or(defaults.reconnect_delay, Duration::from_millis),
        })
    }

    /// WebSocket endpoint of the capture process.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        format!("ws://{}:{}", self.network_device, self.port)
    }
}

/// `ZanarkandWrapper/ZanarkandWrapperJSON.exe` next to the running binary.
fn default_executable_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_EXECUTABLE)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE))
}
