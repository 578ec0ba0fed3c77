//! Crate-wide constants.
//!
//! Groups the defaults of the public configuration surface, the wire
//! constants shared with the capture process, and the timing knobs of the
//! transport.
//!
//! # Categories
//!
//! - **Defaults**: Values used when an option is omitted
//! - **Wire**: Header size, lifecycle command strings, event topics
//! - **Timing**: Reconnect cadence, process exit grace

use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Port the capture process binds its WebSocket endpoint on.
pub const DEFAULT_PORT: u16 = 13346;

/// Host (network device) the capture process is reached on.
pub const DEFAULT_NETWORK_DEVICE: &str = "localhost";

/// Executable location, relative to the directory of the running binary.
pub const DEFAULT_EXECUTABLE: &str = "ZanarkandWrapper/ZanarkandWrapperJSON.exe";

// ============================================================================
// Wire
// ============================================================================

/// Size of the frame header stripped by the capture process.
///
/// Added to the payload length to report the full on-wire packet size.
pub const PACKET_HEADER_SIZE: usize = 32;

/// Lifecycle command that begins capturing.
pub const COMMAND_START: &str = "start";

/// Lifecycle command that pauses capturing.
pub const COMMAND_STOP: &str = "stop";

/// Lifecycle command that asks the capture process to exit.
pub const COMMAND_KILL: &str = "kill";

/// Topic that receives every dispatched packet.
pub const TOPIC_ANY: &str = "any";

/// Deprecated alias of [`TOPIC_ANY`], emitted last.
pub const TOPIC_RAW: &str = "raw";

// ============================================================================
// Timing
// ============================================================================

/// Delay between a transport error and the next connection attempt.
///
/// Constant across attempts; there is no retry cap.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Time a capture process gets to exit after its stdin closes before it is
/// killed during `reset` and `close`.
pub const PROCESS_EXIT_GRACE: Duration = Duration::from_secs(2);
