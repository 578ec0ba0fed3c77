//! Zanarkand - client bridge to the ZanarkandWrapper packet capture process.
//!
//! This crate launches and supervises the capture process, keeps a
//! reconnecting WebSocket open to it, decodes every inbound message into a
//! [`PacketEnvelope`], enriches selected packet types and republishes them on
//! named channels.
//!
//! # Architecture
//!
//! - **Session** - Public controller; owns config, process and transport
//! - **Transport** - Reconnecting WebSocket client, single owner of the socket
//! - **Pipeline** - Decode, filter, postprocess and publish one message
//! - **Router** - Ordered channel fan-out (`any`, type, superType, subType, `raw`)
//! - **Process** - Capture executable launch, output relay, exit reporting
//!
//! # Modules
//!
//! - [`session`] - [`CaptureSession`] lifecycle and subscriptions
//! - [`transport`] - Connection state machine and reconnect task
//! - [`packet`] - Wire schema and payload readers
//! - [`postprocess`] - Derived fields per packet type
//! - [`config`] - Options, defaults and environment overrides

// Library modules
pub mod config;
pub mod constants;
pub mod error;
pub mod filter;
pub mod packet;
pub mod pipeline;
pub mod postprocess;
pub mod process;
pub mod router;
pub mod session;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use config::{Config, Logger, Options, Region};
pub use error::{Result, SessionError};
pub use filter::PacketFilter;
pub use packet::{Direction, PacketEnvelope};
pub use postprocess::{DerivedFields, PostprocessorRegistry};
pub use process::ProcessStatus;
pub use router::SubscriptionId;
pub use session::{CaptureSession, SessionState};
pub use transport::ConnectionState;
