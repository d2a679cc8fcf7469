//! Operator terminal engine
//!
//! Runs allow-listed diagnostic commands on behalf of an operator connected
//! over a WebSocket and streams their output back as JSON messages.

pub mod allowlist;
pub mod commands;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod runner;
pub mod sender;
pub mod session;
pub mod timeout;

pub use allowlist::{CommandAllowlist, ValidatedCommand, MAX_ARG_LEN};
pub use error::{RunError, TransportError, ValidationError};
pub use lifecycle::{CommandController, CommandState, RunMode, StartError};
pub use protocol::{InboundRequest, MessageKind, OutboundMessage};
pub use runner::{ProcessRunner, RunnerConfig};
pub use sender::{FrameSink, MessageSink, OutputSender};
pub use session::{Frame, FrameSource, Session, SessionConfig};
pub use timeout::CommandTimeout;
