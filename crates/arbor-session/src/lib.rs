//! Arbor Session -- batching, bandwidth negotiation and per-connection tasks.
//!
//! A [`Session`] wraps one [`arbor_protocol::Connection`] with the outbound
//! batch queue, the advertised bandwidth budget and a [`Transport`]. It is
//! driven either directly (tests, custom loops) or by the tokio task from
//! [`spawn_session`], optionally bridged to a byte stream with
//! [`run_stream_io`].
//!
//! Frame kinds on the transport, by leading 4-byte tag:
//!   - `ID_BATCH` (1): container of several messages
//!   - `ID_BANDWIDTH` (2): peer's advertised bytes/second
//!   - anything else: one protocol message

pub mod bandwidth;
pub mod batch;
pub mod config;
pub mod io;
pub mod session;
pub mod task;
pub mod transport;

pub use bandwidth::Bandwidth;
pub use batch::Batcher;
pub use config::{BandwidthSection, SessionConfig, SessionSection};
pub use io::{run_stream_io, spawn_stream_session, StreamSession};
pub use session::{ReceiveReport, Session, SessionStats};
pub use task::{spawn_session, SessionHandle};
pub use transport::{ChannelTransport, FrameCodec, Transport, TransportError};

use arbor_codec::CodecError;
use arbor_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("unexpected frame tag {0}")]
    UnexpectedFrame(u32),
    #[error("batch claims {count} messages with {remaining} bytes left")]
    BatchCount { count: usize, remaining: usize },
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("config error: {0}")]
    Config(String),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session task stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, SessionError>;
