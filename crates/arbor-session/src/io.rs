//! Stream I/O -- runs a session over any byte stream.
//!
//! Frames written by the session's [`ChannelTransport`] are length-prefixed
//! onto the stream; frames read from the stream are handed to the session
//! task. Reads and writes share one task and one `select!` loop.

use std::sync::Arc;

use arbor_protocol::{Connection, Tree};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::config::SessionConfig;
use crate::session::{Session, SessionStats};
use crate::task::{spawn_session, SessionHandle};
use crate::transport::{ChannelTransport, FrameCodec, TransportError};

/// Everything [`spawn_stream_session`] started.
pub struct StreamSession {
    pub handle: SessionHandle<ChannelTransport>,
    pub session: JoinHandle<SessionStats>,
    pub io: JoinHandle<Result<(), TransportError>>,
}

/// Builds a session for `tree` on `stream` and spawns both tasks.
pub fn spawn_stream_session<S>(
    stream: S,
    tree: Arc<Tree>,
    label: &str,
    config: &SessionConfig,
    shutdown: &broadcast::Sender<()>,
) -> StreamSession
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (transport, outbound) = ChannelTransport::new();
    let session = Session::new(Connection::new(tree, label), transport, config);
    let (handle, session) = spawn_session(session, config, shutdown.subscribe());
    let io = tokio::spawn(run_stream_io(
        stream,
        handle.clone(),
        outbound,
        shutdown.subscribe(),
    ));
    StreamSession { handle, session, io }
}

/// Pumps frames between `stream` and a session task until the stream
/// closes, the session stops, or shutdown is signalled. After shutdown it
/// keeps writing until the session's transport is dropped.
pub async fn run_stream_io<S>(
    stream: S,
    handle: SessionHandle<ChannelTransport>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::default()).split();
    let mut draining = false;

    loop {
        tokio::select! {
            frame = frames.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        if handle.deliver(frame).await.is_err() {
                            tracing::debug!("io: session stopped");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("io: read failed: {e}");
                        return Err(e);
                    }
                    None => {
                        tracing::debug!("io: stream closed by peer");
                        break;
                    }
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(frame) => sink.send(frame).await?,
                    None => {
                        tracing::debug!("io: transport dropped");
                        break;
                    }
                }
            }

            _ = shutdown.recv() => {
                tracing::debug!("io: shutting down");
                draining = true;
                break;
            }
        }
    }

    if draining {
        // The session's final flush lands after shutdown; the channel closes
        // once the session task drops its transport.
        while let Some(frame) = outbound.recv().await {
            sink.feed(frame).await?;
        }
    } else {
        while let Ok(frame) = outbound.try_recv() {
            sink.feed(frame).await?;
        }
    }
    sink.flush().await?;
    Ok(())
}
