//! Session task -- owns a [`Session`] on its own tokio task.
//!
//! Three inputs, one owner:
//!   1. Tick timer -> flush + budget check
//!   2. Commands -> inbound frames and closures submitted by handles
//!   3. Shutdown broadcast -> final flush and exit
//!
//! Nothing else touches the session, so connection state is never shared
//! between threads.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::session::{Session, SessionStats};
use crate::transport::{ChannelTransport, Transport};
use crate::{Result, SessionError};

type Job<T> = Box<dyn FnOnce(&mut Session<T>) + Send>;

enum Command<T: Transport> {
    Execute(Job<T>),
    Inbound(Bytes),
}

/// Cloneable sender side of a session task.
pub struct SessionHandle<T: Transport = ChannelTransport> {
    tx: mpsc::Sender<Command<T>>,
}

impl<T: Transport> Clone for SessionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Transport + 'static> SessionHandle<T> {
    /// Runs `f` on the session task and returns its result.
    pub async fn execute<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session<T>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job<T> = Box::new(move |session| {
            let _ = reply_tx.send(f(session));
        });
        self.tx
            .send(Command::Execute(job))
            .await
            .map_err(|_| SessionError::Stopped)?;
        reply_rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Hands a received frame to the session.
    pub async fn deliver(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(Command::Inbound(frame))
            .await
            .map_err(|_| SessionError::Stopped)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawns the session loop. The join handle yields the final stats.
pub fn spawn_session<T: Transport + 'static>(
    session: Session<T>,
    config: &SessionConfig,
    shutdown: broadcast::Receiver<()>,
) -> (SessionHandle<T>, JoinHandle<SessionStats>) {
    let (tx, rx) = mpsc::channel(config.session.command_capacity);
    let tick = Duration::from_millis(config.session.tick_interval_ms);
    let join = tokio::spawn(run_session_loop(session, rx, tick, shutdown));
    (SessionHandle { tx }, join)
}

async fn run_session_loop<T: Transport + 'static>(
    mut session: Session<T>,
    mut rx: mpsc::Receiver<Command<T>>,
    tick: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> SessionStats {
    let label = session.connection().label().to_string();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    if let Err(e) = session.start() {
        tracing::warn!(conn = %label, "session: start failed: {e}");
        return session.stats().clone();
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = session.tick() {
                    tracing::warn!(conn = %label, "session: tick failed, stopping: {e}");
                    return session.stats().clone();
                }
            }

            command = rx.recv() => {
                match command {
                    Some(Command::Execute(job)) => job(&mut session),
                    Some(Command::Inbound(frame)) => {
                        let report = session.receive(frame);
                        tracing::trace!(
                            conn = %label,
                            delivered = report.deliveries.len(),
                            dropped = report.dropped(),
                            "session: frame applied"
                        );
                    }
                    None => {
                        tracing::info!(conn = %label, "session: all handles dropped");
                        break;
                    }
                }
            }

            _ = shutdown.recv() => {
                tracing::info!(conn = %label, "session: shutting down");
                break;
            }
        }
    }

    if let Err(e) = session.flush() {
        tracing::debug!(conn = %label, "session: final flush failed: {e}");
    }
    session.stats().clone()
}
