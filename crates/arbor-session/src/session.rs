//! Session -- one connection with its batcher, bandwidth state and transport.
//!
//! Everything a peer link does passes through here: typed sends are encoded
//! by the [`Connection`], queued in the [`Batcher`] and written to the
//! [`Transport`] on tick, overflow or urgent priority. Received frames are
//! unpacked (batch containers, bandwidth adverts) and dispatched message by
//! message; a malformed message is logged and dropped without affecting the
//! rest of the frame or the connection.

use arbor_codec::BitEncoder;
use arbor_protocol::{
    Connection, Delivery, DynamicLink, EndpointRef, MessageContext, Priority, ID_BANDWIDTH,
    ID_BATCH,
};
use bytes::Bytes;

use crate::bandwidth::{self, Bandwidth};
use crate::batch::{self, Batcher};
use crate::config::SessionConfig;
use crate::transport::{ChannelTransport, Transport};
use crate::{Result, SessionError};

/// Leading bytes of a dropped message included in the log line.
const LOG_HEAD_BYTES: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub frames_received: u64,
    pub paths_registered: u64,
    pub messages_delivered: u64,
    pub messages_missing: u64,
    pub messages_dropped: u64,
    pub over_budget_ticks: u64,
    /// Outbound messages lost because the transport failed before they
    /// reached the batcher.
    pub messages_discarded: u64,
    /// Frames the transport refused or never got to see.
    pub frames_discarded: u64,
}

/// What one received frame produced.
#[derive(Debug, Default)]
pub struct ReceiveReport {
    pub deliveries: Vec<Delivery>,
    pub errors: Vec<SessionError>,
}

impl ReceiveReport {
    pub fn dropped(&self) -> usize {
        self.errors.len()
    }
}

pub struct Session<T: Transport = ChannelTransport> {
    conn: Connection,
    batcher: Batcher,
    bandwidth: Bandwidth,
    transport: T,
    tick_interval_ms: u64,
    tick_bytes: u64,
    started: bool,
    stats: SessionStats,
}

impl<T: Transport> Session<T> {
    pub fn new(conn: Connection, transport: T, config: &SessionConfig) -> Self {
        Self {
            conn,
            batcher: Batcher::new(config.session.max_frame_bytes),
            bandwidth: Bandwidth::new(&config.bandwidth),
            transport,
            tick_interval_ms: config.session.tick_interval_ms,
            tick_bytes: 0,
            started: false,
            stats: SessionStats::default(),
        }
    }

    /// Advertises the local bandwidth cap. Later calls do nothing.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        let advert = self.bandwidth.advertisement();
        self.write(advert)?;
        tracing::info!(
            conn = %self.conn.label(),
            local_cap = self.bandwidth.local_cap(),
            "session: started"
        );
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn bandwidth(&self) -> &Bandwidth {
        &self.bandwidth
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Messages waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.batcher.len()
    }

    pub fn send<C, F>(&mut self, endpoint: &EndpointRef<C>, value: C, payload: F) -> Result<()>
    where
        C: Send + Sync + 'static,
        F: FnOnce(&mut BitEncoder, &MessageContext<'_>) -> arbor_protocol::Result<()>,
    {
        self.conn.send(endpoint, value, payload)?;
        self.collect()
    }

    pub fn send_with_priority<C, F>(
        &mut self,
        endpoint: &EndpointRef<C>,
        value: C,
        priority: Priority,
        payload: F,
    ) -> Result<()>
    where
        C: Send + Sync + 'static,
        F: FnOnce(&mut BitEncoder, &MessageContext<'_>) -> arbor_protocol::Result<()>,
    {
        self.conn.send_with_priority(endpoint, value, priority, payload)?;
        self.collect()
    }

    pub fn send_linked<C, L, F>(
        &mut self,
        endpoint: &EndpointRef<C>,
        value: C,
        link: DynamicLink<L>,
        priority: Priority,
        payload: F,
    ) -> Result<()>
    where
        C: Send + Sync + 'static,
        F: FnOnce(&mut BitEncoder, &MessageContext<'_>) -> arbor_protocol::Result<()>,
    {
        self.conn.send_linked(endpoint, value, link, priority, payload)?;
        self.collect()
    }

    pub fn signal<C>(&mut self, endpoint: &EndpointRef<C>, value: C) -> Result<()>
    where
        C: Send + Sync + 'static,
    {
        self.conn.signal(endpoint, value)?;
        self.collect()
    }

    /// Runs `f` against the connection (cache lookups, stats) and queues
    /// whatever it sent.
    pub fn with_connection<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> arbor_protocol::Result<R>,
    {
        let result = f(&mut self.conn);
        self.collect()?;
        Ok(result?)
    }

    /// Writes everything queued as one frame.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(frame) = self.batcher.flush()? {
            self.write(frame)?;
        }
        Ok(())
    }

    /// Periodic flush plus the advisory budget check.
    pub fn tick(&mut self) -> Result<()> {
        self.flush()?;
        let budget = self.bandwidth.per_tick(self.tick_interval_ms);
        if self.tick_bytes > budget {
            self.stats.over_budget_ticks += 1;
            tracing::warn!(
                conn = %self.conn.label(),
                sent = self.tick_bytes,
                budget,
                effective = self.bandwidth.effective(),
                "bandwidth: tick over budget"
            );
        }
        self.tick_bytes = 0;
        Ok(())
    }

    /// Unpacks and dispatches one transport frame.
    pub fn receive(&mut self, frame: Bytes) -> ReceiveReport {
        self.stats.frames_received += 1;
        let mut report = ReceiveReport::default();
        match frame_tag(&frame) {
            Some(ID_BATCH) => match batch::split_batch(frame) {
                Ok(messages) => {
                    for message in messages {
                        self.dispatch(message, &mut report);
                    }
                }
                Err(e) => self.drop_frame(e, &mut report),
            },
            Some(ID_BANDWIDTH) => match bandwidth::decode_advert(frame) {
                Ok(advertised) => {
                    self.bandwidth.set_peer(advertised);
                    tracing::debug!(
                        conn = %self.conn.label(),
                        advertised,
                        effective = self.bandwidth.effective(),
                        "bandwidth: peer advertised"
                    );
                }
                Err(e) => self.drop_frame(e, &mut report),
            },
            _ => self.dispatch(frame, &mut report),
        }
        report
    }

    fn dispatch(&mut self, message: Bytes, report: &mut ReceiveReport) {
        let head = message.slice(..message.len().min(LOG_HEAD_BYTES));
        match self.conn.receive(message) {
            Ok(delivery) => {
                match &delivery {
                    Delivery::Registered { .. } => self.stats.paths_registered += 1,
                    Delivery::Dispatched { .. } => self.stats.messages_delivered += 1,
                    Delivery::MissingKeys { .. } => self.stats.messages_missing += 1,
                }
                report.deliveries.push(delivery);
            }
            Err(e) => {
                self.stats.messages_dropped += 1;
                tracing::warn!(
                    conn = %self.conn.label(),
                    kind = ?e.kind(),
                    error = %e,
                    head = %hex::encode(&head),
                    "session: dropped message"
                );
                report.errors.push(e.into());
            }
        }
    }

    fn drop_frame(&mut self, error: SessionError, report: &mut ReceiveReport) {
        self.stats.messages_dropped += 1;
        tracing::warn!(conn = %self.conn.label(), error = %error, "session: dropped frame");
        report.errors.push(error);
    }

    fn collect(&mut self) -> Result<()> {
        let mut outbox = self.conn.drain_outbound().into_iter();
        while let Some(outbound) = outbox.next() {
            self.stats.messages_sent += 1;
            let written = self
                .batcher
                .push(outbound)
                .and_then(|frames| self.write_all(frames));
            if let Err(e) = written {
                let discarded = outbox.len();
                self.stats.messages_discarded += discarded as u64;
                tracing::warn!(
                    conn = %self.conn.label(),
                    discarded,
                    error = %e,
                    "session: send failed, outbound discarded"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    fn write_all(&mut self, frames: Vec<Bytes>) -> Result<()> {
        let mut frames = frames.into_iter();
        while let Some(frame) = frames.next() {
            if let Err(e) = self.write(frame) {
                self.stats.frames_discarded += frames.len() as u64;
                return Err(e);
            }
        }
        Ok(())
    }

    fn write(&mut self, frame: Bytes) -> Result<()> {
        let len = frame.len() as u64;
        if let Err(e) = self.transport.send_raw(frame) {
            self.stats.frames_discarded += 1;
            return Err(e.into());
        }
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += len;
        self.tick_bytes += len;
        Ok(())
    }
}

fn frame_tag(frame: &[u8]) -> Option<u32> {
    let head: [u8; 4] = frame.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(head))
}
