//! Bandwidth negotiation -- advertised send budgets.
//!
//! Each side advertises its local cap once per session in a
//! `u32 ID_BANDWIDTH | var-u32 bytes_per_second` frame. The effective
//! budget is the smaller of the two caps, never below the floor. The budget
//! is advisory: ticks that exceed it are counted and logged, not throttled.

use arbor_codec::{BitDecoder, BitEncoder};
use arbor_protocol::{ID_BANDWIDTH, TAG_BYTES};
use bytes::Bytes;

use crate::config::BandwidthSection;
use crate::{Result, SessionError};

#[derive(Debug, Clone)]
pub struct Bandwidth {
    local_cap: u32,
    floor: u32,
    peer: Option<u32>,
}

impl Bandwidth {
    pub fn new(config: &BandwidthSection) -> Self {
        Self {
            local_cap: config.local_cap,
            floor: config.floor,
            peer: None,
        }
    }

    pub fn local_cap(&self) -> u32 {
        self.local_cap
    }

    /// The last value the peer advertised.
    pub fn peer(&self) -> Option<u32> {
        self.peer
    }

    pub fn set_peer(&mut self, advertised: u32) {
        self.peer = Some(advertised);
    }

    /// Bytes per second this side should stay under.
    pub fn effective(&self) -> u32 {
        let cap = match self.peer {
            Some(peer) => self.local_cap.min(peer),
            None => self.local_cap,
        };
        cap.max(self.floor)
    }

    /// The budget for one tick of `tick_interval_ms`.
    pub fn per_tick(&self, tick_interval_ms: u64) -> u64 {
        u64::from(self.effective()) * tick_interval_ms / 1000
    }

    pub fn advertisement(&self) -> Bytes {
        encode_advert(self.local_cap)
    }
}

pub fn encode_advert(bytes_per_second: u32) -> Bytes {
    let mut enc = BitEncoder::with_capacity(TAG_BYTES + arbor_codec::MAX_VAR32_BYTES);
    enc.write_u32(ID_BANDWIDTH);
    enc.write_var_u32(bytes_per_second);
    enc.freeze()
}

pub fn decode_advert(frame: Bytes) -> Result<u32> {
    let mut dec = BitDecoder::new(frame);
    let tag = dec.read_u32()?;
    if tag != ID_BANDWIDTH {
        return Err(SessionError::UnexpectedFrame(tag));
    }
    let value = dec.read_var_u32()?;
    if dec.has_remaining() {
        return Err(SessionError::TrailingBytes(dec.remaining()));
    }
    Ok(value)
}
