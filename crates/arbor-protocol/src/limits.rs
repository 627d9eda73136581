//! Protocol revisions -- versioned limits both peers must agree on.
//!
//! The endpoint tree is compiled into both peers; the revision pins the
//! numeric limits that interpret it. Frame size, tick cadence and bandwidth
//! values are defaults only: sessions may override them locally.

/// A protocol revision: a named, versioned set of wire limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolRevision {
    /// Revision identifier. Monotonically increasing.
    pub id: u16,

    // -- Id space --
    /// Wire ids below this value are reserved for internal frames.
    pub reserved_ids: u32,
    /// Largest id a peer may announce. Bounds incoming table growth.
    pub max_incoming_id: u32,

    // -- Names --
    /// Maximum UTF-8 length of one node name.
    pub max_name_bytes: usize,
    /// Maximum number of nodes in one path (announce depth).
    pub max_path_depth: usize,

    // -- Payloads --
    /// Default string limit for endpoint payloads.
    pub max_string_bytes: usize,
    /// Largest transport write a batch may grow to.
    pub max_frame_bytes: usize,

    // -- Cadence --
    /// Flush interval in milliseconds.
    pub tick_interval_ms: u64,

    // -- Bandwidth (bytes per second) --
    /// Lower bound for the negotiated send budget.
    pub bandwidth_floor: u32,
    /// Local cap used when a session is not configured otherwise.
    pub bandwidth_default_cap: u32,

    // -- Caches --
    /// Entries a cache may hold per connection before refusing new values.
    pub max_cache_entries: u32,
}

impl ProtocolRevision {
    /// Flushes per second at the default cadence.
    pub const fn ticks_per_second(&self) -> u64 {
        1000 / self.tick_interval_ms
    }
}

/// Revision 0: initial limits.
pub const REVISION_0: ProtocolRevision = ProtocolRevision {
    id: 0,

    // Id space: announce, batch, bandwidth
    reserved_ids: 3,
    max_incoming_id: 1 << 20,

    // Names
    max_name_bytes: 64,
    max_path_depth: 32,

    // Payloads
    max_string_bytes: arbor_codec::MAX_STRING_BYTES,
    max_frame_bytes: 32 * 1024,

    // Cadence: 20 ticks per second
    tick_interval_ms: 50,

    // Bandwidth
    bandwidth_floor: 8 * 1024,
    bandwidth_default_cap: 1024 * 1024,

    // Caches
    max_cache_entries: 1 << 16,
};

/// The revision in use.
pub const CURRENT_REVISION: &ProtocolRevision = &REVISION_0;
