//! Per-connection id tables.
//!
//! Outgoing ids are chosen by the sender, one per new path, counting up from
//! [`FIRST_ALLOCATED_ID`]. Incoming ids are whatever the peer announced,
//! stored by direct index. The two directions are independent.

use std::collections::HashMap;
use std::sync::Arc;

use crate::path::{Path, ResolvedPath};
use crate::{ProtocolError, Result, FIRST_ALLOCATED_ID};

#[derive(Debug)]
pub struct IdTables {
    incoming: Vec<Option<Arc<ResolvedPath>>>,
    outgoing: HashMap<Path, u32>,
    next_free_id: u32,
    max_id: u32,
}

impl IdTables {
    pub fn new(max_id: u32) -> Self {
        Self {
            incoming: Vec::new(),
            outgoing: HashMap::new(),
            next_free_id: FIRST_ALLOCATED_ID,
            max_id,
        }
    }

    pub fn outgoing(&self, path: &Path) -> Option<u32> {
        self.outgoing.get(path).copied()
    }

    /// The id the next new path will get, without claiming it.
    pub fn peek_next(&self) -> Result<u32> {
        if self.next_free_id > self.max_id {
            return Err(ProtocolError::IdsExhausted { max: self.max_id });
        }
        Ok(self.next_free_id)
    }

    /// Claims `id` (from [`peek_next`](Self::peek_next)) for `path`.
    pub fn commit(&mut self, path: Path, id: u32) {
        self.outgoing.insert(path, id);
        self.next_free_id = id + 1;
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Binds an announced id. Re-announcing the same path is accepted;
    /// re-binding an id to a different path is not.
    pub fn register(&mut self, id: u32, resolved: ResolvedPath) -> Result<Arc<ResolvedPath>> {
        if id < FIRST_ALLOCATED_ID {
            return Err(ProtocolError::ReservedId(id));
        }
        if id > self.max_id {
            return Err(ProtocolError::IdOutOfRange {
                id,
                max: self.max_id,
            });
        }
        let slot = id as usize;
        if let Some(Some(existing)) = self.incoming.get(slot) {
            if existing.path != resolved.path {
                return Err(ProtocolError::DuplicateId {
                    id,
                    existing: existing.dotted.clone(),
                });
            }
            return Ok(Arc::clone(existing));
        }
        if self.incoming.len() <= slot {
            self.incoming.resize(slot + 1, None);
        }
        let resolved = Arc::new(resolved);
        self.incoming[slot] = Some(Arc::clone(&resolved));
        Ok(resolved)
    }

    pub fn incoming(&self, id: u32) -> Result<Arc<ResolvedPath>> {
        if id < FIRST_ALLOCATED_ID {
            return Err(ProtocolError::ReservedId(id));
        }
        if id > self.max_id {
            return Err(ProtocolError::IdOutOfRange {
                id,
                max: self.max_id,
            });
        }
        self.incoming
            .get(id as usize)
            .and_then(Option::clone)
            .ok_or(ProtocolError::UnknownId(id))
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.iter().filter(|e| e.is_some()).count()
    }
}
