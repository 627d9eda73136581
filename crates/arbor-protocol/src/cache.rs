//! Object caches -- per-connection value-to-id registries.
//!
//! The sender assigns ids locally and queues a `cache.<name>` put message
//! carrying the id and the serialised value. Because the put travels on the
//! same ordered queue as the messages that use the id, the receiver always
//! learns an id before it is referenced. Tables grow until `max_entries`
//! and are dropped with their connection.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use arbor_codec::{BitDecoder, BitEncoder};

use crate::builder::{EndpointRef, TreeBuilder};
use crate::connection::Connection;
use crate::context::MessageContext;
use crate::tree::{LengthHint, NodeIndex, NodeKind};
use crate::{ProtocolError, Result};

/// Decides when two values share a cache id, by projecting each value to a
/// hashable key.
pub trait Equivalence<T>: Send + Sync + 'static {
    type Key: Hash + Eq + Send + Sync + 'static;

    fn key(&self, value: &T) -> Self::Key;
}

/// Values are their own key (`Hash` + `Eq`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalEquivalence;

impl<T> Equivalence<T> for NaturalEquivalence
where
    T: Clone + Hash + Eq + Send + Sync + 'static,
{
    type Key = T;

    fn key(&self, value: &T) -> T {
        value.clone()
    }
}

/// Values are equal when `project` maps them to the same key.
pub struct KeyEquivalence<F, K> {
    project: F,
    _marker: PhantomData<fn() -> K>,
}

impl<F, K> KeyEquivalence<F, K> {
    pub fn new(project: F) -> Self {
        Self {
            project,
            _marker: PhantomData,
        }
    }
}

impl<T, F, K> Equivalence<T> for KeyEquivalence<F, K>
where
    F: Fn(&T) -> K + Send + Sync + 'static,
    K: Hash + Eq + Send + Sync + 'static,
{
    type Key = K;

    fn key(&self, value: &T) -> K {
        (self.project)(value)
    }
}

/// One cache's tables on one connection.
pub(crate) struct CacheTable<T, K> {
    outgoing: HashMap<K, u32>,
    incoming: HashMap<u32, Arc<T>>,
    next_id: u32,
}

impl<T, K> Default for CacheTable<T, K> {
    fn default() -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            next_id: 0,
        }
    }
}

/// All cache tables of one connection, by cache slot.
#[derive(Default)]
pub struct CacheStore {
    tables: HashMap<u32, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl CacheStore {
    fn table<T, K>(&self, slot: u32) -> Option<&CacheTable<T, K>>
    where
        T: Send + Sync + 'static,
        K: Send + Sync + 'static,
    {
        self.tables.get(&slot)?.downcast_ref()
    }

    fn table_mut<T, K>(&mut self, slot: u32) -> Result<&mut CacheTable<T, K>>
    where
        T: Send + Sync + 'static,
        K: Send + Sync + 'static,
    {
        self.tables
            .entry(slot)
            .or_insert_with(|| Box::new(CacheTable::<T, K>::default()))
            .downcast_mut()
            .ok_or(ProtocolError::ValueType {
                expected: type_name::<CacheTable<T, K>>(),
            })
    }
}

type WriteFn<T> = Box<dyn Fn(&mut BitEncoder, &T) -> Result<()> + Send + Sync>;

struct CacheInner<T, E> {
    name: String,
    slot: u32,
    max_entries: u32,
    equivalence: E,
    write: WriteFn<T>,
    endpoint: EndpointRef<()>,
}

/// Handle to a cache declared on a [`TreeBuilder`]. Cheap to clone.
pub struct ObjectCache<T, E> {
    inner: Arc<CacheInner<T, E>>,
}

impl<T, E> Clone for ObjectCache<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for ObjectCache<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("name", &self.inner.name)
            .field("slot", &self.inner.slot)
            .finish()
    }
}

impl<T, E> ObjectCache<T, E>
where
    T: Send + Sync + 'static,
    E: Equivalence<T>,
{
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The put endpoint (`cache.<name>`).
    pub fn endpoint(&self) -> EndpointRef<()> {
        self.inner.endpoint
    }

    /// Id of `value` on `conn`, assigning the next id and queueing a put
    /// message when the value is new.
    pub fn get_or_assign_id(&self, conn: &mut Connection, value: &T) -> Result<u32> {
        let inner = &self.inner;
        let key = inner.equivalence.key(value);
        let table = conn.caches_mut().table_mut::<T, E::Key>(inner.slot)?;
        if let Some(id) = table.outgoing.get(&key) {
            return Ok(*id);
        }
        if table.outgoing.len() as u32 >= inner.max_entries {
            return Err(ProtocolError::CacheFull {
                cache: inner.name.clone(),
                max: inner.max_entries,
            });
        }
        let id = table.next_id;
        table.outgoing.insert(key, id);
        table.next_id += 1;

        let sent = conn.send(&inner.endpoint, (), |enc, _ctx| {
            enc.write_var_u32(id);
            (inner.write)(enc, value)
        });
        if let Err(e) = sent {
            let table = conn.caches_mut().table_mut::<T, E::Key>(inner.slot)?;
            table.outgoing.retain(|_, assigned| *assigned != id);
            table.next_id = id;
            return Err(e);
        }
        tracing::debug!(conn = %conn.label(), cache = %inner.name, id, "cache: id assigned");
        Ok(id)
    }

    /// The value the peer registered under `id`.
    pub fn resolve(&self, caches: &CacheStore, id: u32) -> Result<Arc<T>> {
        caches
            .table::<T, E::Key>(self.inner.slot)
            .and_then(|t| t.incoming.get(&id))
            .cloned()
            .ok_or_else(|| ProtocolError::CacheUnknownId {
                cache: self.inner.name.clone(),
                id,
            })
    }

    pub fn outgoing_len(&self, caches: &CacheStore) -> usize {
        caches
            .table::<T, E::Key>(self.inner.slot)
            .map_or(0, |t| t.outgoing.len())
    }

    pub fn incoming_len(&self, caches: &CacheStore) -> usize {
        caches
            .table::<T, E::Key>(self.inner.slot)
            .map_or(0, |t| t.incoming.len())
    }
}

impl TreeBuilder {
    /// Declares a cache with the revision's default capacity.
    pub fn cache<T, E, W, R>(
        &mut self,
        name: &str,
        equivalence: E,
        write: W,
        read: R,
    ) -> Result<ObjectCache<T, E>>
    where
        T: Send + Sync + 'static,
        E: Equivalence<T>,
        W: Fn(&mut BitEncoder, &T) -> Result<()> + Send + Sync + 'static,
        R: Fn(&mut BitDecoder) -> Result<T> + Send + Sync + 'static,
    {
        let max = self.revision.max_cache_entries;
        self.cache_with_capacity(name, equivalence, write, read, max)
    }

    /// Declares a cache and its `cache.<name>` put endpoint.
    pub fn cache_with_capacity<T, E, W, R>(
        &mut self,
        name: &str,
        equivalence: E,
        write: W,
        read: R,
        max_entries: u32,
    ) -> Result<ObjectCache<T, E>>
    where
        T: Send + Sync + 'static,
        E: Equivalence<T>,
        W: Fn(&mut BitEncoder, &T) -> Result<()> + Send + Sync + 'static,
        R: Fn(&mut BitDecoder) -> Result<T> + Send + Sync + 'static,
    {
        let group = match self.cache_group {
            Some(group) => group,
            None => {
                let group = self.add(
                    Some(NodeIndex::ROOT),
                    "cache",
                    LengthHint::Fixed(0),
                    NodeKind::Group,
                )?;
                self.cache_group = Some(group);
                group
            }
        };
        let slot = self.cache_slots;
        let cache_name = name.to_string();
        let decode = move |_: &(), dec: &mut BitDecoder, ctx: &mut MessageContext<'_>| {
            let id = dec.read_var_u32()?;
            if id >= max_entries {
                return Err(ProtocolError::IdOutOfRange {
                    id,
                    max: max_entries.saturating_sub(1),
                });
            }
            let value = read(dec)?;
            let table = ctx.caches_mut().table_mut::<T, E::Key>(slot)?;
            if table.incoming.contains_key(&id) {
                return Err(ProtocolError::CacheDuplicate {
                    cache: cache_name.clone(),
                    id,
                });
            }
            table.incoming.insert(id, Arc::new(value));
            tracing::trace!(cache = %cache_name, id, "cache: put received");
            Ok(())
        };
        let endpoint = self.endpoint(crate::Parent::<()>::new(group), name, decode)?;
        self.cache_slots += 1;

        Ok(ObjectCache {
            inner: Arc::new(CacheInner {
                name: name.to_string(),
                slot,
                max_entries,
                equivalence,
                write: Box::new(write),
                endpoint,
            }),
        })
    }
}
