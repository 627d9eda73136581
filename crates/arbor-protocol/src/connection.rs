//! Connection -- one peer link's id tables, caches and outbound queue.
//!
//! A connection is not shared between threads: the owner drives sends,
//! receives and draining from one place. Encoded messages are queued as
//! [`Outbound`] entries for the batching layer to flush.

use std::collections::VecDeque;
use std::sync::Arc;

use arbor_codec::{BitDecoder, BitEncoder};
use bytes::Bytes;

use crate::builder::EndpointRef;
use crate::cache::CacheStore;
use crate::context::{unit, Direction, MessageContext, MissingKeys, Value};
use crate::dynamic::{self, DynamicLink, ErasedLink};
use crate::ids::IdTables;
use crate::path::{Path, ResolvedPath};
use crate::tree::{NodeIndex, Tree};
use crate::{ProtocolError, Result, ID_ANNOUNCE, TAG_BYTES};

/// Initial buffer size for messages whose length is not known up front.
const DEFAULT_MESSAGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Queued until the next flush.
    #[default]
    Normal,
    /// Flushes the queue as soon as it is enqueued.
    Urgent,
}

/// One encoded message waiting for the batching layer.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub bytes: Bytes,
    pub priority: Priority,
}

/// Outcome of [`Connection::receive`] for a message that decoded cleanly.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// An announce bound `id` to `path`.
    Registered { id: u32, path: String },
    /// The endpoint decoder ran.
    Dispatched { id: u32, path: String },
    /// A key did not resolve; the missing-keys handler ran instead.
    MissingKeys {
        id: u32,
        path: String,
        missing: MissingKeys,
    },
}

pub struct Connection {
    tree: Arc<Tree>,
    ids: IdTables,
    caches: CacheStore,
    attachment: Option<Value>,
    outbox: VecDeque<Outbound>,
    label: String,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("ids", &self.ids)
            .field("outbox", &self.outbox.len())
            .finish()
    }
}

impl Connection {
    pub fn new(tree: Arc<Tree>, label: impl Into<String>) -> Self {
        let max_id = tree.revision().max_incoming_id;
        Self {
            tree,
            ids: IdTables::new(max_id),
            caches: CacheStore::default(),
            attachment: None,
            outbox: VecDeque::new(),
            label: label.into(),
        }
    }

    /// Attaches a value typed groups read their context from.
    pub fn with_attachment<A: Send + Sync + 'static>(mut self, attachment: A) -> Self {
        self.attachment = Some(Arc::new(attachment));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn ids(&self) -> &IdTables {
        &self.ids
    }

    pub fn caches(&self) -> &CacheStore {
        &self.caches
    }

    pub fn caches_mut(&mut self) -> &mut CacheStore {
        &mut self.caches
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Takes every queued message, oldest first.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        self.outbox.drain(..).collect()
    }

    pub fn send<C, F>(&mut self, endpoint: &EndpointRef<C>, value: C, payload: F) -> Result<()>
    where
        C: Send + Sync + 'static,
        F: FnOnce(&mut BitEncoder, &MessageContext<'_>) -> Result<()>,
    {
        self.send_with_priority(endpoint, value, Priority::Normal, payload)
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
        F: FnOnce(&mut BitEncoder, &MessageContext<'_>) -> Result<()>,
    {
        self.send_erased(endpoint.index, Arc::new(value), None, priority, payload)
    }

    /// Sends through the owner chain named by `link` for the Dynamic node it
    /// targets, instead of asking that node's resolver.
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
        F: FnOnce(&mut BitEncoder, &MessageContext<'_>) -> Result<()>,
    {
        let link = link.into_erased();
        self.send_erased(endpoint.index, Arc::new(value), Some(link), priority, payload)
    }

    /// Sends a message with no payload.
    pub fn signal<C>(&mut self, endpoint: &EndpointRef<C>, value: C) -> Result<()>
    where
        C: Send + Sync + 'static,
    {
        self.send(endpoint, value, |_, _| Ok(()))
    }

    fn send_erased<F>(
        &mut self,
        endpoint: NodeIndex,
        value: Value,
        link: Option<ErasedLink>,
        priority: Priority,
        payload: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut BitEncoder, &MessageContext<'_>) -> Result<()>,
    {
        let tree = Arc::clone(&self.tree);
        if !tree.is_endpoint(endpoint) {
            return Err(ProtocolError::NotAnEndpoint(tree.name(endpoint).to_string()));
        }
        let resolution = dynamic::resolve(&tree, endpoint, value, link.as_ref())?;
        let path = Path::new(&resolution.nodes);
        let known = self.ids.outgoing(&path);
        let id = match known {
            Some(id) => id,
            None => self.ids.peek_next()?,
        };

        let capacity = tree
            .path_length(&resolution.nodes)
            .fixed()
            .map_or(DEFAULT_MESSAGE_CAPACITY, |n| n + TAG_BYTES);
        let mut enc = BitEncoder::with_capacity(capacity);
        enc.write_u32(id);
        for (key, key_value) in resolution.keys.iter().zip(&resolution.values) {
            if let Some(ops) = tree.node(*key)?.kind.context_ops() {
                ops.write(&mut enc, key_value)?;
            }
        }
        let ctx = MessageContext {
            direction: Direction::Write,
            tree: &tree,
            id,
            nodes: &resolution.nodes,
            keys: &resolution.keys,
            values: resolution.values.iter().cloned().map(Some).collect(),
            caches: &mut self.caches,
            attachment: self.attachment.as_ref(),
        };
        payload(&mut enc, &ctx)?;

        if known.is_none() {
            let announce = encode_announce(&tree, id, &resolution.nodes)?;
            self.ids.commit(path, id);
            tracing::debug!(
                conn = %self.label,
                id,
                path = %tree.dotted(&resolution.nodes),
                "ids: path allocated"
            );
            self.outbox.push_back(Outbound {
                bytes: announce,
                priority,
            });
        }
        tracing::trace!(conn = %self.label, id, bytes = enc.len(), "conn: message queued");
        self.outbox.push_back(Outbound {
            bytes: enc.freeze(),
            priority,
        });
        Ok(())
    }

    /// Decodes and dispatches one message. Errors leave the connection
    /// usable; the message is dropped.
    pub fn receive(&mut self, bytes: Bytes) -> Result<Delivery> {
        let tree = Arc::clone(&self.tree);
        let mut dec = BitDecoder::new(bytes);
        let id = dec.read_u32()?;
        if id == ID_ANNOUNCE {
            return self.receive_announce(&tree, dec);
        }

        let resolved = self.ids.incoming(id)?;
        let endpoint_index = resolved.path.endpoint().ok_or(ProtocolError::UnknownId(id))?;
        let endpoint = tree
            .node(endpoint_index)?
            .kind
            .endpoint()
            .ok_or_else(|| ProtocolError::NotAnEndpoint(resolved.dotted.clone()))?;

        let mut values: Vec<Option<Value>> = Vec::with_capacity(resolved.keys.len());
        let mut current = unit();
        let mut missing_at = None;
        for (position, key) in resolved.keys.iter().enumerate() {
            let Some(ops) = tree.node(*key)?.kind.context_ops() else {
                continue;
            };
            match ops.read(&mut dec, &current, self.attachment.as_ref())? {
                Some(value) => {
                    current = Arc::clone(&value);
                    values.push(Some(value));
                }
                None => {
                    missing_at = Some(position);
                    break;
                }
            }
        }

        let mut ctx = MessageContext {
            direction: Direction::Read,
            tree: &tree,
            id,
            nodes: resolved.path.nodes(),
            keys: &resolved.keys,
            values,
            caches: &mut self.caches,
            attachment: self.attachment.as_ref(),
        };

        if let Some(position) = missing_at {
            let keys: Vec<NodeIndex> = resolved.keys.iter().skip(position).copied().collect();
            let names = keys.iter().map(|k| tree.name(*k).to_string()).collect();
            let missing = MissingKeys { keys, names };
            match &endpoint.on_missing {
                Some(handler) => handler(&missing, &ctx)?,
                None => tracing::debug!(
                    conn = %self.label,
                    path = %resolved.dotted,
                    key = missing.first().unwrap_or(""),
                    "conn: missing key ignored"
                ),
            }
            return Ok(Delivery::MissingKeys {
                id,
                path: resolved.dotted.clone(),
                missing,
            });
        }

        (endpoint.decode)(&current, &mut dec, &mut ctx)?;
        if dec.has_remaining() {
            return Err(ProtocolError::TrailingBytes {
                path: resolved.dotted.clone(),
                remaining: dec.remaining(),
            });
        }
        tracing::trace!(conn = %self.label, id, path = %resolved.dotted, "conn: dispatched");
        Ok(Delivery::Dispatched {
            id,
            path: resolved.dotted.clone(),
        })
    }

    fn receive_announce(&mut self, tree: &Tree, mut dec: BitDecoder) -> Result<Delivery> {
        let revision = tree.revision();
        let id = dec.read_var_u32()?;
        let depth = dec.read_var_u32()? as usize;
        if depth > revision.max_path_depth {
            return Err(ProtocolError::PathTooDeep {
                depth,
                max: revision.max_path_depth,
            });
        }
        let mut names = Vec::with_capacity(depth);
        for _ in 0..depth {
            names.push(dec.read_str(revision.max_name_bytes)?);
        }
        if dec.has_remaining() {
            return Err(ProtocolError::TrailingBytes {
                path: names.join("."),
                remaining: dec.remaining(),
            });
        }
        let resolved = ResolvedPath::from_names(tree, &names)?;
        let resolved = self.ids.register(id, resolved)?;
        tracing::debug!(conn = %self.label, id, path = %resolved.dotted, "ids: path registered");
        Ok(Delivery::Registered {
            id,
            path: resolved.dotted.clone(),
        })
    }
}

fn encode_announce(tree: &Tree, id: u32, nodes: &[NodeIndex]) -> Result<Bytes> {
    let max_name = tree.revision().max_name_bytes;
    let mut enc = BitEncoder::new();
    enc.write_u32(ID_ANNOUNCE);
    enc.write_var_u32(id);
    enc.write_var_u32(nodes.len() as u32);
    for node in nodes {
        enc.write_str(tree.name(*node), max_name)?;
    }
    Ok(enc.freeze())
}
