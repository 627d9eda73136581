//! Context values -- the typed data Key ancestors hand to their endpoints.
//!
//! Sending starts from the endpoint's context value and derives every
//! ancestor's value bottom-up, then writes them top-down. Receiving reads
//! them top-down, each key given its parent's value. Values travel through
//! the tree type-erased as [`Value`].

use std::any::{type_name, Any};
use std::marker::PhantomData;
use std::sync::Arc;

use arbor_codec::{BitDecoder, BitEncoder};

use crate::builder::Parent;
use crate::cache::CacheStore;
use crate::tree::{LengthHint, NodeIndex, NodeKind, Tree};
use crate::{ProtocolError, Result};

/// A type-erased context value.
pub type Value = Arc<dyn Any + Send + Sync>;

pub(crate) fn unit() -> Value {
    Arc::new(())
}

pub(crate) fn downcast<T: 'static>(value: &Value) -> Result<&T> {
    (**value)
        .downcast_ref::<T>()
        .ok_or(ProtocolError::ValueType {
            expected: type_name::<T>(),
        })
}

/// Serialises a context value of type `T` whose parent context is `P`.
///
/// On write the key derives its parent's value from its own, then encodes
/// itself. On read it decodes itself given the parent's value; `Ok(None)`
/// means the referenced object no longer exists on this side.
pub trait ContextKey<P, T>: Send + Sync + 'static {
    fn length(&self) -> LengthHint {
        LengthHint::Dynamic
    }

    fn parent_of(&self, value: &T) -> P;

    fn write(&self, enc: &mut BitEncoder, value: &T) -> Result<()>;

    fn read(&self, dec: &mut BitDecoder, parent: &P) -> Result<Option<T>>;
}

pub(crate) trait ContextOps: Send + Sync {
    fn length(&self) -> LengthHint;

    fn to_parent(&self, value: &Value) -> Result<Value>;

    fn write(&self, enc: &mut BitEncoder, value: &Value) -> Result<()>;

    fn read(
        &self,
        dec: &mut BitDecoder,
        parent: &Value,
        attachment: Option<&Value>,
    ) -> Result<Option<Value>>;
}

// ============================================================================
// Adapters
// ============================================================================

pub(crate) struct KeyOps<K, P, T> {
    key: K,
    _marker: PhantomData<fn(P) -> T>,
}

impl<K, P, T> KeyOps<K, P, T> {
    pub(crate) fn new(key: K) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }
}

impl<K, P, T> ContextOps for KeyOps<K, P, T>
where
    K: ContextKey<P, T>,
    P: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn length(&self) -> LengthHint {
        self.key.length()
    }

    fn to_parent(&self, value: &Value) -> Result<Value> {
        Ok(Arc::new(self.key.parent_of(downcast::<T>(value)?)))
    }

    fn write(&self, enc: &mut BitEncoder, value: &Value) -> Result<()> {
        self.key.write(enc, downcast::<T>(value)?)
    }

    fn read(
        &self,
        dec: &mut BitDecoder,
        parent: &Value,
        _attachment: Option<&Value>,
    ) -> Result<Option<Value>> {
        let parent = downcast::<P>(parent)?;
        Ok(self.key.read(dec, parent)?.map(|v| Arc::new(v) as Value))
    }
}

/// Converts between context types with `Into` / `TryInto`. Writes no bytes.
pub(crate) struct CastOps<P, C>(PhantomData<fn(P) -> C>);

impl<P, C> CastOps<P, C> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P, C> ContextOps for CastOps<P, C>
where
    P: Clone + TryInto<C> + Send + Sync + 'static,
    C: Clone + Into<P> + Send + Sync + 'static,
{
    fn length(&self) -> LengthHint {
        LengthHint::Fixed(0)
    }

    fn to_parent(&self, value: &Value) -> Result<Value> {
        let parent: P = downcast::<C>(value)?.clone().into();
        Ok(Arc::new(parent))
    }

    fn write(&self, _enc: &mut BitEncoder, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn read(
        &self,
        _dec: &mut BitDecoder,
        parent: &Value,
        _attachment: Option<&Value>,
    ) -> Result<Option<Value>> {
        let parent = downcast::<P>(parent)?.clone();
        Ok(parent.try_into().ok().map(|c: C| Arc::new(c) as Value))
    }
}

/// Pulls a child value out of the parent (`extract`) and lifts it back
/// (`lift`). Writes no bytes.
pub(crate) struct ExtractorOps<P, C, E, L> {
    extract: E,
    lift: L,
    _marker: PhantomData<fn(P) -> C>,
}

impl<P, C, E, L> ExtractorOps<P, C, E, L> {
    pub(crate) fn new(extract: E, lift: L) -> Self {
        Self {
            extract,
            lift,
            _marker: PhantomData,
        }
    }
}

impl<P, C, E, L> ContextOps for ExtractorOps<P, C, E, L>
where
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
    E: Fn(&P) -> Option<C> + Send + Sync,
    L: Fn(&C) -> P + Send + Sync,
{
    fn length(&self) -> LengthHint {
        LengthHint::Fixed(0)
    }

    fn to_parent(&self, value: &Value) -> Result<Value> {
        Ok(Arc::new((self.lift)(downcast::<C>(value)?)))
    }

    fn write(&self, _enc: &mut BitEncoder, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn read(
        &self,
        _dec: &mut BitDecoder,
        parent: &Value,
        _attachment: Option<&Value>,
    ) -> Result<Option<Value>> {
        let parent = downcast::<P>(parent)?;
        Ok((self.extract)(parent).map(|c| Arc::new(c) as Value))
    }
}

/// Supplies its value from the connection attachment. Writes no bytes.
pub(crate) struct AttachmentOps<A, C, F> {
    supply: F,
    _marker: PhantomData<fn(A) -> C>,
}

impl<A, C, F> AttachmentOps<A, C, F> {
    pub(crate) fn new(supply: F) -> Self {
        Self {
            supply,
            _marker: PhantomData,
        }
    }
}

impl<A, C, F> ContextOps for AttachmentOps<A, C, F>
where
    A: Send + Sync + 'static,
    C: Send + Sync + 'static,
    F: Fn(&A) -> Option<C> + Send + Sync,
{
    fn length(&self) -> LengthHint {
        LengthHint::Fixed(0)
    }

    fn to_parent(&self, _value: &Value) -> Result<Value> {
        Ok(unit())
    }

    fn write(&self, _enc: &mut BitEncoder, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn read(
        &self,
        _dec: &mut BitDecoder,
        _parent: &Value,
        attachment: Option<&Value>,
    ) -> Result<Option<Value>> {
        let Some(attachment) = attachment.and_then(|a| (**a).downcast_ref::<A>()) else {
            return Ok(None);
        };
        Ok((self.supply)(attachment).map(|c| Arc::new(c) as Value))
    }
}

/// Reads a Dynamic node's value from the linked parent. On write the parent
/// comes from the [`DynamicLink`](crate::DynamicLink), never from the value.
pub(crate) struct LinkOps<P, C, F> {
    name: String,
    child_of: F,
    _marker: PhantomData<fn(P) -> C>,
}

impl<P, C, F> LinkOps<P, C, F> {
    pub(crate) fn new(name: &str, child_of: F) -> Self {
        Self {
            name: name.to_string(),
            child_of,
            _marker: PhantomData,
        }
    }
}

impl<P, C, F> ContextOps for LinkOps<P, C, F>
where
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
    F: Fn(&P) -> Option<C> + Send + Sync,
{
    fn length(&self) -> LengthHint {
        LengthHint::Fixed(0)
    }

    fn to_parent(&self, _value: &Value) -> Result<Value> {
        Err(ProtocolError::UnresolvedDynamic(self.name.clone()))
    }

    fn write(&self, _enc: &mut BitEncoder, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn read(
        &self,
        _dec: &mut BitDecoder,
        parent: &Value,
        _attachment: Option<&Value>,
    ) -> Result<Option<Value>> {
        let parent = downcast::<P>(parent)?;
        Ok((self.child_of)(parent).map(|c| Arc::new(c) as Value))
    }
}

// ============================================================================
// Message context
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Keys that failed to resolve on receipt: the first absent key and every
/// key below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingKeys {
    pub keys: Vec<NodeIndex>,
    pub names: Vec<String>,
}

impl MissingKeys {
    pub fn contains<T>(&self, handle: Parent<T>) -> bool {
        self.keys.contains(&handle.index)
    }

    pub fn first(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }
}

/// Per-message view of the resolved path and its key values.
pub struct MessageContext<'a> {
    pub(crate) direction: Direction,
    pub(crate) tree: &'a Tree,
    pub(crate) id: u32,
    pub(crate) nodes: &'a [NodeIndex],
    pub(crate) keys: &'a [NodeIndex],
    pub(crate) values: Vec<Option<Value>>,
    pub(crate) caches: &'a mut CacheStore,
    pub(crate) attachment: Option<&'a Value>,
}

impl<'a> MessageContext<'a> {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Wire id of the path this message travels on.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn tree(&self) -> &Tree {
        self.tree
    }

    /// The endpoint node.
    pub fn node(&self) -> NodeIndex {
        self.nodes.last().copied().unwrap_or(NodeIndex::ROOT)
    }

    pub fn path_name(&self) -> String {
        self.tree.dotted(self.nodes)
    }

    /// Value of the ancestor `handle` in this message. A handle to a Dynamic
    /// node finds the link the message was routed through.
    pub fn get<T: 'static>(&self, handle: Parent<T>) -> Option<&T> {
        let position = self.keys.iter().position(|k| *k == handle.index).or_else(|| {
            self.keys.iter().position(|k| {
                self.tree.node(*k).is_ok_and(
                    |n| matches!(n.kind, NodeKind::Link { target, .. } if target == handle.index),
                )
            })
        })?;
        let value = self.values.get(position)?.as_ref()?;
        (**value).downcast_ref::<T>()
    }

    /// The nearest resolved value above the payload, i.e. the endpoint's own
    /// context value.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        let value = self.values.iter().rev().find_map(Option::as_ref)?;
        (**value).downcast_ref::<T>()
    }

    pub fn attachment<A: 'static>(&self) -> Option<&A> {
        self.attachment.and_then(|a| (**a).downcast_ref::<A>())
    }

    pub fn caches(&self) -> &CacheStore {
        &*self.caches
    }

    pub fn caches_mut(&mut self) -> &mut CacheStore {
        &mut *self.caches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct Slot;

    impl ContextKey<u32, (u32, u8)> for Slot {
        fn length(&self) -> LengthHint {
            LengthHint::Fixed(1)
        }

        fn parent_of(&self, value: &(u32, u8)) -> u32 {
            value.0
        }

        fn write(&self, enc: &mut BitEncoder, value: &(u32, u8)) -> Result<()> {
            enc.write_u8(value.1);
            Ok(())
        }

        fn read(&self, dec: &mut BitDecoder, parent: &u32) -> Result<Option<(u32, u8)>> {
            let slot = dec.read_u8()?;
            Ok((slot < 9).then_some((*parent, slot)))
        }
    }

    #[test]
    fn test_key_ops_roundtrip() {
        let ops = KeyOps::new(Slot);
        let value: Value = Arc::new((7u32, 3u8));

        let parent = ops.to_parent(&value).unwrap();
        assert_eq!(downcast::<u32>(&parent).unwrap(), &7);

        let mut enc = BitEncoder::new();
        ops.write(&mut enc, &value).unwrap();
        let mut dec = BitDecoder::new(enc.freeze());
        let read = ops.read(&mut dec, &parent, None).unwrap().unwrap();
        assert_eq!(downcast::<(u32, u8)>(&read).unwrap(), &(7, 3));

        let mut dec = BitDecoder::new(Bytes::from_static(&[12]));
        assert!(ops.read(&mut dec, &parent, None).unwrap().is_none());
    }

    #[test]
    fn test_wrong_value_type_is_misuse() {
        let ops = KeyOps::new(Slot);
        let err = ops.to_parent(&unit()).unwrap_err();
        assert!(matches!(err, ProtocolError::ValueType { .. }));
        assert_eq!(err.kind(), crate::ErrorKind::Misuse);
    }

    #[test]
    fn test_cast_ops() {
        let ops = CastOps::<u64, u32>::new();
        let up = ops.to_parent(&(Arc::new(5u32) as Value)).unwrap();
        assert_eq!(downcast::<u64>(&up).unwrap(), &5);

        let mut dec = BitDecoder::new(Bytes::new());
        let fits = ops.read(&mut dec, &(Arc::new(9u64) as Value), None).unwrap();
        assert_eq!(downcast::<u32>(&fits.unwrap()).unwrap(), &9);
        let too_big = ops
            .read(&mut dec, &(Arc::new(u64::MAX) as Value), None)
            .unwrap();
        assert!(too_big.is_none());
    }

    #[test]
    fn test_attachment_ops() {
        let ops = AttachmentOps::new(|name: &String| Some(name.len()));
        let mut dec = BitDecoder::new(Bytes::new());
        assert!(ops.read(&mut dec, &unit(), None).unwrap().is_none());

        let attachment: Value = Arc::new("steve".to_string());
        let read = ops.read(&mut dec, &unit(), Some(&attachment)).unwrap();
        assert_eq!(downcast::<usize>(&read.unwrap()).unwrap(), &5);
    }
}
