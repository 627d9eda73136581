//! Tree construction -- composes groups, keys and endpoints into a [`Tree`].
//!
//! Handles carry the context type their children see, so a key or endpoint
//! can only be attached below a parent whose value it knows how to use.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use arbor_codec::BitDecoder;

use crate::context::{
    downcast, AttachmentOps, CastOps, ContextKey, ContextOps, ExtractorOps, KeyOps, LinkOps,
    MessageContext, MissingKeys, Value,
};
use crate::dynamic::{DynamicLink, ErasedLink};
use crate::limits::{ProtocolRevision, CURRENT_REVISION};
use crate::tree::{EndpointDef, LengthHint, Node, NodeIndex, NodeKind, Tree};
use crate::{ProtocolError, Result};

/// A node whose children see a context value of type `C`.
pub struct Parent<C> {
    pub(crate) index: NodeIndex,
    _marker: PhantomData<fn() -> C>,
}

/// An endpoint sent with a context value of type `C`.
pub struct EndpointRef<C> {
    pub(crate) index: NodeIndex,
    _marker: PhantomData<fn() -> C>,
}

/// A candidate parent position (context `P`) for a Dynamic node of type `C`.
pub struct LinkRef<P, C> {
    pub(crate) index: NodeIndex,
    pub(crate) target: NodeIndex,
    _marker: PhantomData<fn(P) -> C>,
}

macro_rules! copy_handle {
    ($name:ident < $($param:ident),+ >) => {
        impl<$($param),+> Clone for $name<$($param),+> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<$($param),+> Copy for $name<$($param),+> {}

        impl<$($param),+> fmt::Debug for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.index)
            }
        }
    };
}

copy_handle!(Parent<C>);
copy_handle!(EndpointRef<C>);
copy_handle!(LinkRef<P, C>);

impl<C> Parent<C> {
    pub(crate) fn new(index: NodeIndex) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

impl<C> EndpointRef<C> {
    pub(crate) fn new(index: NodeIndex) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

impl<P, C> LinkRef<P, C> {
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// The Dynamic node this link is a parent position for.
    pub fn target(&self) -> Parent<C> {
        Parent::new(self.target)
    }
}

pub struct TreeBuilder {
    pub(crate) nodes: Vec<Node>,
    pub(crate) revision: &'static ProtocolRevision,
    pub(crate) cache_group: Option<NodeIndex>,
    pub(crate) cache_slots: u32,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::with_revision(CURRENT_REVISION)
    }

    pub fn with_revision(revision: &'static ProtocolRevision) -> Self {
        let root = Node {
            name: String::new(),
            parent: None,
            children: Vec::new(),
            own_length: LengthHint::Fixed(0),
            length: LengthHint::Fixed(0),
            kind: NodeKind::Root,
        };
        Self {
            nodes: vec![root],
            revision,
            cache_group: None,
            cache_slots: 0,
        }
    }

    pub fn root(&self) -> Parent<()> {
        Parent::new(NodeIndex::ROOT)
    }

    /// A plain grouping node. Children see the parent's context unchanged.
    pub fn group<C>(&mut self, parent: Parent<C>, name: &str) -> Result<Parent<C>> {
        let index = self.add(Some(parent.index), name, LengthHint::Fixed(0), NodeKind::Group)?;
        Ok(Parent::new(index))
    }

    /// A key: encodes a `T` below a parent of context `P`.
    pub fn key<P, T, K>(&mut self, parent: Parent<P>, name: &str, key: K) -> Result<Parent<T>>
    where
        P: Send + Sync + 'static,
        T: Send + Sync + 'static,
        K: ContextKey<P, T>,
    {
        let length = key.length();
        let ops: Box<dyn ContextOps> = Box::new(KeyOps::new(key));
        let index = self.add(Some(parent.index), name, length, NodeKind::Key(ops))?;
        Ok(Parent::new(index))
    }

    /// A top-level group whose value comes from the connection attachment of
    /// type `A`. Writes no bytes.
    pub fn typed_group<A, C, F>(&mut self, name: &str, supply: F) -> Result<Parent<C>>
    where
        A: Send + Sync + 'static,
        C: Send + Sync + 'static,
        F: Fn(&A) -> Option<C> + Send + Sync + 'static,
    {
        let ops: Box<dyn ContextOps> = Box::new(AttachmentOps::new(supply));
        let index = self.add(
            Some(NodeIndex::ROOT),
            name,
            LengthHint::Fixed(0),
            NodeKind::TypedGroup(ops),
        )?;
        Ok(Parent::new(index))
    }

    /// Narrows (`TryInto`) or widens (`Into`) the parent context. Writes no
    /// bytes.
    pub fn cast<P, C>(&mut self, parent: Parent<P>, name: &str) -> Result<Parent<C>>
    where
        P: Clone + TryInto<C> + Send + Sync + 'static,
        C: Clone + Into<P> + Send + Sync + 'static,
    {
        let ops: Box<dyn ContextOps> = Box::new(CastOps::<P, C>::new());
        let index = self.add(Some(parent.index), name, LengthHint::Fixed(0), NodeKind::Cast(ops))?;
        Ok(Parent::new(index))
    }

    /// Derives a child context with `extract`; `lift` maps it back on send.
    pub fn extractor<P, C, E, L>(
        &mut self,
        parent: Parent<P>,
        name: &str,
        extract: E,
        lift: L,
    ) -> Result<Parent<C>>
    where
        P: Send + Sync + 'static,
        C: Send + Sync + 'static,
        E: Fn(&P) -> Option<C> + Send + Sync + 'static,
        L: Fn(&C) -> P + Send + Sync + 'static,
    {
        let ops: Box<dyn ContextOps> = Box::new(ExtractorOps::new(extract, lift));
        let index = self.add(
            Some(parent.index),
            name,
            LengthHint::Fixed(0),
            NodeKind::Extractor(ops),
        )?;
        Ok(Parent::new(index))
    }

    /// A subtree typed by its child value only. Its parent is picked per send
    /// from the links declared with [`link`](Self::link), either explicitly
    /// or through a resolver installed with
    /// [`dynamic_resolved`](Self::dynamic_resolved).
    pub fn dynamic<C>(&mut self, name: &str) -> Result<Parent<C>>
    where
        C: Send + Sync + 'static,
    {
        let index = self.add(None, name, LengthHint::Fixed(0), NodeKind::Dynamic { resolve: None })?;
        Ok(Parent::new(index))
    }

    /// Like [`dynamic`](Self::dynamic), with a resolver that picks the link
    /// from the value being sent.
    pub fn dynamic_resolved<C, F>(&mut self, name: &str, resolve: F) -> Result<Parent<C>>
    where
        C: Send + Sync + 'static,
        F: Fn(&C) -> Option<DynamicLink<C>> + Send + Sync + 'static,
    {
        let erased = move |value: &Value| -> Result<Option<ErasedLink>> {
            Ok(resolve(downcast::<C>(value)?).map(DynamicLink::into_erased))
        };
        let index = self.add(
            None,
            name,
            LengthHint::Fixed(0),
            NodeKind::Dynamic {
                resolve: Some(Box::new(erased)),
            },
        )?;
        Ok(Parent::new(index))
    }

    /// Declares `parent` as a possible owner of the Dynamic node `target`.
    /// On receipt `child_of` finds the dynamic value inside the parent.
    pub fn link<P, C, F>(
        &mut self,
        parent: Parent<P>,
        target: Parent<C>,
        name: &str,
        child_of: F,
    ) -> Result<LinkRef<P, C>>
    where
        P: Send + Sync + 'static,
        C: Send + Sync + 'static,
        F: Fn(&P) -> Option<C> + Send + Sync + 'static,
    {
        let is_dynamic = self
            .nodes
            .get(target.index.get())
            .is_some_and(|n| matches!(n.kind, NodeKind::Dynamic { .. }));
        if !is_dynamic {
            return Err(ProtocolError::NotDynamic(self.name_of(target.index)));
        }
        let ops: Box<dyn ContextOps> = Box::new(LinkOps::new(name, child_of));
        let index = self.add(
            Some(parent.index),
            name,
            LengthHint::Fixed(0),
            NodeKind::Link {
                target: target.index,
                ops,
            },
        )?;
        Ok(LinkRef {
            index,
            target: target.index,
            _marker: PhantomData,
        })
    }

    /// An endpoint under a parent of context `C`. `decode` reads the payload
    /// and handles the message.
    pub fn endpoint<C, F>(&mut self, parent: Parent<C>, name: &str, decode: F) -> Result<EndpointRef<C>>
    where
        C: Send + Sync + 'static,
        F: Fn(&C, &mut BitDecoder, &mut MessageContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let def = EndpointDef {
            decode: erase_decode(decode),
            on_missing: None,
        };
        let index = self.add(Some(parent.index), name, LengthHint::Dynamic, NodeKind::Endpoint(def))?;
        Ok(EndpointRef::new(index))
    }

    /// An endpoint without payload.
    pub fn signal<C, F>(&mut self, parent: Parent<C>, name: &str, handler: F) -> Result<EndpointRef<C>>
    where
        C: Send + Sync + 'static,
        F: Fn(&C, &mut MessageContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let endpoint = self.endpoint(parent, name, move |value: &C, _dec: &mut BitDecoder, ctx: &mut MessageContext<'_>| {
            handler(value, ctx)
        })?;
        self.set_payload_length(endpoint, 0)?;
        Ok(endpoint)
    }

    /// An endpoint that is also a key: it encodes its own `T` (derived from
    /// the parent context `P`) ahead of the payload.
    pub fn keyed_endpoint<P, T, K, F>(
        &mut self,
        parent: Parent<P>,
        name: &str,
        key: K,
        decode: F,
    ) -> Result<EndpointRef<T>>
    where
        P: Send + Sync + 'static,
        T: Send + Sync + 'static,
        K: ContextKey<P, T>,
        F: Fn(&T, &mut BitDecoder, &mut MessageContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let ops: Box<dyn ContextOps> = Box::new(KeyOps::new(key));
        let def = EndpointDef {
            decode: erase_decode(decode),
            on_missing: None,
        };
        let index = self.add(
            Some(parent.index),
            name,
            LengthHint::Dynamic,
            NodeKind::KeyedEndpoint { ops, def },
        )?;
        Ok(EndpointRef::new(index))
    }

    /// Declares the payload of `endpoint` as exactly `bytes` long so sends
    /// can pre-size their buffers.
    pub fn set_payload_length<C>(&mut self, endpoint: EndpointRef<C>, bytes: usize) -> Result<()> {
        let parent_length = self.parent_length(endpoint.index);
        let node = self.node_mut(endpoint.index)?;
        let key_length = match &node.kind {
            NodeKind::KeyedEndpoint { ops, .. } => ops.length(),
            _ => LengthHint::Fixed(0),
        };
        node.own_length = key_length.then(LengthHint::Fixed(bytes));
        node.length = parent_length.then(node.own_length);
        Ok(())
    }

    /// Installs the handler that runs instead of the decoder when a key of
    /// the endpoint's path cannot be resolved on receipt.
    pub fn on_missing<C, F>(&mut self, endpoint: EndpointRef<C>, handler: F) -> Result<()>
    where
        F: Fn(&MissingKeys, &MessageContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let name = self.name_of(endpoint.index);
        let def = self
            .node_mut(endpoint.index)?
            .kind
            .endpoint_mut()
            .ok_or(ProtocolError::NotAnEndpoint(name))?;
        def.on_missing = Some(Box::new(handler));
        Ok(())
    }

    pub fn build(self) -> Arc<Tree> {
        Arc::new(Tree {
            nodes: self.nodes,
            revision: self.revision,
        })
    }

    pub(crate) fn add(
        &mut self,
        parent: Option<NodeIndex>,
        name: &str,
        own_length: LengthHint,
        kind: NodeKind,
    ) -> Result<NodeIndex> {
        self.check_name(parent, name)?;
        let length = match parent {
            Some(p) => self.parent_length_of(p).then(own_length),
            None => own_length,
        };
        let index = NodeIndex(self.nodes.len() as u32);
        if let Some(p) = parent {
            self.node_mut(p)?.children.push(index);
        }
        self.nodes.push(Node {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            own_length,
            length,
            kind,
        });
        Ok(index)
    }

    fn check_name(&self, parent: Option<NodeIndex>, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > self.revision.max_name_bytes || name.contains('.') {
            return Err(ProtocolError::InvalidName(name.to_string()));
        }
        let siblings: &[NodeIndex] = match parent {
            Some(p) => {
                let node = self
                    .nodes
                    .get(p.get())
                    .ok_or(ProtocolError::UnknownNode(p.0))?;
                if node.kind.endpoint().is_some() || matches!(node.kind, NodeKind::Link { .. }) {
                    return Err(ProtocolError::InvalidName(format!(
                        "{name} (parent '{}' is a {})",
                        node.name,
                        node.kind.label()
                    )));
                }
                &node.children
            }
            None => &[],
        };
        let taken = siblings
            .iter()
            .any(|s| self.nodes.get(s.get()).is_some_and(|n| n.name == name));
        if taken {
            return Err(ProtocolError::DuplicateName {
                parent: parent.map(|p| self.name_of(p)).unwrap_or_default(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn node_mut(&mut self, index: NodeIndex) -> Result<&mut Node> {
        self.nodes
            .get_mut(index.get())
            .ok_or(ProtocolError::UnknownNode(index.0))
    }

    fn parent_length(&self, index: NodeIndex) -> LengthHint {
        self.nodes
            .get(index.get())
            .and_then(|n| n.parent)
            .map(|p| self.parent_length_of(p))
            .unwrap_or(LengthHint::Fixed(0))
    }

    fn parent_length_of(&self, parent: NodeIndex) -> LengthHint {
        self.nodes
            .get(parent.get())
            .map(|n| n.length)
            .unwrap_or(LengthHint::Dynamic)
    }

    pub(crate) fn name_of(&self, index: NodeIndex) -> String {
        self.nodes
            .get(index.get())
            .map(|n| n.name.clone())
            .unwrap_or_default()
    }
}

fn erase_decode<C, F>(decode: F) -> crate::tree::DecodeFn
where
    C: Send + Sync + 'static,
    F: Fn(&C, &mut BitDecoder, &mut MessageContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    Box::new(
        move |value: &Value, dec: &mut BitDecoder, ctx: &mut MessageContext<'_>| {
            decode(downcast::<C>(value)?, dec, ctx)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_codec::BitEncoder;

    struct Pos;

    impl ContextKey<(), i32> for Pos {
        fn length(&self) -> LengthHint {
            LengthHint::Fixed(4)
        }

        fn parent_of(&self, _value: &i32) {}

        fn write(&self, enc: &mut BitEncoder, value: &i32) -> Result<()> {
            enc.write_u32(*value as u32);
            Ok(())
        }

        fn read(&self, dec: &mut BitDecoder, _parent: &()) -> Result<Option<i32>> {
            Ok(Some(dec.read_u32()? as i32))
        }
    }

    fn noop<C>(_: &C, _: &mut BitDecoder, _: &mut MessageContext<'_>) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_names_are_validated() {
        let mut b = TreeBuilder::new();
        let root = b.root();
        assert!(matches!(b.group(root, ""), Err(ProtocolError::InvalidName(_))));
        assert!(matches!(b.group(root, "a.b"), Err(ProtocolError::InvalidName(_))));
        let long = "x".repeat(CURRENT_REVISION.max_name_bytes + 1);
        assert!(matches!(b.group(root, &long), Err(ProtocolError::InvalidName(_))));

        b.group(root, "world").unwrap();
        let err = b.group(root, "world").unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateName { .. }));
        assert_eq!(err.kind(), crate::ErrorKind::Misuse);
    }

    #[test]
    fn test_endpoints_have_no_children() {
        let mut b = TreeBuilder::new();
        let root = b.root();
        let ep = b.endpoint(root, "ping", noop::<()>).unwrap();
        let as_parent: Parent<()> = Parent::new(ep.index());
        assert!(b.group(as_parent, "nested").is_err());
    }

    #[test]
    fn test_link_requires_dynamic_target() {
        let mut b = TreeBuilder::new();
        let root = b.root();
        let group: Parent<()> = b.group(root, "g").unwrap();
        let err = b.link(root, group, "bad", |_: &()| Some(())).unwrap_err();
        assert!(matches!(err, ProtocolError::NotDynamic(_)));
    }

    #[test]
    fn test_length_hints_accumulate() {
        let mut b = TreeBuilder::new();
        let root = b.root();
        let g = b.group(root, "g").unwrap();
        let pos = b.key(g, "pos", Pos).unwrap();
        let ep = b.endpoint(pos, "fixed", noop::<i32>).unwrap();
        b.set_payload_length(ep, 3).unwrap();
        let open = b.endpoint(pos, "open", noop::<i32>).unwrap();
        let tree = b.build();

        assert_eq!(tree.length_hint(pos.index()), Some(LengthHint::Fixed(4)));
        assert_eq!(tree.length_hint(ep.index()), Some(LengthHint::Fixed(7)));
        assert_eq!(tree.length_hint(open.index()), Some(LengthHint::Dynamic));
        assert_eq!(tree.find("g.pos.fixed"), Some(ep.index()));
        assert!(tree.is_endpoint(ep.index()));
        assert!(!tree.is_endpoint(pos.index()));
    }

    #[test]
    fn test_on_missing_requires_endpoint() {
        let mut b = TreeBuilder::new();
        let root = b.root();
        let g = b.group(root, "g").unwrap();
        let fake: EndpointRef<()> = EndpointRef::new(g.index());
        assert!(matches!(
            b.on_missing(fake, |_, _| Ok(())),
            Err(ProtocolError::NotAnEndpoint(_))
        ));
    }
}
