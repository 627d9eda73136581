//! Endpoint tree -- immutable arena of named nodes, built once per process.
//!
//! Nodes are addressed by dense [`NodeIndex`] values. The tree never changes
//! after [`TreeBuilder::build`](crate::TreeBuilder::build) and is shared by
//! every connection through an `Arc`.

use std::fmt;

use arbor_codec::BitDecoder;

use crate::context::{ContextOps, MessageContext, MissingKeys, Value};
use crate::dynamic::ErasedLink;
use crate::limits::ProtocolRevision;
use crate::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub(crate) u32);

impl NodeIndex {
    pub const ROOT: NodeIndex = NodeIndex(0);

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Encoded size of a node's own contribution to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthHint {
    Fixed(usize),
    Dynamic,
}

impl LengthHint {
    /// Sum of two hints; anything dynamic makes the whole dynamic.
    pub fn then(self, other: LengthHint) -> LengthHint {
        match (self, other) {
            (LengthHint::Fixed(a), LengthHint::Fixed(b)) => LengthHint::Fixed(a + b),
            _ => LengthHint::Dynamic,
        }
    }

    pub fn fixed(self) -> Option<usize> {
        match self {
            LengthHint::Fixed(n) => Some(n),
            LengthHint::Dynamic => None,
        }
    }
}

pub(crate) type DecodeFn =
    Box<dyn Fn(&Value, &mut BitDecoder, &mut MessageContext<'_>) -> Result<()> + Send + Sync>;
pub(crate) type MissingFn =
    Box<dyn Fn(&MissingKeys, &MessageContext<'_>) -> Result<()> + Send + Sync>;
pub(crate) type ResolveFn = Box<dyn Fn(&Value) -> Result<Option<ErasedLink>> + Send + Sync>;

pub(crate) struct EndpointDef {
    pub decode: DecodeFn,
    pub on_missing: Option<MissingFn>,
}

pub(crate) enum NodeKind {
    Root,
    Group,
    TypedGroup(Box<dyn ContextOps>),
    Key(Box<dyn ContextOps>),
    Cast(Box<dyn ContextOps>),
    Extractor(Box<dyn ContextOps>),
    /// Child-typed subtree root whose parent chain is chosen per send.
    Dynamic {
        resolve: Option<ResolveFn>,
    },
    /// A candidate parent position for the Dynamic node `target`.
    Link {
        target: NodeIndex,
        ops: Box<dyn ContextOps>,
    },
    Endpoint(EndpointDef),
    KeyedEndpoint {
        ops: Box<dyn ContextOps>,
        def: EndpointDef,
    },
}

impl NodeKind {
    /// Context reader/writer, for nodes that carry a value.
    pub(crate) fn context_ops(&self) -> Option<&dyn ContextOps> {
        match self {
            NodeKind::TypedGroup(ops)
            | NodeKind::Key(ops)
            | NodeKind::Cast(ops)
            | NodeKind::Extractor(ops)
            | NodeKind::Link { ops, .. }
            | NodeKind::KeyedEndpoint { ops, .. } => Some(ops.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn endpoint(&self) -> Option<&EndpointDef> {
        match self {
            NodeKind::Endpoint(def) | NodeKind::KeyedEndpoint { def, .. } => Some(def),
            _ => None,
        }
    }

    pub(crate) fn endpoint_mut(&mut self) -> Option<&mut EndpointDef> {
        match self {
            NodeKind::Endpoint(def) | NodeKind::KeyedEndpoint { def, .. } => Some(def),
            _ => None,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Group => "group",
            NodeKind::TypedGroup(_) => "typed-group",
            NodeKind::Key(_) => "key",
            NodeKind::Cast(_) => "cast",
            NodeKind::Extractor(_) => "extractor",
            NodeKind::Dynamic { .. } => "dynamic",
            NodeKind::Link { .. } => "link",
            NodeKind::Endpoint(_) => "endpoint",
            NodeKind::KeyedEndpoint { .. } => "keyed-endpoint",
        }
    }
}

pub(crate) struct Node {
    pub name: String,
    /// `None` for the root and for Dynamic subtree roots.
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
    pub own_length: LengthHint,
    /// Cumulative hint from the nearest root (tree or dynamic) down.
    pub length: LengthHint,
    pub kind: NodeKind,
}

pub struct Tree {
    pub(crate) nodes: Vec<Node>,
    pub(crate) revision: &'static ProtocolRevision,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("nodes", &self.nodes.len())
            .field("revision", &self.revision.id)
            .finish()
    }
}

impl Tree {
    pub fn revision(&self) -> &'static ProtocolRevision {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub(crate) fn node(&self, index: NodeIndex) -> Result<&Node> {
        self.nodes
            .get(index.get())
            .ok_or(ProtocolError::UnknownNode(index.0))
    }

    pub fn name(&self, index: NodeIndex) -> &str {
        self.nodes
            .get(index.get())
            .map(|n| n.name.as_str())
            .unwrap_or("?")
    }

    pub fn parent(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.nodes.get(index.get()).and_then(|n| n.parent)
    }

    pub fn is_endpoint(&self, index: NodeIndex) -> bool {
        self.nodes
            .get(index.get())
            .is_some_and(|n| n.kind.endpoint().is_some())
    }

    /// Cumulative length hint of `index` measured from its root.
    pub fn length_hint(&self, index: NodeIndex) -> Option<LengthHint> {
        self.nodes.get(index.get()).map(|n| n.length)
    }

    /// Child of `parent` called `name`. Links look through to the children
    /// of the Dynamic node they target.
    pub fn child_named(&self, parent: NodeIndex, name: &str) -> Option<NodeIndex> {
        let node = self.nodes.get(parent.get())?;
        let scope = match node.kind {
            NodeKind::Link { target, .. } => self.nodes.get(target.get())?,
            _ => node,
        };
        scope
            .children
            .iter()
            .copied()
            .find(|c| self.nodes.get(c.get()).is_some_and(|n| n.name == name))
    }

    /// Resolves a dotted name such as `world.chest.open` from the root.
    pub fn find(&self, dotted: &str) -> Option<NodeIndex> {
        dotted
            .split('.')
            .try_fold(NodeIndex::ROOT, |at, name| self.child_named(at, name))
    }

    /// Dotted name of a node sequence.
    pub fn dotted(&self, nodes: &[NodeIndex]) -> String {
        let names: Vec<&str> = nodes.iter().map(|n| self.name(*n)).collect();
        names.join(".")
    }

    /// Summed own-length hints along a node sequence.
    pub fn path_length(&self, nodes: &[NodeIndex]) -> LengthHint {
        nodes.iter().fold(LengthHint::Fixed(0), |acc, n| {
            let own = self
                .nodes
                .get(n.get())
                .map(|node| node.own_length)
                .unwrap_or(LengthHint::Dynamic);
            acc.then(own)
        })
    }
}
