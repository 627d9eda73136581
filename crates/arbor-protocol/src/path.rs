//! Paths -- node sequences from just below the root to an endpoint.

use std::fmt;
use std::sync::Arc;

use crate::tree::{LengthHint, NodeIndex, Tree};
use crate::{ProtocolError, Result, TAG_BYTES};

/// Value-equal by node sequence; the key of outgoing id tables.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Path(Arc<[NodeIndex]>);

impl Path {
    pub fn new(nodes: &[NodeIndex]) -> Self {
        Path(nodes.into())
    }

    pub fn nodes(&self) -> &[NodeIndex] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn endpoint(&self) -> Option<NodeIndex> {
        self.0.last().copied()
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

/// A path plus everything derived from it once: key nodes, length hint and
/// dotted name.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub path: Path,
    pub keys: Vec<NodeIndex>,
    pub length: LengthHint,
    pub dotted: String,
}

impl ResolvedPath {
    pub fn from_nodes(tree: &Tree, nodes: &[NodeIndex]) -> Result<Self> {
        let mut keys = Vec::new();
        for index in nodes {
            if tree.node(*index)?.kind.context_ops().is_some() {
                keys.push(*index);
            }
        }
        Ok(Self {
            path: Path::new(nodes),
            keys,
            length: tree.path_length(nodes),
            dotted: tree.dotted(nodes),
        })
    }

    /// Walks a received name chain against the local tree. The chain must
    /// end at an endpoint.
    pub fn from_names(tree: &Tree, names: &[String]) -> Result<Self> {
        let max = tree.revision().max_path_depth;
        if names.len() > max {
            return Err(ProtocolError::PathTooDeep {
                depth: names.len(),
                max,
            });
        }
        let mut nodes = Vec::with_capacity(names.len());
        let mut at = NodeIndex::ROOT;
        for name in names {
            at = tree
                .child_named(at, name)
                .ok_or_else(|| ProtocolError::UnknownName {
                    parent: tree.dotted(&nodes),
                    name: name.clone(),
                })?;
            nodes.push(at);
        }
        if !tree.is_endpoint(at) {
            return Err(ProtocolError::NotAnEndpoint(tree.dotted(&nodes)));
        }
        Self::from_nodes(tree, &nodes)
    }

    pub fn names<'t>(&self, tree: &'t Tree) -> Vec<&'t str> {
        self.path.nodes().iter().map(|n| tree.name(*n)).collect()
    }

    /// Encoded message size including the wire tag, when every part of the
    /// path and the payload has a fixed size.
    pub fn fixed_length(&self) -> Option<usize> {
        self.length.fixed().map(|n| n + TAG_BYTES)
    }
}
