//! Dynamic parents -- picks the owner chain of a value at send time.
//!
//! A Dynamic node is declared against its child type only. Each candidate
//! owner is a Link node placed under that owner in the tree. When a message
//! below a Dynamic node is sent, the chosen link replaces the Dynamic node in
//! the path, so the id handshake pins the concrete chain and the receiver
//! never re-resolves anything.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::builder::LinkRef;
use crate::context::Value;
use crate::tree::{NodeIndex, NodeKind, Tree};
use crate::{ProtocolError, Result};

/// The link to use for one value of a Dynamic node of type `C`, with the
/// concrete parent instance.
pub struct DynamicLink<C> {
    erased: ErasedLink,
    _marker: PhantomData<fn() -> C>,
}

#[derive(Clone)]
pub(crate) struct ErasedLink {
    pub link: NodeIndex,
    pub dynamic: NodeIndex,
    pub parent: Value,
}

impl<C> DynamicLink<C> {
    pub fn new<P: Send + Sync + 'static>(link: LinkRef<P, C>, parent: P) -> Self {
        Self {
            erased: ErasedLink {
                link: link.index,
                dynamic: link.target,
                parent: Arc::new(parent),
            },
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_erased(self) -> ErasedLink {
        self.erased
    }
}

/// A path resolved for sending: the nodes on the wire path (Dynamic nodes
/// replaced by their links), the key nodes among them and the value of each
/// key, all top-down.
#[derive(Debug)]
pub(crate) struct Resolution {
    pub nodes: Vec<NodeIndex>,
    pub keys: Vec<NodeIndex>,
    pub values: Vec<Value>,
}

/// Walks up from `endpoint`, deriving each key's value from the one below.
/// `chosen` overrides the resolver of the Dynamic node it targets.
pub(crate) fn resolve(
    tree: &Tree,
    endpoint: NodeIndex,
    value: Value,
    chosen: Option<&ErasedLink>,
) -> Result<Resolution> {
    let max_depth = tree.revision().max_path_depth;
    let mut nodes = Vec::new();
    let mut keys = Vec::new();
    let mut values = Vec::new();
    let mut index = endpoint;
    let mut current = value;

    loop {
        if nodes.len() > max_depth {
            return Err(ProtocolError::PathTooDeep {
                depth: nodes.len(),
                max: max_depth,
            });
        }
        let node = tree.node(index)?;
        match &node.kind {
            NodeKind::Root => break,
            NodeKind::Dynamic { resolve } => {
                let link = match chosen.filter(|l| l.dynamic == index) {
                    Some(link) => link.clone(),
                    None => {
                        let picked = match resolve {
                            Some(resolve) => resolve(&current)?,
                            None => None,
                        };
                        picked.ok_or_else(|| ProtocolError::UnresolvedDynamic(node.name.clone()))?
                    }
                };
                let link_node = tree.node(link.link)?;
                let targets_this = matches!(
                    link_node.kind,
                    NodeKind::Link { target, .. } if target == index
                );
                if !targets_this {
                    return Err(ProtocolError::LinkMismatch {
                        link: link_node.name.clone(),
                        dynamic: node.name.clone(),
                    });
                }
                nodes.push(link.link);
                keys.push(link.link);
                values.push(current);
                current = link.parent;
                index = link_node
                    .parent
                    .ok_or_else(|| ProtocolError::UnresolvedDynamic(link_node.name.clone()))?;
            }
            kind => {
                nodes.push(index);
                if let Some(ops) = kind.context_ops() {
                    let parent = ops.to_parent(&current)?;
                    keys.push(index);
                    values.push(std::mem::replace(&mut current, parent));
                }
                index = node
                    .parent
                    .ok_or_else(|| ProtocolError::UnresolvedDynamic(node.name.clone()))?;
            }
        }
    }

    nodes.reverse();
    keys.reverse();
    values.reverse();
    Ok(Resolution {
        nodes,
        keys,
        values,
    })
}
