//! Chunk/node trees.

use serde::{Deserialize, Serialize};

use crate::error::{DedupError, DedupResult};
use crate::identifier::{
    dedup_hash, ChunkDedupIdentifier, DedupIdentifier, NodeDedupIdentifier, DEDUP_HASH_LEN,
};

/// Bytes per child in a serialized node: kind, size, hash
pub const SERIALIZED_CHILD_LEN: usize = 1 + 8 + DEDUP_HASH_LEN;

/// Leaf or interior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Content chunk
    ChunkLeaf,
    /// Interior node over an ordered child list
    InnerNode,
}

impl NodeKind {
    fn as_byte(self) -> u8 {
        match self {
            NodeKind::ChunkLeaf => 0,
            NodeKind::InnerNode => 1,
        }
    }
}

/// One element of a chunk tree.
///
/// A chunk leaf carries the hash of its content and its length. An inner node
/// carries its ordered children, the hash of their serialized list and the
/// sum of their sizes. Nodes are immutable once built.
///
/// Deserialization recomputes an inner node's hash and size from its children
/// and rejects a node whose recorded values disagree. A childless inner node
/// is accepted as a reference to be resolved elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NodeFields")]
pub struct DedupNode {
    kind: NodeKind,
    hash: [u8; DEDUP_HASH_LEN],
    transitive_content_bytes: u64,
    children: Vec<DedupNode>,
}

impl DedupNode {
    /// Leaf for a chunk with the given content hash and length
    pub fn chunk(hash: [u8; DEDUP_HASH_LEN], len: u64) -> Self {
        Self {
            kind: NodeKind::ChunkLeaf,
            hash,
            transitive_content_bytes: len,
            children: Vec::new(),
        }
    }

    /// Leaf for chunk content
    pub fn chunk_of(content: &[u8]) -> Self {
        Self::chunk(dedup_hash(content), content.len() as u64)
    }

    /// Interior node over `children`, which must not be empty
    pub fn inner(children: Vec<DedupNode>) -> DedupResult<Self> {
        if children.is_empty() {
            return Err(DedupError::InvalidNode(
                "an inner node needs at least one child".into(),
            ));
        }
        let transitive_content_bytes = sum_sizes(&children)
            .ok_or_else(|| DedupError::InvalidNode("child sizes overflow u64".into()))?;
        let serialized = serialize_children(&children);
        Ok(Self {
            kind: NodeKind::InnerNode,
            hash: dedup_hash(&serialized),
            transitive_content_bytes,
            children,
        })
    }

    /// Leaf or interior
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Content hash (leaf) or serialized-children hash (interior)
    pub fn hash(&self) -> &[u8; DEDUP_HASH_LEN] {
        &self.hash
    }

    /// Total content bytes under this node
    pub fn transitive_content_bytes(&self) -> u64 {
        self.transitive_content_bytes
    }

    /// Ordered children; empty for leaves
    pub fn children(&self) -> &[DedupNode] {
        &self.children
    }

    /// Whether this is an interior node
    pub fn is_inner(&self) -> bool {
        self.kind == NodeKind::InnerNode
    }

    /// Whether the recorded hash and size follow from the direct children.
    /// A leaf must have no children; a childless inner node has nothing to
    /// check locally.
    pub fn has_consistent_children(&self) -> bool {
        match self.kind {
            NodeKind::ChunkLeaf => self.children.is_empty(),
            NodeKind::InnerNode if self.children.is_empty() => true,
            NodeKind::InnerNode => {
                sum_sizes(&self.children) == Some(self.transitive_content_bytes)
                    && dedup_hash(&serialize_children(&self.children)) == self.hash
            }
        }
    }

    /// Child list encoding hashed into the node id: per child one kind byte,
    /// the size as 8 bytes little-endian, then the 32-byte hash.
    pub fn serialize(&self) -> DedupResult<Vec<u8>> {
        if !self.is_inner() {
            return Err(DedupError::InvalidNode(
                "only inner nodes have a serialized form".into(),
            ));
        }
        Ok(serialize_children(&self.children))
    }

    /// Identifier of this element
    pub fn dedup_id(&self) -> DedupIdentifier {
        match self.kind {
            NodeKind::ChunkLeaf => ChunkDedupIdentifier::from_hash(self.hash).into(),
            NodeKind::InnerNode => NodeDedupIdentifier::from_hash(self.hash).into(),
        }
    }

    /// Chunk identifier; fails for interior nodes
    pub fn chunk_id(&self) -> DedupResult<ChunkDedupIdentifier> {
        match self.kind {
            NodeKind::ChunkLeaf => Ok(ChunkDedupIdentifier::from_hash(self.hash)),
            NodeKind::InnerNode => Err(DedupError::InvalidNode(
                "chunk id requested for an inner node".into(),
            )),
        }
    }

    /// Node identifier; fails for chunk leaves
    pub fn node_id(&self) -> DedupResult<NodeDedupIdentifier> {
        match self.kind {
            NodeKind::InnerNode => Ok(NodeDedupIdentifier::from_hash(self.hash)),
            NodeKind::ChunkLeaf => Err(DedupError::InvalidNode(
                "node id requested for a chunk".into(),
            )),
        }
    }

    /// Interior nodes in pre-order, starting with `self` when it is interior
    pub fn enumerate_inner_nodes_depth_first(&self) -> Vec<&DedupNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.is_inner() {
                out.push(node);
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// Chunk leaves in content order
    pub fn enumerate_chunk_leaves(&self) -> Vec<&DedupNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.is_inner() {
                stack.extend(node.children.iter().rev());
            } else {
                out.push(node);
            }
        }
        out
    }

    /// Copy keeping only this node's direct children, each without their own
    /// children. This is the form a node takes inside a proof set.
    pub fn shallow(&self) -> DedupNode {
        DedupNode {
            kind: self.kind,
            hash: self.hash,
            transitive_content_bytes: self.transitive_content_bytes,
            children: self
                .children
                .iter()
                .map(|child| DedupNode {
                    kind: child.kind,
                    hash: child.hash,
                    transitive_content_bytes: child.transitive_content_bytes,
                    children: Vec::new(),
                })
                .collect(),
        }
    }
}

/// Wire form of a node before its hash and size are checked
#[derive(Deserialize)]
struct NodeFields {
    kind: NodeKind,
    hash: [u8; DEDUP_HASH_LEN],
    transitive_content_bytes: u64,
    #[serde(default)]
    children: Vec<DedupNode>,
}

impl TryFrom<NodeFields> for DedupNode {
    type Error = DedupError;

    fn try_from(fields: NodeFields) -> DedupResult<Self> {
        let node = DedupNode {
            kind: fields.kind,
            hash: fields.hash,
            transitive_content_bytes: fields.transitive_content_bytes,
            children: fields.children,
        };
        if node.has_consistent_children() {
            Ok(node)
        } else {
            Err(DedupError::InvalidNode(format!(
                "{} does not match its children",
                node.dedup_id()
            )))
        }
    }
}

fn sum_sizes(children: &[DedupNode]) -> Option<u64> {
    children
        .iter()
        .try_fold(0u64, |total, child| total.checked_add(child.transitive_content_bytes))
}

fn serialize_children(children: &[DedupNode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(children.len() * SERIALIZED_CHILD_LEN);
    for child in children {
        out.push(child.kind.as_byte());
        out.extend_from_slice(&child.transitive_content_bytes.to_le_bytes());
        out.extend_from_slice(&child.hash);
    }
    out
}

/// Node with arbitrary recorded values, as a forger could hand-build one
#[cfg(test)]
pub(crate) fn unchecked_node(
    kind: NodeKind,
    hash: [u8; DEDUP_HASH_LEN],
    transitive_content_bytes: u64,
    children: Vec<DedupNode>,
) -> DedupNode {
    DedupNode {
        kind,
        hash,
        transitive_content_bytes,
        children,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<DedupNode> {
        (0..n).map(|i| DedupNode::chunk_of(&[i; 10])).collect()
    }

    #[test]
    fn inner_node_hashes_its_serialized_children() {
        let node = DedupNode::inner(leaves(3)).unwrap();
        let serialized = node.serialize().unwrap();
        assert_eq!(serialized.len(), 3 * SERIALIZED_CHILD_LEN);
        assert_eq!(serialized[0], 0);
        assert_eq!(&serialized[1..9], &10u64.to_le_bytes());
        assert_eq!(
            node.node_id().unwrap(),
            NodeDedupIdentifier::calculate_from_serialized_node(&serialized)
        );
        assert_eq!(node.transitive_content_bytes(), 30);
    }

    #[test]
    fn child_order_matters() {
        let mut reversed = leaves(3);
        reversed.reverse();
        assert_ne!(
            DedupNode::inner(leaves(3)).unwrap().hash(),
            DedupNode::inner(reversed).unwrap().hash()
        );
    }

    #[test]
    fn kinds_guard_their_ids() {
        let leaf = DedupNode::chunk_of(b"content");
        assert_eq!(leaf.chunk_id().unwrap(), ChunkDedupIdentifier::calculate(b"content"));
        assert!(leaf.node_id().is_err());
        assert!(leaf.serialize().is_err());
        assert!(matches!(leaf.dedup_id(), DedupIdentifier::Chunk(_)));
        let node = DedupNode::inner(vec![leaf]).unwrap();
        assert!(node.chunk_id().is_err());
        assert!(matches!(node.dedup_id(), DedupIdentifier::Node(_)));
        assert!(DedupNode::inner(Vec::new()).is_err());
    }

    #[test]
    fn enumeration_orders() {
        let left = DedupNode::inner(leaves(2)).unwrap();
        let right = DedupNode::inner(vec![DedupNode::chunk_of(b"x"), DedupNode::chunk_of(b"y")]).unwrap();
        let root = DedupNode::inner(vec![left.clone(), right.clone()]).unwrap();
        let inner: Vec<_> = root
            .enumerate_inner_nodes_depth_first()
            .into_iter()
            .map(|n| *n.hash())
            .collect();
        assert_eq!(inner, vec![*root.hash(), *left.hash(), *right.hash()]);
        let chunks: Vec<_> = root.enumerate_chunk_leaves().into_iter().map(|n| n.transitive_content_bytes()).collect();
        assert_eq!(chunks, vec![10, 10, 1, 1]);
    }

    #[test]
    fn shallow_copy_keeps_identity() {
        let child = DedupNode::inner(leaves(2)).unwrap();
        let root = DedupNode::inner(vec![child, DedupNode::chunk_of(b"z")]).unwrap();
        let shallow = root.shallow();
        assert_eq!(shallow.dedup_id(), root.dedup_id());
        assert_eq!(shallow.serialize().unwrap(), root.serialize().unwrap());
        assert!(shallow.children().iter().all(|c| c.children().is_empty()));
    }

    #[test]
    fn serde_keeps_consistent_nodes() {
        let child = DedupNode::inner(leaves(2)).unwrap();
        let root = DedupNode::inner(vec![child, DedupNode::chunk_of(b"z")]).unwrap();
        let json = serde_json::to_string(&root).unwrap();
        assert_eq!(serde_json::from_str::<DedupNode>(&json).unwrap(), root);
        let shallow = serde_json::to_string(&root.shallow()).unwrap();
        assert_eq!(serde_json::from_str::<DedupNode>(&shallow).unwrap(), root.shallow());
        assert!(root.has_consistent_children());
        assert!(root.shallow().has_consistent_children());
    }

    #[test]
    fn serde_rejects_nodes_that_disagree_with_their_children() {
        let root = DedupNode::inner(leaves(2)).unwrap();

        let mut inflated = serde_json::to_value(&root).unwrap();
        inflated["transitive_content_bytes"] = 999_999.into();
        assert!(serde_json::from_value::<DedupNode>(inflated).is_err());

        let fake_leaf = DedupNode::chunk(*DedupNode::chunk_of(b"fake").hash(), 999_999);
        let mut swapped = serde_json::to_value(&root).unwrap();
        swapped["transitive_content_bytes"] = 999_999.into();
        swapped["children"] = serde_json::to_value(vec![fake_leaf]).unwrap();
        assert!(serde_json::from_value::<DedupNode>(swapped).is_err());

        let mut leaf_with_children = serde_json::to_value(DedupNode::chunk_of(b"leaf")).unwrap();
        leaf_with_children["children"] = serde_json::to_value(leaves(1)).unwrap();
        assert!(serde_json::from_value::<DedupNode>(leaf_with_children).is_err());
    }

    #[test]
    fn oversized_children_are_rejected() {
        let huge = DedupNode::chunk([1; DEDUP_HASH_LEN], u64::MAX);
        let small = DedupNode::chunk([2; DEDUP_HASH_LEN], 1);
        assert!(matches!(
            DedupNode::inner(vec![huge, small]),
            Err(DedupError::InvalidNode(_))
        ));
    }
}
