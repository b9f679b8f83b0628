//! Trie node model and its byte-level serialization.
//!
//! A node is either empty, a leaf, or a branch. Branches come in four
//! sub-kinds that record whether each child is terminal (a leaf or the empty
//! hash) or another branch; the sub-kind doubles as the hash domain, so the
//! shape information is committed to by the root.

use serde::{Deserialize, Serialize};

use crate::byte32::Byte32;
use crate::hash::{self, hash_elems_with_domain, leaf_hash, Hash, HASH_BYTE_LEN};
use crate::trie::{ZkTrieError, ZkTrieResult};

/// Serialization tag of a leaf node.
pub const NODE_TYPE_LEAF: u8 = 4;
/// Serialization tag of the empty node.
pub const NODE_TYPE_EMPTY: u8 = 5;

// Tags 0..=2 belong to the legacy encoding that did not commit to child
// terminality. They are recognized only to be rejected.
const NODE_TYPE_PARENT_DEPRECATED: u8 = 0;
const NODE_TYPE_EMPTY_DEPRECATED: u8 = 2;

/// The four branch sub-kinds. The discriminant is both the serialization tag
/// and the hash domain of the branch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BranchType {
    /// Both children are terminal.
    BothTerminal = 6,
    /// The left child is terminal, the right child is a branch.
    LeftTerminal = 7,
    /// The left child is a branch, the right child is terminal.
    RightTerminal = 8,
    /// Both children are branches.
    BothBranch = 9,
}

impl BranchType {
    /// Whether the left child is a leaf or empty.
    pub fn left_is_terminal(self) -> bool {
        matches!(self, BranchType::BothTerminal | BranchType::LeftTerminal)
    }

    /// Whether the right child is a leaf or empty.
    pub fn right_is_terminal(self) -> bool {
        matches!(self, BranchType::BothTerminal | BranchType::RightTerminal)
    }

    /// The kind implied by the terminality of each child.
    pub fn of(left_terminal: bool, right_terminal: bool) -> Self {
        match (left_terminal, right_terminal) {
            (true, true) => BranchType::BothTerminal,
            (true, false) => BranchType::LeftTerminal,
            (false, true) => BranchType::RightTerminal,
            (false, false) => BranchType::BothBranch,
        }
    }

    /// The kind after the child on the given side stops being terminal,
    /// which happens when an insert pushes a leaf further down.
    pub fn deduce_upgrade(self, right: bool) -> Self {
        if right {
            Self::of(self.left_is_terminal(), false)
        } else {
            Self::of(false, self.right_is_terminal())
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            6 => Some(BranchType::BothTerminal),
            7 => Some(BranchType::LeftTerminal),
            8 => Some(BranchType::RightTerminal),
            9 => Some(BranchType::BothBranch),
            _ => None,
        }
    }
}

/// A leaf holding a value split into [`Byte32`] chunks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafNode {
    /// The secure key this leaf is stored under.
    pub node_key: Hash,
    /// Bit `i` set means chunk `i` must be compressed through Poseidon
    /// before entering the value hash; clear means the chunk is used as a
    /// field element directly.
    pub compressed_flags: u32,
    /// The value chunks.
    pub value_preimage: Vec<Byte32>,
    /// The original (unhashed) key, when known. Not covered by the node
    /// hash and dropped from the canonical persisted form.
    pub key_preimage: Option<Byte32>,
}

/// An interior node with two children addressed by hash.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchNode {
    /// Terminality of the two children.
    pub kind: BranchType,
    /// Hash of the left child.
    pub child_left: Hash,
    /// Hash of the right child.
    pub child_right: Hash,
}

/// A node of the trie.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    /// The empty subtree, hashing to [`Hash::ZERO`].
    Empty,
    /// A terminal node carrying a value.
    Leaf(LeafNode),
    /// An interior node.
    Branch(BranchNode),
}

impl Node {
    /// A new leaf for the given secure key and value chunks.
    pub fn leaf(node_key: Hash, compressed_flags: u32, value_preimage: Vec<Byte32>) -> Self {
        Node::Leaf(LeafNode {
            node_key,
            compressed_flags,
            value_preimage,
            key_preimage: None,
        })
    }

    /// A new branch with the given child hashes.
    pub fn branch(kind: BranchType, child_left: Hash, child_right: Hash) -> Self {
        Node::Branch(BranchNode {
            kind,
            child_left,
            child_right,
        })
    }

    /// Whether this node terminates a path.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Node::Branch(_))
    }

    /// The hash that commits to this node.
    ///
    /// Empty hashes to zero, a leaf to `H(1, node_key, value_hash)` and a
    /// branch to `H(kind, child_left, child_right)`.
    pub fn node_hash(&self) -> ZkTrieResult<Hash> {
        match self {
            Node::Empty => Ok(Hash::ZERO),
            Node::Leaf(leaf) => Ok(leaf_hash(&leaf.node_key, &self.value_hash()?)),
            Node::Branch(b) => Ok(hash_elems_with_domain(
                b.kind as u64,
                &b.child_left,
                &b.child_right,
            )),
        }
    }

    /// The hash of a leaf's value chunks; zero for the other node kinds.
    ///
    /// Each chunk is either compressed through Poseidon (its flag bit set)
    /// or reinterpreted as a field element, then the per-chunk digests are
    /// folded left to right.
    pub fn value_hash(&self) -> ZkTrieResult<Hash> {
        let Node::Leaf(leaf) = self else {
            return Ok(Hash::ZERO);
        };
        let mut acc: Option<Hash> = None;
        for (i, chunk) in leaf.value_preimage.iter().enumerate() {
            let elem = if leaf.compressed_flags & (1 << i) != 0 {
                chunk.hash()
            } else {
                chunk.as_field_element()?
            };
            acc = Some(match acc {
                None => elem,
                Some(prev) => hash_elems_with_domain(hash::DOMAIN_VALUE_FOLD, &prev, &elem),
            });
        }
        Ok(acc.unwrap_or(Hash::ZERO))
    }

    /// The canonical persisted form, which omits the key preimage.
    pub fn canonical_value(&self) -> Vec<u8> {
        self.encode(false)
    }

    /// The full serialized form, key preimage included. This is what proof
    /// witnesses carry.
    pub fn bytes(&self) -> Vec<u8> {
        self.encode(true)
    }

    fn encode(&self, with_key_preimage: bool) -> Vec<u8> {
        match self {
            Node::Empty => vec![NODE_TYPE_EMPTY],
            Node::Branch(b) => {
                let mut out = Vec::with_capacity(1 + 2 * HASH_BYTE_LEN);
                out.push(b.kind as u8);
                out.extend_from_slice(&b.child_left.bytes());
                out.extend_from_slice(&b.child_right.bytes());
                out
            }
            Node::Leaf(leaf) => {
                let mut out = Vec::with_capacity(
                    1 + HASH_BYTE_LEN + 4 + 32 * leaf.value_preimage.len() + 33,
                );
                out.push(NODE_TYPE_LEAF);
                out.extend_from_slice(&leaf.node_key.bytes());
                let mark = (leaf.compressed_flags << 8) | leaf.value_preimage.len() as u32;
                out.extend_from_slice(&mark.to_le_bytes());
                for chunk in &leaf.value_preimage {
                    out.extend_from_slice(chunk.bytes());
                }
                match leaf.key_preimage.filter(|_| with_key_preimage) {
                    Some(preimage) => {
                        out.push(32);
                        out.extend_from_slice(preimage.bytes());
                    }
                    None => out.push(0),
                }
                out
            }
        }
    }

    /// Parses a node from either serialized form.
    pub fn from_bytes(b: &[u8]) -> ZkTrieResult<Node> {
        let (&tag, rest) = b.split_first().ok_or(ZkTrieError::NodeBytesBadSize)?;
        match tag {
            NODE_TYPE_EMPTY => Ok(Node::Empty),
            NODE_TYPE_LEAF => Self::parse_leaf(rest),
            6..=9 => {
                if rest.len() != 2 * HASH_BYTE_LEN {
                    return Err(ZkTrieError::NodeBytesBadSize);
                }
                let kind = BranchType::from_tag(tag).ok_or(ZkTrieError::InvalidNodeFound)?;
                Ok(Node::branch(
                    kind,
                    Hash::from_checked_bytes(&rest[..HASH_BYTE_LEN])?,
                    Hash::from_checked_bytes(&rest[HASH_BYTE_LEN..])?,
                ))
            }
            NODE_TYPE_PARENT_DEPRECATED..=NODE_TYPE_EMPTY_DEPRECATED => {
                Err(ZkTrieError::InvalidNodeFound)
            }
            _ => Err(ZkTrieError::InvalidNodeFound),
        }
    }

    fn parse_leaf(rest: &[u8]) -> ZkTrieResult<Node> {
        if rest.len() < HASH_BYTE_LEN + 4 {
            return Err(ZkTrieError::NodeBytesBadSize);
        }
        let node_key = Hash::from_checked_bytes(&rest[..HASH_BYTE_LEN])?;
        let mark = u32::from_le_bytes(
            rest[HASH_BYTE_LEN..HASH_BYTE_LEN + 4]
                .try_into()
                .map_err(|_| ZkTrieError::NodeBytesBadSize)?,
        );
        let count = (mark & 0xff) as usize;
        let compressed_flags = mark >> 8;
        let mut cur = HASH_BYTE_LEN + 4;
        if rest.len() < cur + 32 * count {
            return Err(ZkTrieError::NodeBytesBadSize);
        }
        let mut value_preimage = Vec::with_capacity(count);
        for _ in 0..count {
            value_preimage.push(Byte32::from_bytes(&rest[cur..cur + 32])?);
            cur += 32;
        }
        let (&preimage_len, tail) = rest[cur..]
            .split_first()
            .ok_or(ZkTrieError::NodeBytesBadSize)?;
        let key_preimage = match preimage_len {
            0 => None,
            32 if tail.len() >= 32 => Some(Byte32::from_bytes(&tail[..32])?),
            _ => return Err(ZkTrieError::NodeBytesBadSize),
        };
        Ok(Node::Leaf(LeafNode {
            node_key,
            compressed_flags,
            value_preimage,
            key_preimage,
        }))
    }

    /// The flat value bytes of a leaf (all chunks concatenated), or `None`
    /// for the other node kinds.
    pub fn data(&self) -> Option<Vec<u8>> {
        match self {
            Node::Leaf(leaf) => {
                let mut out = Vec::with_capacity(32 * leaf.value_preimage.len());
                for chunk in &leaf.value_preimage {
                    out.extend_from_slice(chunk.bytes());
                }
                Some(out)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn sample_leaf() -> Node {
        let mut leaf = Node::leaf(
            Hash::from_bytes(&[7, 0, 0, 0]),
            1,
            vec![Byte32::from_bytes_padding_zero(&hex!("deadbeef")).unwrap()],
        );
        if let Node::Leaf(ref mut l) = leaf {
            l.key_preimage = Some(Byte32::from_bytes_padding_zero(&[42]).unwrap());
        }
        leaf
    }

    #[test]
    fn empty_round_trip() {
        let b = Node::Empty.bytes();
        assert_eq!(b, vec![NODE_TYPE_EMPTY]);
        assert_eq!(Node::from_bytes(&b).unwrap(), Node::Empty);
        assert_eq!(Node::Empty.node_hash().unwrap(), Hash::ZERO);
    }

    #[test]
    fn branch_round_trip() {
        let l = Node::leaf(Hash::from_bytes(&[1]), 0, vec![Byte32::default()])
            .node_hash()
            .unwrap();
        let n = Node::branch(BranchType::LeftTerminal, l, Hash::ZERO);
        let b = n.canonical_value();
        assert_eq!(b.len(), 65);
        assert_eq!(b[0], 7);
        assert_eq!(Node::from_bytes(&b).unwrap(), n);
    }

    #[test]
    fn leaf_round_trip_with_key_preimage() {
        let n = sample_leaf();
        let full = n.bytes();
        let canonical = n.canonical_value();
        // mark = flags << 8 | count
        assert_eq!(&full[33..37], &[1, 1, 0, 0]);
        assert_eq!(full.len(), canonical.len() + 32);
        let parsed = Node::from_bytes(&full).unwrap();
        assert_eq!(parsed, n);
        let stripped = Node::from_bytes(&canonical).unwrap();
        // The canonical form forgets the key preimage but hashes the same.
        assert_ne!(stripped, n);
        assert_eq!(stripped.node_hash().unwrap(), n.node_hash().unwrap());
    }

    #[test]
    fn deprecated_and_unknown_tags_rejected() {
        for tag in [0u8, 1, 2, 3, 10, 200] {
            let mut b = vec![tag];
            b.extend_from_slice(&[0u8; 64]);
            assert_eq!(Node::from_bytes(&b), Err(ZkTrieError::InvalidNodeFound));
        }
        assert_eq!(Node::from_bytes(&[]), Err(ZkTrieError::NodeBytesBadSize));
        assert_eq!(
            Node::from_bytes(&[NODE_TYPE_LEAF, 0, 0]),
            Err(ZkTrieError::NodeBytesBadSize)
        );
    }

    #[test]
    fn truncated_branch_rejected() {
        let n = Node::branch(BranchType::BothTerminal, Hash::ZERO, Hash::ZERO);
        let mut b = n.canonical_value();
        b.pop();
        assert_eq!(Node::from_bytes(&b), Err(ZkTrieError::NodeBytesBadSize));
    }

    #[test]
    fn branch_kind_helpers() {
        assert!(BranchType::BothTerminal.left_is_terminal());
        assert!(BranchType::BothTerminal.right_is_terminal());
        assert!(!BranchType::BothBranch.left_is_terminal());
        assert_eq!(BranchType::of(true, false), BranchType::LeftTerminal);
        assert_eq!(
            BranchType::BothTerminal.deduce_upgrade(true),
            BranchType::LeftTerminal
        );
        assert_eq!(
            BranchType::BothTerminal.deduce_upgrade(false),
            BranchType::RightTerminal
        );
        assert_eq!(
            BranchType::LeftTerminal.deduce_upgrade(false),
            BranchType::BothBranch
        );
    }

    #[test]
    fn branch_kind_is_part_of_the_hash() {
        let c = Node::leaf(Hash::from_bytes(&[9]), 0, vec![Byte32::default()])
            .node_hash()
            .unwrap();
        let a = Node::branch(BranchType::BothTerminal, c, Hash::ZERO);
        let b = Node::branch(BranchType::LeftTerminal, c, Hash::ZERO);
        assert_ne!(a.node_hash().unwrap(), b.node_hash().unwrap());
    }

    #[test]
    fn value_hash_distinguishes_compression() {
        let chunk = Byte32::from_bytes_padding_zero(&[5]).unwrap();
        let raw = Node::leaf(Hash::ZERO, 0, vec![chunk]);
        let compressed = Node::leaf(Hash::ZERO, 1, vec![chunk]);
        assert_ne!(raw.value_hash().unwrap(), compressed.value_hash().unwrap());
    }

    #[test]
    fn saturated_uncompressed_chunk_is_invalid() {
        let n = Node::leaf(Hash::ZERO, 0, vec![Byte32::from([0xff; 32])]);
        assert_eq!(n.value_hash(), Err(ZkTrieError::InvalidField));
        assert_eq!(n.node_hash(), Err(ZkTrieError::InvalidField));
    }
}
