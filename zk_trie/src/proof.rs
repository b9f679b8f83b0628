//! Merkle proof construction, serialization and verification.
//!
//! A proof records the branch kinds and non-empty siblings along the path
//! from the root to a terminal node. Because a branch hashes under a domain
//! derived from its kind, the verifier can rebuild every ancestor hash from
//! the leaf up without consulting storage.

use serde::{Deserialize, Serialize};

use crate::hash::{leaf_hash, Hash, HASH_BYTE_LEN};
use crate::node::{BranchType, Node};
use crate::trie::{ZkTrieError, ZkTrieResult};

/// The key under which the magic marker entry is stored in a proof db.
pub const MAGIC_HASH: &[u8] = b"THIS IS THE MAGIC INDEX FOR ZKTRIE";
/// The magic marker terminating every proof written to a proof db.
pub const MAGIC_SMT_BYTES: &[u8] = b"THIS IS SOME MAGIC BYTES FOR SMT m1rRXgP2xpDI";

/// Leading bytes of a serialized proof holding the flags and the depth.
pub const PROOF_FLAGS_LEN: usize = 2;
/// Byte width of the non-empty-sibling bitmap.
pub const NOT_EMPTIES_LEN: usize = HASH_BYTE_LEN - PROOF_FLAGS_LEN;

const FLAG_EXISTENCE: u8 = 0b01;
const FLAG_NODE_AUX: u8 = 0b10;

fn set_bit_big_endian(b: &mut [u8], i: usize) {
    let len = b.len();
    b[len - i / 8 - 1] |= 1 << (i % 8);
}

fn test_bit_big_endian(b: &[u8], i: usize) -> bool {
    b[b.len() - i / 8 - 1] & (1 << (i % 8)) != 0
}

/// The leaf actually found on a non-existence path, pinning down why the
/// proven key is absent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAux {
    /// Secure key of the leaf occupying the path.
    pub key: Hash,
    /// Its value hash.
    pub value_hash: Hash,
}

/// A Merkle proof of (non-)existence for one secure key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Whether the key holds a leaf.
    pub existence: bool,
    /// Number of branches on the path.
    pub depth: usize,
    /// Big-endian bitmap flagging the levels whose sibling is non-empty.
    /// Empty siblings are omitted from `siblings`.
    pub not_empties: [u8; NOT_EMPTIES_LEN],
    /// The kind of the branch at each level, top down. Needed to replay the
    /// domain-separated branch hashes.
    pub node_kinds: Vec<BranchType>,
    /// The non-empty siblings, top down.
    pub siblings: Vec<Hash>,
    /// The proven secure key.
    pub node_key: Hash,
    /// Present on non-existence paths terminated by a foreign leaf.
    pub node_aux: Option<NodeAux>,
}

/// Walks from `root` towards `node_key` through `get_node`, collecting the
/// proof and the terminal node the walk landed on (a leaf or [`Node::Empty`]).
pub fn build_proof<G>(
    root: &Hash,
    node_key: &Hash,
    max_levels: usize,
    get_node: G,
) -> ZkTrieResult<(Proof, Node)>
where
    G: Fn(&Hash) -> ZkTrieResult<Node>,
{
    let mut proof = Proof {
        existence: false,
        depth: 0,
        not_empties: [0u8; NOT_EMPTIES_LEN],
        node_kinds: Vec::new(),
        siblings: Vec::new(),
        node_key: *node_key,
        node_aux: None,
    };
    let mut next_key = *root;
    for lvl in 0..max_levels.min(NOT_EMPTIES_LEN * 8) {
        let n = get_node(&next_key)?;
        match n {
            Node::Empty => return Ok((proof, n)),
            Node::Leaf(ref leaf) => {
                if leaf.node_key == *node_key {
                    proof.existence = true;
                } else {
                    proof.node_aux = Some(NodeAux {
                        key: leaf.node_key,
                        value_hash: n.value_hash()?,
                    });
                }
                return Ok((proof, n));
            }
            Node::Branch(b) => {
                proof.node_kinds.push(b.kind);
                proof.depth = lvl + 1;
                let sibling = if node_key.bit(lvl) {
                    next_key = b.child_right;
                    b.child_left
                } else {
                    next_key = b.child_left;
                    b.child_right
                };
                if !sibling.is_zero() {
                    set_bit_big_endian(&mut proof.not_empties, lvl);
                    proof.siblings.push(sibling);
                }
            }
        }
    }
    Err(ZkTrieError::ReachedMaxLevel)
}

/// Checks a proof against a root and the terminal node returned by
/// [`build_proof`].
pub fn verify_proof(root: &Hash, proof: &Proof, node: &Node) -> bool {
    matches!(proof.verify(node), Ok(r) if r == *root)
}

impl Proof {
    /// Recomputes the root this proof commits to, after checking the
    /// terminal node is consistent with the proof's claim.
    pub fn verify(&self, node: &Node) -> ZkTrieResult<Hash> {
        let node_hash = match (self.existence, node) {
            (true, Node::Leaf(leaf)) if leaf.node_key == self.node_key => node.node_hash()?,
            (false, Node::Leaf(leaf)) => {
                let aux = self.node_aux.ok_or(ZkTrieError::InvalidProofBytes)?;
                if aux.key != leaf.node_key
                    || aux.key == self.node_key
                    || aux.value_hash != node.value_hash()?
                {
                    return Err(ZkTrieError::InvalidProofBytes);
                }
                node.node_hash()?
            }
            (false, Node::Empty) => {
                if self.node_aux.is_some() {
                    return Err(ZkTrieError::InvalidProofBytes);
                }
                Hash::ZERO
            }
            _ => return Err(ZkTrieError::InvalidProofBytes),
        };
        self.root_from_proof(&node_hash, &self.node_key)
    }

    /// Rebuilds the root from a terminal hash, replaying the recorded branch
    /// kinds bottom-up. The aux leaf hash substitutes for the terminal on
    /// non-existence paths.
    pub fn root_from_proof(&self, node_hash: &Hash, node_key: &Hash) -> ZkTrieResult<Hash> {
        if self.node_kinds.len() != self.depth || self.depth > NOT_EMPTIES_LEN * 8 {
            return Err(ZkTrieError::InvalidProofBytes);
        }
        let mut mid = match (self.existence, &self.node_aux) {
            (true, _) | (false, None) => *node_hash,
            (false, Some(aux)) => leaf_hash(&aux.key, &aux.value_hash),
        };
        let mut sibling_idx = self.siblings.len();
        for lvl in (0..self.depth).rev() {
            let sibling = if test_bit_big_endian(&self.not_empties, lvl) {
                sibling_idx = sibling_idx
                    .checked_sub(1)
                    .ok_or(ZkTrieError::InvalidProofBytes)?;
                self.siblings[sibling_idx]
            } else {
                Hash::ZERO
            };
            let kind = self.node_kinds[lvl];
            mid = if node_key.bit(lvl) {
                Node::branch(kind, sibling, mid).node_hash()?
            } else {
                Node::branch(kind, mid, sibling).node_hash()?
            };
        }
        if sibling_idx != 0 {
            return Err(ZkTrieError::InvalidProofBytes);
        }
        Ok(mid)
    }

    /// Serializes the proof.
    ///
    /// Layout: one flag byte (existence, aux presence), one depth byte, the
    /// 30-byte sibling bitmap, one kind byte per level, the non-empty
    /// siblings, then the 64-byte aux record when present.
    pub fn to_bytes(&self) -> ZkTrieResult<Vec<u8>> {
        if self.depth > u8::MAX as usize
            || self.node_kinds.len() != self.depth
            || self.depth > NOT_EMPTIES_LEN * 8
        {
            return Err(ZkTrieError::InvalidProofBytes);
        }
        let mut out = Vec::with_capacity(
            PROOF_FLAGS_LEN + NOT_EMPTIES_LEN + self.depth + 32 * self.siblings.len() + 64,
        );
        let mut flags = 0u8;
        if self.existence {
            flags |= FLAG_EXISTENCE;
        }
        if self.node_aux.is_some() {
            flags |= FLAG_NODE_AUX;
        }
        out.push(flags);
        out.push(self.depth as u8);
        out.extend_from_slice(&self.not_empties);
        for kind in &self.node_kinds {
            out.push(*kind as u8);
        }
        for sibling in &self.siblings {
            out.extend_from_slice(&sibling.bytes());
        }
        if let Some(aux) = &self.node_aux {
            out.extend_from_slice(&aux.key.bytes());
            out.extend_from_slice(&aux.value_hash.bytes());
        }
        Ok(out)
    }

    /// Parses a serialized proof for the given key, rejecting any layout
    /// inconsistency.
    pub fn from_bytes(node_key: &Hash, b: &[u8]) -> ZkTrieResult<Self> {
        if b.len() < PROOF_FLAGS_LEN + NOT_EMPTIES_LEN {
            return Err(ZkTrieError::InvalidProofBytes);
        }
        let flags = b[0];
        if flags & !(FLAG_EXISTENCE | FLAG_NODE_AUX) != 0 {
            return Err(ZkTrieError::InvalidProofBytes);
        }
        let existence = flags & FLAG_EXISTENCE != 0;
        let has_aux = flags & FLAG_NODE_AUX != 0;
        if existence && has_aux {
            return Err(ZkTrieError::InvalidProofBytes);
        }
        let depth = b[1] as usize;
        if depth > NOT_EMPTIES_LEN * 8 {
            return Err(ZkTrieError::InvalidProofBytes);
        }
        let mut not_empties = [0u8; NOT_EMPTIES_LEN];
        not_empties.copy_from_slice(&b[PROOF_FLAGS_LEN..PROOF_FLAGS_LEN + NOT_EMPTIES_LEN]);
        let mut sibling_count = 0usize;
        for i in 0..NOT_EMPTIES_LEN * 8 {
            if test_bit_big_endian(&not_empties, i) {
                if i >= depth {
                    return Err(ZkTrieError::InvalidProofBytes);
                }
                sibling_count += 1;
            }
        }
        let mut cur = PROOF_FLAGS_LEN + NOT_EMPTIES_LEN;
        let expected = cur + depth + 32 * sibling_count + if has_aux { 64 } else { 0 };
        if b.len() != expected {
            return Err(ZkTrieError::InvalidProofBytes);
        }
        let mut node_kinds = Vec::with_capacity(depth);
        for _ in 0..depth {
            let kind = match b[cur] {
                6 => BranchType::BothTerminal,
                7 => BranchType::LeftTerminal,
                8 => BranchType::RightTerminal,
                9 => BranchType::BothBranch,
                _ => return Err(ZkTrieError::InvalidProofBytes),
            };
            node_kinds.push(kind);
            cur += 1;
        }
        let mut siblings = Vec::with_capacity(sibling_count);
        for _ in 0..sibling_count {
            siblings.push(
                Hash::from_checked_bytes(&b[cur..cur + 32])
                    .map_err(|_| ZkTrieError::InvalidProofBytes)?,
            );
            cur += 32;
        }
        let node_aux = if has_aux {
            let key = Hash::from_checked_bytes(&b[cur..cur + 32])
                .map_err(|_| ZkTrieError::InvalidProofBytes)?;
            let value_hash = Hash::from_checked_bytes(&b[cur + 32..cur + 64])
                .map_err(|_| ZkTrieError::InvalidProofBytes)?;
            Some(NodeAux { key, value_hash })
        } else {
            None
        };
        Ok(Proof {
            existence,
            depth,
            not_empties,
            node_kinds,
            siblings,
            node_key: *node_key,
            node_aux,
        })
    }
}

/// Decodes one entry of a proof db: `Ok(None)` for the magic marker,
/// otherwise the witness node.
pub fn decode_smt_proof(data: &[u8]) -> ZkTrieResult<Option<Node>> {
    if data == MAGIC_SMT_BYTES {
        return Ok(None);
    }
    Node::from_bytes(data).map(Some)
}
