//! The sparse Merkle trie engine.
//!
//! Mutations are buffered in an in-memory dirty layer and only hashed when a
//! commitment is requested, so a burst of writes pays for one hashing pass
//! over the touched subtrees instead of one per write. Committed nodes are
//! read through a shared [`ZktrieDatabase`] backend.

use std::collections::HashMap;
use std::sync::Arc;

use ethereum_types::Address;
use log::trace;
use thiserror::Error;

use crate::account::StateAccount;
use crate::byte32::Byte32;
use crate::db::ZktrieDatabase;
use crate::hash::{get_path, Hash, MAX_LEVELS};
use crate::node::{BranchType, LeafNode, Node};
use crate::proof::{MAGIC_HASH, MAGIC_SMT_BYTES};

/// Alias for a [`Result`] with a [`ZkTrieError`] error.
pub type ZkTrieResult<T> = Result<T, ZkTrieError>;

/// The error taxonomy of all trie operations.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum ZkTrieError {
    /// The addressed key holds no leaf.
    #[error("key is not found in the trie")]
    KeyNotFound,
    /// A value limb does not fit the field.
    #[error("key or value is not inside the finite field")]
    InvalidField,
    /// A serialized node has an impossible size.
    #[error("node data has an incorrect size in the db")]
    NodeBytesBadSize,
    /// An insert ran out of path bits.
    #[error("reached the maximum level of the merkle tree")]
    ReachedMaxLevel,
    /// A stored node carries an unknown or deprecated tag, or contradicts
    /// the terminality its parent committed to.
    #[error("found an invalid node in the db")]
    InvalidNodeFound,
    /// A serialized proof cannot be decoded.
    #[error("the serialized proof is invalid")]
    InvalidProofBytes,
    /// Two distinct nodes collided on the same storage key.
    #[error("the node key already exists with a different value")]
    NodeKeyAlreadyExists,
    /// Deletion tracers built over different roots cannot be merged.
    #[error("deletion tracers can only be merged over the same root")]
    TracerRootMismatch,
    /// The storage backend failed.
    #[error("storage backend failure: {0}")]
    Storage(String),
}

/// Derives the secure key a raw key is stored under: the Poseidon hash of
/// the zero-padded 32-byte form of the key.
pub fn to_secure_key(key: &[u8]) -> ZkTrieResult<Hash> {
    Ok(Byte32::from_bytes_padding_zero(key)?.hash())
}

/// A sparse binary Merkle trie with lazy commitment.
///
/// Reading is cheap on a dirty trie since the dirty layer resolves child
/// pointers just like committed storage does; only [`ZkTrie::root`],
/// [`ZkTrie::commit`] and the proof builders force hashing.
#[derive(Debug)]
pub struct ZkTrie<D> {
    reader: Arc<D>,
    root_key: Hash,
    max_levels: usize,
    /// Mints placeholder keys for dirty branches whose children are not
    /// hashed yet.
    dirty_index: u64,
    /// Uncommitted nodes. Leaves are keyed by their real hash, branches by
    /// a placeholder until the next commitment pass re-keys them.
    dirty_storage: HashMap<Hash, Node>,
}

impl<D: ZktrieDatabase> ZkTrie<D> {
    /// Opens a trie over `reader` at the given committed root, with the full
    /// 248-level depth.
    pub fn new(reader: Arc<D>, root: Hash) -> ZkTrieResult<Self> {
        Self::new_with_max_levels(reader, root, MAX_LEVELS)
    }

    /// Opens a trie with a reduced depth. Shallow tries are mainly useful in
    /// tests where node keys are hand-picked.
    pub fn new_with_max_levels(
        reader: Arc<D>,
        root: Hash,
        max_levels: usize,
    ) -> ZkTrieResult<Self> {
        let mt = ZkTrie {
            reader,
            root_key: root,
            max_levels,
            dirty_index: 0,
            dirty_storage: HashMap::new(),
        };
        if !mt.root_key.is_zero() {
            mt.get_node(&mt.root_key)?;
        }
        Ok(mt)
    }

    /// The maximum path depth.
    pub fn max_levels(&self) -> usize {
        self.max_levels
    }

    /// The last committed root. Pending writes are not reflected until
    /// [`ZkTrie::root`] runs.
    pub fn committed_root(&self) -> Hash {
        self.root_key
    }

    /// A snapshot sharing the committed backend. The dirty layer is cloned,
    /// so mutations on either side stay invisible to the other.
    pub fn copy(&self) -> Self {
        ZkTrie {
            reader: Arc::clone(&self.reader),
            root_key: self.root_key,
            max_levels: self.max_levels,
            dirty_index: self.dirty_index,
            dirty_storage: self.dirty_storage.clone(),
        }
    }

    /// Resolves a node by hash: the zero hash is the empty node, then the
    /// dirty layer, then committed storage.
    pub fn get_node(&self, hash: &Hash) -> ZkTrieResult<Node> {
        if hash.is_zero() {
            return Ok(Node::Empty);
        }
        if let Some(n) = self.dirty_storage.get(hash) {
            return Ok(n.clone());
        }
        match self.reader.get(&hash.bytes())? {
            Some(bytes) => Node::from_bytes(&bytes),
            None => Err(ZkTrieError::KeyNotFound),
        }
    }

    fn is_dirty_node(&self, hash: &Hash) -> bool {
        self.dirty_storage.contains_key(hash)
    }

    fn new_dirty_node_key(&mut self) -> Hash {
        self.dirty_index += 1;
        Hash::from_bytes(&self.dirty_index.to_le_bytes())
    }

    fn add_dirty_node(&mut self, key: Hash, node: Node) -> ZkTrieResult<()> {
        match self.dirty_storage.get(&key) {
            Some(prev) if *prev != node => Err(ZkTrieError::NodeKeyAlreadyExists),
            _ => {
                self.dirty_storage.insert(key, node);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The flat value bytes stored under a raw key, or `None` when absent.
    pub fn get(&self, key: &[u8]) -> ZkTrieResult<Option<Vec<u8>>> {
        match self.get_leaf_node_by_key(key) {
            Ok(node) => Ok(node.data()),
            Err(ZkTrieError::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The leaf node stored under a raw key.
    pub fn get_leaf_node_by_key(&self, key: &[u8]) -> ZkTrieResult<Node> {
        self.get_leaf_node(&to_secure_key(key)?)
    }

    /// The leaf node stored under a secure key.
    pub fn get_leaf_node(&self, node_key: &Hash) -> ZkTrieResult<Node> {
        let path = get_path(self.max_levels, node_key);
        let mut next_key = self.root_key;
        let mut last_branch: Option<BranchType> = None;
        for lvl in 0..self.max_levels {
            let n = self.get_node(&next_key)?;
            if n.is_terminal() {
                if let Some(kind) = last_branch {
                    // The parent committed to this child being a branch.
                    let claimed_terminal = if path[lvl - 1] {
                        kind.right_is_terminal()
                    } else {
                        kind.left_is_terminal()
                    };
                    if !claimed_terminal {
                        return Err(ZkTrieError::InvalidNodeFound);
                    }
                }
            }
            match n {
                Node::Empty => return Err(ZkTrieError::KeyNotFound),
                Node::Leaf(ref leaf) => {
                    return if leaf.node_key == *node_key {
                        Ok(n)
                    } else {
                        Err(ZkTrieError::KeyNotFound)
                    };
                }
                Node::Branch(b) => {
                    last_branch = Some(b.kind);
                    next_key = if path[lvl] { b.child_right } else { b.child_left };
                }
            }
        }
        Err(ZkTrieError::ReachedMaxLevel)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Stores value chunks under a raw key, overwriting any previous value.
    /// The key preimage is kept on the leaf for witness consumers.
    pub fn update(
        &mut self,
        key: &[u8],
        compressed_flags: u32,
        value_preimage: Vec<Byte32>,
    ) -> ZkTrieResult<()> {
        trace!("update: key {}", hex::encode(key));
        let node_key = to_secure_key(key)?;
        self.insert_leaf(LeafNode {
            node_key,
            compressed_flags,
            value_preimage,
            key_preimage: Some(Byte32::from_bytes_padding_zero(key)?),
        })
    }

    /// Stores value chunks directly under a secure key.
    pub fn update_node_key(
        &mut self,
        node_key: &Hash,
        compressed_flags: u32,
        value_preimage: Vec<Byte32>,
    ) -> ZkTrieResult<()> {
        self.insert_leaf(LeafNode {
            node_key: *node_key,
            compressed_flags,
            value_preimage,
            key_preimage: None,
        })
    }

    fn insert_leaf(&mut self, leaf: LeafNode) -> ZkTrieResult<()> {
        let path = get_path(self.max_levels, &leaf.node_key);
        let root = self.root_key;
        if let (Some(new_root), _) = self.add_leaf(&leaf, &root, 0, &path)? {
            self.root_key = new_root;
        }
        Ok(())
    }

    /// Descends to the insertion point and rebuilds the path bottom-up in
    /// the dirty layer. Returns the new subtree key (`None` when the write
    /// was a no-op) and whether the subtree is terminal.
    fn add_leaf(
        &mut self,
        new_leaf: &LeafNode,
        curr: &Hash,
        lvl: usize,
        path: &[bool],
    ) -> ZkTrieResult<(Option<Hash>, bool)> {
        if lvl > self.max_levels - 1 {
            return Err(ZkTrieError::ReachedMaxLevel);
        }
        let n = self.get_node(curr)?;
        match n {
            Node::Empty => {
                let node = Node::Leaf(new_leaf.clone());
                let hash = node.node_hash()?;
                self.add_dirty_node(hash, node)?;
                Ok((Some(hash), true))
            }
            Node::Leaf(old_leaf) => {
                let node = Node::Leaf(new_leaf.clone());
                let new_leaf_hash = node.node_hash()?;
                if *curr == new_leaf_hash {
                    // The exact same leaf is already present.
                    Ok((None, true))
                } else if old_leaf.node_key == new_leaf.node_key {
                    self.add_dirty_node(new_leaf_hash, node)?;
                    Ok((Some(new_leaf_hash), true))
                } else {
                    let old_path = get_path(self.max_levels, &old_leaf.node_key);
                    let hash = self.push_leaf(new_leaf, &old_leaf, lvl, path, &old_path)?;
                    Ok((Some(hash), false))
                }
            }
            Node::Branch(b) => {
                let right = path[lvl];
                let child = if right { b.child_right } else { b.child_left };
                let (new_child, child_terminal) = self.add_leaf(new_leaf, &child, lvl + 1, path)?;
                let Some(new_child) = new_child else {
                    return Ok((None, false));
                };
                let kind = if child_terminal {
                    b.kind
                } else {
                    b.kind.deduce_upgrade(right)
                };
                let node = if right {
                    Node::branch(kind, b.child_left, new_child)
                } else {
                    Node::branch(kind, new_child, b.child_right)
                };
                let key = self.new_dirty_node_key();
                self.add_dirty_node(key, node)?;
                Ok((Some(key), false))
            }
        }
    }

    /// Grows a chain of branches until the paths of the colliding leaves
    /// diverge, then hangs both under a fresh both-terminal branch.
    fn push_leaf(
        &mut self,
        new_leaf: &LeafNode,
        old_leaf: &LeafNode,
        lvl: usize,
        path_new: &[bool],
        path_old: &[bool],
    ) -> ZkTrieResult<Hash> {
        if lvl > self.max_levels - 2 {
            return Err(ZkTrieError::ReachedMaxLevel);
        }
        let node = if path_new[lvl] == path_old[lvl] {
            let next = self.push_leaf(new_leaf, old_leaf, lvl + 1, path_new, path_old)?;
            if path_new[lvl] {
                Node::branch(BranchType::LeftTerminal, Hash::ZERO, next)
            } else {
                Node::branch(BranchType::RightTerminal, next, Hash::ZERO)
            }
        } else {
            let node = Node::Leaf(new_leaf.clone());
            let new_leaf_hash = node.node_hash()?;
            let old_leaf_hash = Node::Leaf(old_leaf.clone()).node_hash()?;
            self.add_dirty_node(new_leaf_hash, node)?;
            if path_new[lvl] {
                Node::branch(BranchType::BothTerminal, old_leaf_hash, new_leaf_hash)
            } else {
                Node::branch(BranchType::BothTerminal, new_leaf_hash, old_leaf_hash)
            }
        };
        let key = self.new_dirty_node_key();
        self.add_dirty_node(key, node)?;
        Ok(key)
    }

    /// Removes the leaf stored under a raw key. Deleting an absent key is a
    /// no-op.
    pub fn delete(&mut self, key: &[u8]) -> ZkTrieResult<()> {
        self.delete_node_key(&to_secure_key(key)?)
    }

    /// Removes the leaf stored under a secure key.
    pub fn delete_node_key(&mut self, node_key: &Hash) -> ZkTrieResult<()> {
        match self.get_leaf_node(node_key) {
            Ok(_) => {}
            Err(ZkTrieError::KeyNotFound) => return Ok(()),
            Err(e) => return Err(e),
        }
        trace!("delete: node key {node_key}");
        let path = get_path(self.max_levels, node_key);
        let root = self.root_key;
        let (new_root, _) = self.try_delete(&root, node_key, &path)?;
        self.root_key = new_root;
        Ok(())
    }

    /// Deletes along the path and rebuilds ancestors, collapsing a branch
    /// into its surviving child whenever both children are terminal and one
    /// of them became empty. Returns the new subtree key and whether the
    /// subtree is terminal.
    fn try_delete(
        &mut self,
        root_key: &Hash,
        node_key: &Hash,
        path: &[bool],
    ) -> ZkTrieResult<(Hash, bool)> {
        let n = self.get_node(root_key)?;
        match n {
            Node::Empty => Err(ZkTrieError::KeyNotFound),
            Node::Leaf(leaf) => {
                if leaf.node_key == *node_key {
                    Ok((Hash::ZERO, true))
                } else {
                    Err(ZkTrieError::KeyNotFound)
                }
            }
            Node::Branch(b) => {
                let right = path[0];
                let (child, sibling) = if right {
                    (b.child_right, b.child_left)
                } else {
                    (b.child_left, b.child_right)
                };
                let sibling_terminal = if right {
                    b.kind.left_is_terminal()
                } else {
                    b.kind.right_is_terminal()
                };
                let (new_child, child_terminal) = self.try_delete(&child, node_key, &path[1..])?;
                let (left, right_hash, left_terminal, right_terminal) = if right {
                    (sibling, new_child, sibling_terminal, child_terminal)
                } else {
                    (new_child, sibling, child_terminal, sibling_terminal)
                };
                if left_terminal && right_terminal {
                    if left.is_zero() {
                        return Ok((right_hash, true));
                    }
                    if right_hash.is_zero() {
                        return Ok((left, true));
                    }
                }
                let kind = BranchType::of(left_terminal, right_terminal);
                let key = self.new_dirty_node_key();
                self.add_dirty_node(key, Node::branch(kind, left, right_hash))?;
                Ok((key, false))
            }
        }
    }

    // ------------------------------------------------------------------
    // Commitment
    // ------------------------------------------------------------------

    /// Hashes all pending writes and returns the resulting root. Afterwards
    /// every dirty node is keyed by its real hash.
    pub fn root(&mut self) -> ZkTrieResult<Hash> {
        if self.dirty_index == 0 {
            return Ok(self.root_key);
        }
        let mut hashed = HashMap::new();
        let root = self.calc_commitment(&self.root_key, &mut hashed)?;
        trace!("commitment: {} dirty nodes under root {root}", hashed.len());
        self.root_key = root;
        self.dirty_index = 0;
        self.dirty_storage = hashed;
        Ok(root)
    }

    fn calc_commitment(
        &self,
        root_key: &Hash,
        out: &mut HashMap<Hash, Node>,
    ) -> ZkTrieResult<Hash> {
        if !self.is_dirty_node(root_key) {
            return Ok(*root_key);
        }
        match self.get_node(root_key)? {
            Node::Empty => Ok(Hash::ZERO),
            leaf @ Node::Leaf(_) => {
                let hash = leaf.node_hash()?;
                out.insert(hash, leaf);
                Ok(hash)
            }
            Node::Branch(mut b) => {
                let (left, right) = rayon::join(
                    || {
                        let mut m = HashMap::new();
                        let h = self.calc_commitment(&b.child_left, &mut m)?;
                        Ok::<_, ZkTrieError>((h, m))
                    },
                    || {
                        let mut m = HashMap::new();
                        let h = self.calc_commitment(&b.child_right, &mut m)?;
                        Ok::<_, ZkTrieError>((h, m))
                    },
                );
                let (left_hash, left_nodes) = left?;
                let (right_hash, right_nodes) = right?;
                out.extend(left_nodes);
                out.extend(right_nodes);
                b.child_left = left_hash;
                b.child_right = right_hash;
                let node = Node::Branch(b);
                let hash = node.node_hash()?;
                out.insert(hash, node);
                Ok(hash)
            }
        }
    }

    /// Commits pending writes, draining the dirty layer: returns the root
    /// and the node set `(hash, canonical bytes)` to persist, sorted by
    /// hash for deterministic batches.
    pub fn commit(&mut self) -> ZkTrieResult<(Hash, Vec<(Hash, Vec<u8>)>)> {
        let root = self.root()?;
        let mut nodes: Vec<(Hash, Vec<u8>)> = self
            .dirty_storage
            .drain()
            .map(|(hash, node)| (hash, node.canonical_value()))
            .collect();
        nodes.sort_by(|a, b| a.0.bytes().cmp(&b.0.bytes()));
        Ok((root, nodes))
    }

    // ------------------------------------------------------------------
    // Account and storage views
    // ------------------------------------------------------------------

    /// Stores an account record under an address.
    pub fn update_account(
        &mut self,
        address: Address,
        account: &StateAccount,
    ) -> ZkTrieResult<()> {
        let (flags, chunks) = account.marshal_fields();
        self.update(address.as_bytes(), flags, chunks)
    }

    /// Reads an account record, or `None` when the address is absent.
    pub fn get_account(&self, address: Address) -> ZkTrieResult<Option<StateAccount>> {
        match self.get(address.as_bytes())? {
            Some(bytes) => Ok(Some(StateAccount::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Removes an account record.
    pub fn delete_account(&mut self, address: Address) -> ZkTrieResult<()> {
        self.delete(address.as_bytes())
    }

    /// Stores a storage slot value (at most 32 bytes) as a single
    /// compressed chunk.
    pub fn update_storage(&mut self, key: &[u8], value: &[u8]) -> ZkTrieResult<()> {
        self.update(key, 1, vec![Byte32::from_bytes_padding_zero(value)?])
    }

    /// Reads a storage slot, or `None` when absent.
    pub fn get_storage(&self, key: &[u8]) -> ZkTrieResult<Option<Vec<u8>>> {
        self.get(key)
    }

    /// Removes a storage slot.
    pub fn delete_storage(&mut self, key: &[u8]) -> ZkTrieResult<()> {
        self.delete(key)
    }

    // ------------------------------------------------------------------
    // Proofs
    // ------------------------------------------------------------------

    /// Writes the Merkle path of a raw key into `proof_db` (node hash to
    /// witness bytes), terminated by the magic marker entry. Forces a
    /// commitment first.
    pub fn prove<P: ZktrieDatabase>(&mut self, key: &[u8], proof_db: &P) -> ZkTrieResult<()> {
        self.prove_with_deletion(
            key,
            0,
            &mut |hash, node| proof_db.put(&hash.bytes(), &node.bytes()),
            None,
        )?;
        proof_db.put(MAGIC_HASH, MAGIC_SMT_BYTES)
    }

    /// Like [`ZkTrie::prove`] with callbacks: `write_node` receives every
    /// visited node from `from_level` down, and `on_hit` fires once when
    /// the walk lands on the proven leaf, together with its sibling node
    /// when one can be resolved. The deletion tracer hooks in here.
    pub fn prove_with_deletion(
        &mut self,
        key: &[u8],
        from_level: usize,
        write_node: &mut dyn FnMut(&Hash, &Node) -> ZkTrieResult<()>,
        mut on_hit: Option<&mut dyn FnMut(&Node, Option<&Node>)>,
    ) -> ZkTrieResult<()> {
        let node_key = to_secure_key(key)?;
        // Witnesses refer to nodes by hash, so pending writes must be
        // hashed before the walk.
        self.root()?;
        let path = get_path(self.max_levels, &node_key);
        let mut nodes: Vec<(Hash, Node)> = Vec::new();
        let mut next_key = self.root_key;
        for bit in path.iter().take(self.max_levels) {
            let n = self.get_node(&next_key)?;
            let hash = next_key;
            let terminal = n.is_terminal();
            if let Node::Branch(b) = &n {
                next_key = if *bit { b.child_right } else { b.child_left };
            }
            nodes.push((hash, n));
            if terminal {
                break;
            }
        }

        let last = nodes.len().saturating_sub(1);
        for (lvl, (hash, node)) in nodes.iter().enumerate().skip(from_level) {
            if lvl == last {
                if let Node::Leaf(leaf) = node {
                    if leaf.node_key == node_key {
                        if let Some(cb) = on_hit.take() {
                            let sibling = self.proof_sibling(&nodes, lvl, hash);
                            cb(node, sibling.as_ref());
                        }
                    }
                }
            }
            write_node(hash, node)?;
        }
        Ok(())
    }

    fn proof_sibling(&self, nodes: &[(Hash, Node)], lvl: usize, leaf_hash: &Hash) -> Option<Node> {
        if lvl == 0 {
            return None;
        }
        let Node::Branch(parent) = &nodes[lvl - 1].1 else {
            return None;
        };
        let sibling_hash = if parent.child_left == *leaf_hash {
            parent.child_right
        } else {
            parent.child_left
        };
        self.get_node(&sibling_hash).ok()
    }
}
