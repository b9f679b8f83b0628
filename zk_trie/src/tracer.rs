//! Deletion-proof tracing.
//!
//! When a block deletes trie entries, the circuit needs witnesses for the
//! siblings that surviving subtrees get collapsed into. The tracer records
//! the Merkle path of every proven key, marks the keys that were deleted,
//! and afterwards walks the recorded paths bottom-up to emit exactly the
//! sibling nodes a verifier must know about.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};

use crate::db::ZktrieDatabase;
use crate::hash::Hash;
use crate::node::Node;
use crate::proof::{MAGIC_HASH, MAGIC_SMT_BYTES};
use crate::trie::{ZkTrie, ZkTrieError, ZkTrieResult};

/// Collects deletion witnesses over a committed trie snapshot.
///
/// Paths are keyed by the raw key bytes they were proven for, in sorted
/// order so witness emission is deterministic.
#[derive(Debug)]
pub struct ProofTracer<D> {
    trie: ZkTrie<D>,
    /// Hashes known to vanish: the empty hash plus every marked leaf, plus
    /// branches whose children have all vanished.
    deletion_tracer: HashSet<Hash>,
    raw_paths: BTreeMap<Vec<u8>, Vec<Node>>,
    empty_term_paths: BTreeMap<Vec<u8>, Vec<Node>>,
}

impl<D: ZktrieDatabase> ZkTrie<D> {
    /// Starts a tracer over the current state, committing pending writes
    /// first. The tracer works on a snapshot, so the source trie can keep
    /// mutating.
    pub fn new_proof_tracer(&mut self) -> ZkTrieResult<ProofTracer<D>> {
        self.root()?;
        Ok(ProofTracer::new(self.copy()))
    }
}

impl<D: ZktrieDatabase> ProofTracer<D> {
    /// Wraps a committed trie snapshot.
    pub fn new(trie: ZkTrie<D>) -> Self {
        let mut deletion_tracer = HashSet::new();
        deletion_tracer.insert(Hash::ZERO);
        ProofTracer {
            trie,
            deletion_tracer,
            raw_paths: BTreeMap::new(),
            empty_term_paths: BTreeMap::new(),
        }
    }

    /// Proves a key into `proof_db` like [`ZkTrie::prove`], additionally
    /// recording the visited path for later deletion marking.
    pub fn prove<P: ZktrieDatabase>(&mut self, key: &[u8], proof_db: &P) -> ZkTrieResult<()> {
        let mpt_path: RefCell<Vec<Node>> = RefCell::new(Vec::new());
        let raw_paths = &mut self.raw_paths;
        let empty_term_paths = &mut self.empty_term_paths;

        let mut write_node = |hash: &Hash, node: &Node| -> ZkTrieResult<()> {
            match node {
                Node::Branch(_) => mpt_path.borrow_mut().push(node.clone()),
                Node::Empty => {
                    let mut path = mpt_path.borrow_mut();
                    path.push(Node::Empty);
                    empty_term_paths.insert(key.to_vec(), path.clone());
                }
                Node::Leaf(_) => {}
            }
            proof_db.put(&hash.bytes(), &node.bytes())
        };
        let mut on_hit = |node: &Node, _sibling: Option<&Node>| {
            let mut path = mpt_path.borrow_mut();
            path.push(node.clone());
            raw_paths.insert(key.to_vec(), path.clone());
        };
        self.trie
            .prove_with_deletion(key, 0, &mut write_node, Some(&mut on_hit))?;
        proof_db.put(MAGIC_HASH, MAGIC_SMT_BYTES)
    }

    /// Marks a previously proven key as deleted.
    ///
    /// A path that ended in an empty node is promoted into the raw set so
    /// its ancestors still take part in witness emission; a path that ended
    /// in a leaf adds the leaf's hash to the deletion set.
    pub fn mark_deletion(&mut self, key: &[u8]) -> ZkTrieResult<()> {
        if let Some(path) = self.empty_term_paths.remove(key) {
            self.raw_paths.insert(key.to_vec(), path);
            return Ok(());
        }
        let Some(path) = self.raw_paths.get(key) else {
            return Ok(());
        };
        match path.last() {
            Some(leaf @ Node::Leaf(_)) => {
                let hash = leaf.node_hash()?;
                self.deletion_tracer.insert(hash);
                Ok(())
            }
            _ => Err(ZkTrieError::InvalidNodeFound),
        }
    }

    /// Merges the markings of another tracer built over the same root.
    pub fn merge(&mut self, other: ProofTracer<D>) -> ZkTrieResult<()> {
        if self.trie.committed_root() != other.trie.committed_root() {
            return Err(ZkTrieError::TracerRootMismatch);
        }
        self.deletion_tracer.extend(other.deletion_tracer);
        self.raw_paths.extend(other.raw_paths);
        self.empty_term_paths.extend(other.empty_term_paths);
        Ok(())
    }

    /// Emits the witness bytes of every sibling a deletion collapses into
    /// its parent, de-duplicated and ordered by sibling hash.
    ///
    /// Each recorded path is walked bottom-up, skipping the terminal node.
    /// A branch whose children have both vanished vanishes itself; a branch
    /// with exactly one vanished child contributes its surviving sibling and
    /// ends the walk; a branch with two survivors needs no witness.
    pub fn get_deletion_proofs(&mut self) -> ZkTrieResult<Vec<Vec<u8>>> {
        let mut out: BTreeMap<[u8; 32], Vec<u8>> = BTreeMap::new();
        for path in self.raw_paths.values() {
            let Some((_terminal, branches)) = path.split_last() else {
                continue;
            };
            for node in branches.iter().rev() {
                let Node::Branch(b) = node else {
                    return Err(ZkTrieError::InvalidNodeFound);
                };
                let left_deleted = self.deletion_tracer.contains(&b.child_left);
                let right_deleted = self.deletion_tracer.contains(&b.child_right);
                if left_deleted && right_deleted {
                    self.deletion_tracer.insert(node.node_hash()?);
                    continue;
                }
                if left_deleted || right_deleted {
                    let sibling_hash = if left_deleted {
                        b.child_right
                    } else {
                        b.child_left
                    };
                    let sibling = self.trie.get_node(&sibling_hash)?;
                    if !matches!(sibling, Node::Empty) {
                        out.insert(sibling_hash.bytes(), sibling.bytes());
                    }
                }
                break;
            }
        }
        Ok(out.into_values().collect())
    }
}
