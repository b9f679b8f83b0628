//! A zk-friendly sparse binary Merkle trie.
//!
//! The trie commits to a key-value state with Poseidon hashes over the
//! Goldilocks field, keeping every digest a valid tuple of field elements so
//! circuits can verify paths without bit tricks. Keys are hashed into
//! "secure keys" whose bits drive the left/right descent; branches record
//! the terminality of their children and hash under a matching domain, which
//! keeps proofs self-contained.
//!
//! Mutations are buffered and hashed lazily: [`trie::ZkTrie::root`] and
//! [`trie::ZkTrie::commit`] perform one parallel hashing pass over the
//! touched subtrees. [`proof`] builds and verifies Merkle proofs, and
//! [`tracer::ProofTracer`] collects the extra sibling witnesses deletions
//! need.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]

pub mod account;
pub mod byte32;
pub mod db;
pub mod hash;
pub mod node;
pub mod proof;
pub mod tracer;
pub mod trie;

#[cfg(test)]
mod proof_test;
