//! The field-element hash primitive all trie hashing is built on.
//!
//! A [`Hash`] is four Goldilocks elements (32 bytes serialized), produced by
//! the Poseidon permutation over 1-2 inputs at a time. The same digest type
//! doubles as the content address of a committed node.

use core::fmt;

use plonky2::field::goldilocks_field::GoldilocksField;
use plonky2::field::types::{Field, Field64, PrimeField64};
use plonky2::hash::poseidon::Poseidon;
use serde::{Deserialize, Serialize};

use crate::trie::{ZkTrieError, ZkTrieResult};

/// The field over which all trie hashing is performed.
pub type F = GoldilocksField;

/// Byte length of a serialized [`Hash`].
pub const HASH_BYTE_LEN: usize = 32;

/// The number of least significant bytes in a secure key that are considered
/// valid to address a leaf node, bounding the maximum trie depth to
/// `NODE_KEY_VALID_BYTES * 8`.
///
/// The secure key is a hash output and does not fully occupy a power-of-two
/// range, so its highest bits have an ambiguous representation in the field.
/// That ambiguity would be a soundness issue inside the circuit; truncating
/// the addressable key width avoids it.
pub const NODE_KEY_VALID_BYTES: usize = 31;

/// Maximum path depth of the trie.
pub const MAX_LEVELS: usize = NODE_KEY_VALID_BYTES * 8;

/// Domain of the Poseidon capacity when hashing a [`Byte32`] chunk.
///
/// [`Byte32`]: crate::byte32::Byte32
pub(crate) const DOMAIN_BYTE32: u64 = 0;

/// Domain of the Poseidon capacity when hashing a leaf, so that
/// `leaf = H(1, node_key, value_hash)`.
pub(crate) const DOMAIN_LEAF: u64 = 1;

/// Domain of the Poseidon capacity when folding multiple value chunks into a
/// single value hash.
pub(crate) const DOMAIN_VALUE_FOLD: u64 = 2;

/// A 32-byte value that always lies inside the prime field.
///
/// `Hash([F::ZERO; 4])` (exposed as [`Hash::ZERO`]) denotes the empty
/// subtree and is never stored.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [F; 4]);

impl Hash {
    /// The hash of the empty subtree.
    pub const ZERO: Self = Hash([F::ZERO; 4]);

    /// Returns whether this is the empty-subtree hash.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|x| x.is_zero())
    }

    /// The canonical byte form: four little-endian `u64` limbs.
    pub fn bytes(&self) -> [u8; HASH_BYTE_LEN] {
        let mut out = [0u8; HASH_BYTE_LEN];
        for (i, limb) in self.0.iter().enumerate() {
            out[8 * i..8 * (i + 1)].copy_from_slice(&limb.to_canonical_u64().to_le_bytes());
        }
        out
    }

    /// Builds a hash from up to 32 bytes, zero-extending and reducing each
    /// limb into the field.
    pub fn from_bytes(b: &[u8]) -> Self {
        let mut padded = [0u8; HASH_BYTE_LEN];
        let n = b.len().min(HASH_BYTE_LEN);
        padded[..n].copy_from_slice(&b[..n]);
        Hash(core::array::from_fn(|i| {
            F::from_noncanonical_u64(u64::from_le_bytes(
                padded[8 * i..8 * (i + 1)].try_into().unwrap(),
            ))
        }))
    }

    /// Builds a hash from exactly 32 bytes, rejecting any limb that is not a
    /// canonical field element.
    pub fn from_checked_bytes(b: &[u8]) -> ZkTrieResult<Self> {
        if b.len() != HASH_BYTE_LEN {
            return Err(ZkTrieError::NodeBytesBadSize);
        }
        let mut limbs = [F::ZERO; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let raw = u64::from_le_bytes(b[8 * i..8 * (i + 1)].try_into().unwrap());
            if raw >= F::ORDER {
                return Err(ZkTrieError::InvalidField);
            }
            *limb = F::from_canonical_u64(raw);
        }
        Ok(Hash(limbs))
    }

    /// Bit `i` of the key, little-endian over the limb bytes. Drives the
    /// left/right choice at level `i` of the path.
    pub(crate) fn bit(&self, i: usize) -> bool {
        debug_assert!(i < 4 * 64);
        (self.0[i / 64].to_canonical_u64() >> (i % 64)) & 1 == 1
    }

    /// Hex encoding of the canonical byte form.
    pub fn hex(&self) -> String {
        hex::encode(self.bytes())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// Returns the first four Poseidon output limbs over the eight input limbs
/// of `lhs || rhs`, with `domain` in the first capacity slot.
///
/// Terminal and non-terminal children of a branch are hashed under different
/// domains, which is what lets a proof verifier reconstruct ancestor hashes
/// without extra lookups.
pub fn hash_elems_with_domain(domain: u64, lhs: &Hash, rhs: &Hash) -> Hash {
    let mut state = [F::ZERO; 12];
    state[..4].copy_from_slice(&lhs.0);
    state[4..8].copy_from_slice(&rhs.0);
    state[8] = F::from_canonical_u64(domain);
    Hash(F::poseidon(state)[..4].try_into().unwrap())
}

/// The hash of a leaf: `H(1, node_key, value_hash)`.
pub fn leaf_hash(node_key: &Hash, value_hash: &Hash) -> Hash {
    hash_elems_with_domain(DOMAIN_LEAF, node_key, value_hash)
}

/// The binary path from the root towards the leaf addressed by `k`.
pub(crate) fn get_path(num_levels: usize, k: &Hash) -> Vec<bool> {
    (0..num_levels).map(|i| k.bit(i)).collect()
}
