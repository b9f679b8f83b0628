//! A fixed 32-byte chunk of leaf value data.
//!
//! Arbitrary values stored in the trie are split into [`Byte32`] chunks. A
//! chunk either fits the field directly (its four `u64` limbs are all
//! canonical) or has to be compressed through Poseidon first; the leaf's
//! compression flags record which treatment each chunk received.

use serde::{Deserialize, Serialize};

use crate::hash::{self, Hash, F, HASH_BYTE_LEN};
use crate::trie::{ZkTrieError, ZkTrieResult};

use plonky2::field::types::{Field, Field64};
use plonky2::hash::poseidon::Poseidon;

/// A 32-byte big-endian value chunk.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Byte32([u8; 32]);

impl Byte32 {
    /// Wraps a value shorter than or equal to 32 bytes, left-aligned and
    /// zero-padded on the right.
    pub fn from_bytes(b: &[u8]) -> ZkTrieResult<Self> {
        if b.len() > 32 {
            return Err(ZkTrieError::NodeBytesBadSize);
        }
        let mut out = [0u8; 32];
        out[..b.len()].copy_from_slice(b);
        Ok(Byte32(out))
    }

    /// Wraps a value shorter than or equal to 32 bytes, right-aligned and
    /// zero-padded on the left. This is the numeric interpretation used for
    /// key preimages.
    pub fn from_bytes_padding_zero(b: &[u8]) -> ZkTrieResult<Self> {
        if b.len() > 32 {
            return Err(ZkTrieError::NodeBytesBadSize);
        }
        let mut out = [0u8; 32];
        out[32 - b.len()..].copy_from_slice(b);
        Ok(Byte32(out))
    }

    /// The raw bytes.
    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Poseidon over the eight 32-bit limbs of the chunk. Always succeeds
    /// since a `u32` limb is trivially canonical.
    pub fn hash(&self) -> Hash {
        let mut state = [F::ZERO; 12];
        for (j, slot) in state[..8].iter_mut().enumerate() {
            let start = 32 - 4 * (j + 1);
            *slot = F::from_canonical_u32(u32::from_be_bytes(
                self.0[start..start + 4].try_into().unwrap(),
            ));
        }
        state[8] = F::from_canonical_u64(hash::DOMAIN_BYTE32);
        Hash(F::poseidon(state)[..4].try_into().unwrap())
    }

    /// Reinterprets the chunk as four `u64` limbs of a [`Hash`], failing with
    /// [`ZkTrieError::InvalidField`] when any limb is not canonical.
    pub fn as_field_element(&self) -> ZkTrieResult<Hash> {
        let mut limbs = [F::ZERO; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let start = HASH_BYTE_LEN - 8 * (i + 1);
            let raw = u64::from_be_bytes(self.0[start..start + 8].try_into().unwrap());
            if raw >= F::ORDER {
                return Err(ZkTrieError::InvalidField);
            }
            *limb = F::from_canonical_u64(raw);
        }
        Ok(Hash(limbs))
    }
}

impl From<[u8; 32]> for Byte32 {
    fn from(b: [u8; 32]) -> Self {
        Byte32(b)
    }
}
