//! The account record stored under an address in the state trie.

use ethereum_types::{H256, U256};
use serde::{Deserialize, Serialize};

use crate::byte32::Byte32;
use crate::trie::{ZkTrieError, ZkTrieResult};

/// An Ethereum-style account, marshaled into four value chunks:
/// `code_size || nonce` packed into one chunk, then the balance, the
/// storage root and the code hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAccount {
    /// Transaction count of the account.
    pub nonce: u64,
    /// Byte size of the deployed code.
    pub code_size: u64,
    /// Balance in wei.
    pub balance: U256,
    /// Root of the account's storage trie.
    pub storage_root: H256,
    /// Hash of the deployed code.
    pub code_hash: H256,
}

/// Chunks 1..=3 hold 256-bit values that may not fit the field, so they are
/// compressed; chunk 0 only carries two 64-bit counters and stays raw.
const COMPRESSION_FLAGS: u32 = 0b1110;

const MARSHALLED_LEN: usize = 4 * 32;

impl StateAccount {
    /// The compression flags and value chunks this account is stored as.
    pub fn marshal_fields(&self) -> (u32, Vec<Byte32>) {
        let mut chunk0 = [0u8; 32];
        chunk0[16..24].copy_from_slice(&self.code_size.to_be_bytes());
        chunk0[24..32].copy_from_slice(&self.nonce.to_be_bytes());
        let mut balance = [0u8; 32];
        self.balance.to_big_endian(&mut balance);
        let chunks = vec![
            Byte32::from(chunk0),
            Byte32::from(balance),
            Byte32::from(self.storage_root.0),
            Byte32::from(self.code_hash.0),
        ];
        (COMPRESSION_FLAGS, chunks)
    }

    /// Parses an account from the flat value bytes of its leaf.
    pub fn from_bytes(b: &[u8]) -> ZkTrieResult<Self> {
        if b.len() != MARSHALLED_LEN {
            return Err(ZkTrieError::NodeBytesBadSize);
        }
        let code_size = u64::from_be_bytes(b[16..24].try_into().map_err(|_| ZkTrieError::NodeBytesBadSize)?);
        let nonce = u64::from_be_bytes(b[24..32].try_into().map_err(|_| ZkTrieError::NodeBytesBadSize)?);
        Ok(StateAccount {
            nonce,
            code_size,
            balance: U256::from_big_endian(&b[32..64]),
            storage_root: H256::from_slice(&b[64..96]),
            code_hash: H256::from_slice(&b[96..128]),
        })
    }
}
