//! KV cache blocks and chained prefix hashing (spec.md §4.3).
//!
//! Block `i`'s hash is `H(blockHash[i-1] || tokens[i*B:(i+1)*B])`, with
//! `blockHash[-1] = 0`. Identical prefixes across requests therefore hash to
//! an identical chain, which is what makes cross-request prefix reuse work:
//! two requests sharing the first `k` blocks of input produce the same `k`
//! hash values regardless of what follows.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Fixed-size slab of simulated GPU (or CPU, once tiered) memory holding
/// `block_size_in_tokens` tokens of attention state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvBlock {
    pub hash: u64,
    pub refcount: u32,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Gpu,
    Cpu,
}

impl KvBlock {
    pub fn new(hash: u64, tier: Tier) -> Self {
        Self {
            hash,
            refcount: 1,
            tier,
        }
    }
}

/// Computes the chained block hashes for a request's input, one hash per
/// full `block_size` chunk of `token_ids`. The final partial chunk (if any)
/// is not hashed — it has no stable identity until it's complete, matching
/// the intent that only whole blocks participate in prefix caching.
///
/// `token_ids` is a caller-supplied proxy for actual token content: BLIS
/// does not model real token vocabularies, so identical-content requests
/// are represented by identical `token_ids` slices (typically derived from
/// a request's `prefix_group` name, see `blis-workload`).
pub fn chained_block_hashes(token_ids: &[u64], block_size: usize) -> Vec<u64> {
    chained_block_hashes_from(0, token_ids, block_size)
}

/// Like [`chained_block_hashes`], but continues the chain from `prev`
/// instead of starting at 0. Used to hash additional blocks for a request
/// that already holds some prefix of blocks allocated (see
/// `kv::single_tier::SingleTierKvCache::try_allocate`).
pub fn chained_block_hashes_from(prev: u64, token_ids: &[u64], block_size: usize) -> Vec<u64> {
    assert!(block_size > 0, "block_size must be positive");
    let mut hashes = Vec::with_capacity(token_ids.len() / block_size);
    let mut prev = prev;
    for chunk in token_ids.chunks(block_size) {
        if chunk.len() < block_size {
            break;
        }
        let mut bytes = Vec::with_capacity(8 + chunk.len() * 8);
        bytes.extend_from_slice(&prev.to_le_bytes());
        for t in chunk {
            bytes.extend_from_slice(&t.to_le_bytes());
        }
        let h = xxh3_64_with_seed(&bytes, 0);
        hashes.push(h);
        prev = h;
    }
    hashes
}
