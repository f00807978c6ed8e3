//! Partitioned RNG: independent named sub-streams derived from one seed
//! (spec.md §4.2).
//!
//! Each subsystem owns a named stream (`"routing"`, `"latency"`, ...) and
//! must never reach for another subsystem's stream — that is what keeps
//! adding randomness to one policy from perturbing another's output
//! (INV-6). The derivation is a keyed BLAKE3 hash of the stream name under
//! a key built from the master seed, which is the same "fork a sub-RNG from
//! a master seed plus a label" idiom used for per-replica determinism in
//! discrete-event simulators generally.

use rand::SeedableRng;
use rand::rngs::StdRng;

/// Holds the master seed and vends independent [`StdRng`] streams.
#[derive(Debug, Clone, Copy)]
pub struct PartitionedRng {
    seed: u64,
}

impl PartitionedRng {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Derives a deterministic, independent RNG stream for `name`.
    ///
    /// Calling this twice with the same `name` yields two RNGs that produce
    /// the same sequence (each call reseeds from the same derived key).
    /// Callers that need one evolving stream must hold onto the returned
    /// value rather than re-deriving it.
    pub fn stream(&self, name: &str) -> StdRng {
        let key = stream_key(self.seed, name);
        StdRng::from_seed(key)
    }
}

fn stream_key(seed: u64, name: &str) -> [u8; 32] {
    let mut keyed = [0u8; 32];
    let seed_hash = blake3::hash(&seed.to_le_bytes());
    keyed.copy_from_slice(seed_hash.as_bytes());
    *blake3::keyed_hash(&keyed, name.as_bytes()).as_bytes()
}
