pub mod block;
pub mod single_tier;
pub mod tiered;

pub use block::{chained_block_hashes, chained_block_hashes_from, KvBlock, Tier};
pub use single_tier::{AllocOutcome, KvStore, SingleTierKvCache, SlotId};
pub use tiered::{PendingLatency, TieredKvCache};
