//! Key-value store access.
//!
//! ```text
//! accessor / listener → KvClient ─┬─ Redis (deadpool pool, RedisJSON, MULTI/EXEC batches)
//!                                 └─ Memory (DashMap, tokio clock expiry)
//! ```

pub mod backend;
pub mod memory;
pub mod pipeline;

pub use backend::KvClient;
pub use memory::MemoryStore;
pub use pipeline::{KvReply, Pipeline};
