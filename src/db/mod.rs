//! Database layer: the `ChatStore` seam, its PostgreSQL and in-memory implementations.

mod memory;
mod pool;
mod repositories;
mod store;

pub use memory::MemoryStore;
pub use pool::{create_pool, DbPool};
pub use repositories::*;
pub use store::ChatStore;
