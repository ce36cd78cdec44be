//! Memory substrate for the mnemos recall engine.
//!
//! Provides the storage-facing half of the engine:
//! - **Store** (SQLite + FTS5): conversation turns, keyword search, stored
//!   embeddings and reinforcement metadata, behind the `MemoryStore` trait
//! - **Connection pool**: bounded checkout of store handles shared by
//!   concurrent recalls
//! - **Embedding cache**: in-memory LRU in front of a persistent SQLite tier
//!
//! Opening a store quarantines a corrupt write-ahead log instead of failing.

pub mod embedding_cache;
pub mod migration;
pub mod open;
pub mod pool;
pub mod store;

pub use embedding_cache::{DiskCache, EmbeddingCache};
pub use pool::{ConnectionPool, Pool, PooledConnection};
pub use store::SqliteMemoryStore;
