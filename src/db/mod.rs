//! Transactional metadata store: entries, files, directories, vaults,
//! cache index, sync events. Grounded on the teacher's `database.rs`
//! (`HasChild`/`Type` tables, transactional add/remove, readdir shape)
//! generalized to the full relational schema named in the persisted
//! state layout, and on `include/db/Transactions.hpp` /
//! `include/db/DBPool.hpp` for the pooled-connection contract.

pub mod pool;
pub mod queries;
pub mod schema;

pub use pool::Pool;
