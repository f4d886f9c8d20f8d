//! Storage synchronization: reconciles a vault's local cache/mirror
//! against its S3 backing under one of three policies (Cache, Safe,
//! Mirror), producing a recorded `SyncEvent` per run. Split into a
//! pure plan-construction half (`plan`) and an I/O-performing execution
//! half (`engine`) so the conflict-resolution and phase-ordering rules
//! can be unit tested without a database or network.

pub mod engine;
pub mod plan;

pub use engine::{SyncEngine, MIN_FREE_SPACE};
pub use plan::{Action, ActionKind, ActionPlan, LocalFile, Phase, RemoteFile};
