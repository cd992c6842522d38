//! labgrid-state — persistence for machines, sites and pooled resources.
//!
//! Backed by [redb](https://docs.rs/redb). Every record type lives in its own
//! table keyed by name, with the record JSON-serialized into the value column.
//! Iteration follows key order, so listings come back sorted by name.
//!
//! The crate also provides the table lock that serializes claim and release
//! of global resources ([`lock`]).
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod lock;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{LockError, LockResult, StateError, StateResult};
pub use lock::{LockContext, Locker, TableLocker};
pub use store::StateStore;
pub use types::*;
