//! labgrid-scheduler — claims, releases and status reads.
//!
//! - **`lock_service`**: claims and releases pooled global resources under
//!   the table lock, choosing candidates with the constraint matcher.
//! - **`status`**: derives the public machine status from persisted state.
//! - **`inventory`**: machine and site queries, and site updates including
//!   shared-resource counters.
//!
//! # Architecture
//!
//! ```text
//! LockService
//!   ├── Locker (TableLocker; one lock for every resource type)
//!   └── StateStore (list candidates, compare-and-set idle → locked)
//! Inventory
//!   └── StateStore (lock-free reads; results may be stale)
//! ```

pub mod error;
pub mod inventory;
pub mod lock_service;
pub mod status;

pub use error::{SchedulerError, SchedulerResult};
pub use inventory::{Inventory, MachineFilter, SiteUpdate, merge_shared_resources};
pub use lock_service::{Claim, ClaimRequest, DEFAULT_LOCK_WAIT, LockService, ReleaseRequest, ReleaseTarget};
pub use status::{MachineStatus, PublicStatus, derive_public_status};
