//! labgrid-api — REST API for labgrid.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/globalresources/lock` | Claim a global resource for a job |
//! | DELETE | `/api/v1/globalresources/lock` | Release by job or by resource name |
//! | GET | `/api/v1/globalresources` | List global resources |
//! | GET | `/api/v1/globalresources/{name}` | Get one global resource |
//! | GET | `/api/v1/machines` | List machines (filters are comma-separated) |
//! | GET | `/api/v1/machines/{name}` | Machine status |
//! | GET | `/api/v1/sites` | List sites, optionally filtered by `flag` |
//! | GET | `/api/v1/sites/{name}` | Get one site |
//! | POST | `/api/v1/sites/{name}` | Update a site, including shared resources |
//! | GET | `/health` | Liveness |

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use labgrid_scheduler::{Inventory, LockService};
use labgrid_state::{StateStore, TableLocker};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub locks: Arc<LockService>,
    pub inventory: Inventory,
}

impl ApiState {
    /// Wire the services over one store, with the given lock wait.
    pub fn new(store: StateStore, lock_wait: Duration) -> Self {
        Self {
            locks: Arc::new(LockService::with_locker(
                store.clone(),
                TableLocker::new(),
                lock_wait,
            )),
            inventory: Inventory::new(store),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/globalresources/lock",
            post(handlers::claim_resource).delete(handlers::release_resource),
        )
        .route("/globalresources", get(handlers::list_resources))
        .route("/globalresources/{name}", get(handlers::get_resource))
        .route("/machines", get(handlers::list_machines))
        .route("/machines/{name}", get(handlers::get_machine))
        .route("/sites", get(handlers::list_sites))
        .route("/sites/{name}", get(handlers::get_site).post(handlers::update_site))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health))
}
