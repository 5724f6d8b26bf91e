//! keel-api — REST API for keel.
//!
//! Parent resources can be written and deleted through the API; child
//! objects and controller state are read-only.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/status` | Keyspace revision and compaction boundary |
//! | GET | `/api/v1/resources/{kind}` | List parents of a kind |
//! | PUT | `/api/v1/resources/{kind}/{namespace}/{name}` | Create or replace a parent |
//! | GET | `/api/v1/resources/{kind}/{namespace}/{name}` | Get a parent |
//! | DELETE | `/api/v1/resources/{kind}/{namespace}/{name}` | Delete a parent |
//! | GET | `/api/v1/resources/{kind}/{namespace}/{name}/children` | Get a parent's children |
//! | GET | `/api/v1/checkpoints` | Checkpoint revision per kind |
//! | GET | `/api/v1/orphans` | Recent `OrphanDetected` records |
//! | GET | `/api/v1/phases` | Reconcile phase per key |

pub mod handlers;

use axum::Router;
use axum::routing::get;
use keel_controller::Diagnostics;
use keel_state::Keyspace;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub keyspace: Keyspace,
    pub diagnostics: Diagnostics,
}

/// Build the complete API router.
pub fn build_router(keyspace: Keyspace, diagnostics: Diagnostics) -> Router {
    let state = ApiState {
        keyspace,
        diagnostics,
    };

    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/resources/{kind}", get(handlers::list_resources))
        .route(
            "/resources/{kind}/{namespace}/{name}",
            get(handlers::get_resource)
                .put(handlers::put_resource)
                .delete(handlers::delete_resource),
        )
        .route(
            "/resources/{kind}/{namespace}/{name}/children",
            get(handlers::get_children),
        )
        .route("/checkpoints", get(handlers::list_checkpoints))
        .route("/orphans", get(handlers::list_orphans))
        .route("/phases", get(handlers::list_phases))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
