pub mod auth;
pub mod health;
pub mod sync;

use crate::AppState;
use axum::Router;

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/sync", sync::router())
}
