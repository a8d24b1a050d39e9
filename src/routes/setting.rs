//! Setting ingestion routes: POST replaces, GET lists, per setting table.

use crate::handlers::setting::{get_apis, get_sources, get_templates, post_apis, post_sources, post_templates};
use crate::state::AppState;
use axum::{routing::post, Router};

pub fn setting_routes(state: AppState) -> Router {
    Router::new()
        .route("/_setting/apis", post(post_apis).get(get_apis))
        .route("/_setting/sources", post(post_sources).get(get_sources))
        .route("/_setting/templates", post(post_templates).get(get_templates))
        .with_state(state)
}
