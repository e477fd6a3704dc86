// routes.rs
use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::state::AppState;

pub fn create_routes(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/polls",
            get(handlers::list_polls).post(handlers::create_poll),
        )
        .route(
            "/polls/{poll_id}",
            get(handlers::get_poll).delete(handlers::delete_poll),
        )
        .route("/polls/{poll_id}/vote", post(handlers::vote))
        .route("/polls/{poll_id}/results", get(handlers::get_results))
        .route("/polls/{poll_id}/voted", get(handlers::check_vote));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .with_state(state)
}
