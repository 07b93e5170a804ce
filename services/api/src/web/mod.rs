pub mod rest;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use rest::{
    activate_group_handler, generate_sessions_handler, get_credits_handler, get_session_handler,
    list_group_sessions_handler, list_ledger_handler, submit_attendance_handler,
};
use state::AppState;

/// Every REST route, bound to the shared state. CORS and Swagger UI are layered
/// on by the binary.
pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/groups/{group_id}/sessions",
            post(generate_sessions_handler).get(list_group_sessions_handler),
        )
        .route("/groups/{group_id}/activate", post(activate_group_handler))
        .route("/sessions/{session_id}", get(get_session_handler))
        .route(
            "/sessions/{session_id}/attendance",
            post(submit_attendance_handler),
        )
        .route("/students/{student_id}/credits", get(get_credits_handler))
        .route("/students/{student_id}/ledger", get(list_ledger_handler))
        .with_state(app_state)
}
