//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use class_scheduler_core::SchedulerService;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<SchedulerService>,
}
