//! Shared application state for the health server.

use std::sync::Arc;

use herald_postal::queue::JobQueue;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub instance_index: u32,
    pub worker_count: u32,
}

impl AppState {
    pub fn new(queue: Arc<dyn JobQueue>, instance_index: u32, worker_count: u32) -> Self {
        Self {
            queue,
            instance_index,
            worker_count,
        }
    }
}
