use std::sync::Arc;

use crate::pipeline::Guard;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<Guard>,
}

impl AppState {
    pub fn new(guard: Arc<Guard>) -> Self {
        Self { guard }
    }
}
