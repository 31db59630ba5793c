use std::sync::Arc;

use crate::tasks::TaskRegistry;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub tasks: TaskRegistry,
    /// Required value of the x-api-key header, None disables the check
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            tasks: TaskRegistry::new(),
            api_key: api_key.filter(|key| !key.is_empty()).map(Arc::from),
        }
    }
}
