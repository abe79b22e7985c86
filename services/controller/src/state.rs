//! Application state shared across request handlers.

use std::sync::Arc;

use crate::actions::Actions;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    actions: Actions,
}

impl AppState {
    pub fn new(actions: Actions) -> Self {
        Self {
            inner: Arc::new(AppStateInner { actions }),
        }
    }

    /// Object verbs and sub-resource actions.
    pub fn actions(&self) -> &Actions {
        &self.inner.actions
    }
}
