use crate::models::ActionKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// Per-(entity id, action) quiescence window.
///
/// An invocation is accepted when no accepted invocation for the same key
/// happened within the window. Rejected invocations do not extend the window.
#[derive(Debug, Clone)]
pub struct ActionGuard {
    window: Duration,
    last_accepted: Arc<Mutex<HashMap<(String, ActionKind), Instant>>>,
}

impl ActionGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn try_acquire(&self, entity_id: &str, action: ActionKind) -> bool {
        let now = Instant::now();
        let mut last_accepted = self
            .last_accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // keep the map bounded to keys that can still reject something
        last_accepted.retain(|_, at| now.duration_since(*at) < self.window);

        let key = (entity_id.to_string(), action);
        if last_accepted.contains_key(&key) {
            return false;
        }
        last_accepted.insert(key, now);
        true
    }
}
