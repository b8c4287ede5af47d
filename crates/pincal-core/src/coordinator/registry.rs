//! Process-wide map of calendar sessions

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::SharedRepo;
use crate::config::CoordinatorConfig;
use crate::repo::DocumentStorage;
use crate::types::CalendarId;

/// Lazily creates exactly one [`SharedRepo`] per calendar
pub struct SessionRegistry {
    config: CoordinatorConfig,
    storage: Option<DocumentStorage>,
    sessions: Mutex<HashMap<CalendarId, Arc<SharedRepo>>>,
}

impl SessionRegistry {
    pub fn new(config: CoordinatorConfig, storage: Option<DocumentStorage>) -> Self {
        Self {
            config,
            storage,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The session for `calendar_id`, created on first use
    pub fn get_or_create(&self, calendar_id: CalendarId) -> Arc<SharedRepo> {
        self.sessions
            .lock()
            .entry(calendar_id)
            .or_insert_with(|| {
                info!(calendar = %calendar_id, "Creating shared repo session");
                Arc::new(SharedRepo::new(
                    calendar_id,
                    self.config.clone(),
                    self.storage.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, calendar_id: &CalendarId) -> Option<Arc<SharedRepo>> {
        self.sessions.lock().get(calendar_id).cloned()
    }

    pub fn calendar_ids(&self) -> Vec<CalendarId> {
        let mut ids: Vec<_> = self.sessions.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_session_per_calendar() {
        let registry = SessionRegistry::new(CoordinatorConfig::default(), None);
        let a = CalendarId::new();
        let b = CalendarId::new();

        let first = registry.get_or_create(a);
        let again = registry.get_or_create(a);
        assert!(Arc::ptr_eq(&first, &again));

        let other = registry.get_or_create(b);
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.calendar_ids().len(), 2);
        assert!(registry.get(&CalendarId::new()).is_none());
    }
}
