use std::sync::Arc;

use crate::db::JobStore;
use crate::services::jobs::JobService;
use crate::services::supervisor::{SupervisorSettings, WorkerSupervisor};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: JobService,
}

impl AppState {
    pub fn new(store: JobStore, settings: SupervisorSettings) -> Self {
        let store = Arc::new(store);
        let supervisor = WorkerSupervisor::new(store.clone(), settings);
        Self {
            jobs: JobService::new(store, supervisor),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        self.jobs.store()
    }
}
