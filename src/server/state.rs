use axum::extract::FromRef;

use crate::background_jobs::TaskScheduler;
use crate::library_store::LibraryStore;
use crate::resilience::BreakerRegistry;
use std::sync::Arc;
use std::time::Instant;

pub type GuardedScheduler = Arc<TaskScheduler>;
pub type GuardedBreakers = Arc<BreakerRegistry>;
pub type GuardedLibraryStore = Arc<dyn LibraryStore>;

#[derive(Clone)]
pub struct ServerState {
    pub start_time: Instant,
    pub scheduler: GuardedScheduler,
    pub breakers: GuardedBreakers,
    pub store: GuardedLibraryStore,
}

impl ServerState {
    pub fn new(
        scheduler: GuardedScheduler,
        breakers: GuardedBreakers,
        store: GuardedLibraryStore,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            scheduler,
            breakers,
            store,
        }
    }
}

impl FromRef<ServerState> for GuardedScheduler {
    fn from_ref(input: &ServerState) -> Self {
        input.scheduler.clone()
    }
}

impl FromRef<ServerState> for GuardedBreakers {
    fn from_ref(input: &ServerState) -> Self {
        input.breakers.clone()
    }
}

impl FromRef<ServerState> for GuardedLibraryStore {
    fn from_ref(input: &ServerState) -> Self {
        input.store.clone()
    }
}
