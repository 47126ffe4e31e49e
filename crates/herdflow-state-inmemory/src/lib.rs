//! In-memory state store implementation for the Herdflow engine
//!
//! This crate provides in-memory implementations of the repository
//! interfaces defined in herdflow-core, in-memory collaborators, and a
//! background worker. It is primarily useful for development, testing, and
//! simple deployments where persistence is not required.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub mod repositories;
pub use repositories::{InMemoryStore, StoreState};

pub mod adapters;
pub use adapters::{
    BroadcastEventPublisher, ChannelTriggerSource, InMemorySnapshotCache,
    InMemorySnapshotProvider, RecordingModuleClient,
};

pub mod worker;
pub use worker::{WorkerHandle, WorkflowWorker};

use herdflow_core::EngineRepositories;

/// Provider for in-memory state store repositories
#[derive(Clone, Default)]
pub struct InMemoryStateStoreProvider {
    store: InMemoryStore,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider over an existing store, e.g. one reloaded from JSON
    pub fn with_store(store: InMemoryStore) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    /// Create repositories for use with `WorkflowRuntime`
    pub fn create_repositories(&self) -> EngineRepositories {
        let store = Arc::new(self.store.clone());
        EngineRepositories {
            workflows: store.clone(),
            store: store.clone(),
            decisions: store.clone(),
            updates: store.clone(),
            timers: store.clone(),
            templates: store,
        }
    }
}

/// Install a formatting subscriber filtered by `RUST_LOG` (default `info`)
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
