//! In-memory collaborators: clinical data, snapshot cache, event egress,
//! trigger ingress and a recording module client.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

use herdflow_core::{
    AnimalId, ClinicalSnapshot, CoreError, EventPublisher, ModuleClient, ModuleResponse,
    SnapshotCache, SnapshotProvider, TriggerEvent, TriggerSource, UpdateType, WorkflowEvent,
};

/// Clinical data held in memory, one JSON document per animal
#[derive(Default)]
pub struct InMemorySnapshotProvider {
    records: DashMap<AnimalId, Value>,
    failing: AtomicBool,
    reads: AtomicUsize,
}

impl InMemorySnapshotProvider {
    /// Empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole record of an animal
    pub fn set_record(&self, animal_id: &AnimalId, record: Value) {
        self.records.insert(animal_id.clone(), record);
    }

    /// Set one top-level field of an animal's record
    pub fn set_field(&self, animal_id: &AnimalId, field: &str, value: Value) {
        let mut entry = self
            .records
            .entry(animal_id.clone())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(fields) = entry.value_mut() {
            fields.insert(field.to_string(), value);
        }
    }

    /// Make every read fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of snapshot reads served or attempted
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotProvider for InMemorySnapshotProvider {
    async fn get_snapshot(&self, animal_id: &AnimalId) -> Result<ClinicalSnapshot, CoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::SnapshotError(format!(
                "Clinical data for {} is unavailable",
                animal_id.0
            )));
        }

        let record = self
            .records
            .get(animal_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| {
                CoreError::SnapshotError(format!("No clinical record for animal {}", animal_id.0))
            })?;
        Ok(ClinicalSnapshot::from_value(record, Utc::now()))
    }
}

/// Snapshot cache with a fixed time to live
pub struct InMemorySnapshotCache {
    entries: DashMap<AnimalId, (ClinicalSnapshot, Instant)>,
    ttl: Duration,
}

impl InMemorySnapshotCache {
    /// Cache keeping entries for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl SnapshotCache for InMemorySnapshotCache {
    async fn get(&self, animal_id: &AnimalId) -> Option<ClinicalSnapshot> {
        let expired = match self.entries.get(animal_id) {
            Some(entry) if entry.1.elapsed() < self.ttl => return Some(entry.0.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            debug!(animal_id = %animal_id.0, "Snapshot cache entry expired");
            self.entries.remove(animal_id);
        }
        None
    }

    async fn put(&self, animal_id: &AnimalId, snapshot: &ClinicalSnapshot) {
        self.entries
            .insert(animal_id.clone(), (snapshot.clone(), Instant::now()));
    }
}

/// Publishes workflow events on a tokio broadcast channel
pub struct BroadcastEventPublisher {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastEventPublisher {
    /// Publisher buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// New subscription
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: &WorkflowEvent) -> Result<(), CoreError> {
        // No subscribers is not an error for a broadcast
        if self.tx.send(event.clone()).is_err() {
            debug!(event_type = event.event_type(), "No event subscribers");
        }
        Ok(())
    }
}

/// Trigger ingress fed through an mpsc channel
pub struct ChannelTriggerSource {
    rx: Mutex<mpsc::Receiver<TriggerEvent>>,
}

impl ChannelTriggerSource {
    /// Create the source and the sender feeding it
    pub fn channel(capacity: usize) -> (mpsc::Sender<TriggerEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl TriggerSource for ChannelTriggerSource {
    async fn next_event(&self) -> Option<TriggerEvent> {
        self.rx.lock().await.recv().await
    }
}

/// Module client that accepts everything and remembers what it received
#[derive(Default)]
pub struct RecordingModuleClient {
    received: StdMutex<Vec<(UpdateType, Value)>>,
    counter: AtomicUsize,
}

impl RecordingModuleClient {
    /// Empty client
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads received so far
    pub fn received(&self) -> Vec<(UpdateType, Value)> {
        match self.received.lock() {
            Ok(received) => received.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ModuleClient for RecordingModuleClient {
    async fn apply(
        &self,
        update_type: UpdateType,
        payload: &Value,
    ) -> Result<ModuleResponse, CoreError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        match self.received.lock() {
            Ok(mut received) => received.push((update_type, payload.clone())),
            Err(poisoned) => poisoned.into_inner().push((update_type, payload.clone())),
        }
        Ok(ModuleResponse::ok(Some(format!("record-{}", n))))
    }
}
