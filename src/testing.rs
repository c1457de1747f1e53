use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    alerts::Alerter,
    config::ServerConfig,
    data_model::{
        AllocationEvent, AllocationIdx, HostId, InaugurationEvent, InaugurationProgress,
        InaugurationStatus,
    },
    processor::AllocationTracker,
    queue::{EventQueue, Task},
    store::{DocumentStore, ResilientStoreClient, StoreError, StoreResult},
    transport::{MessageCallback, Subscriptions},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Create { collection: String, id: String },
    Update { collection: String, id: String },
    Ping,
}

/// In-memory document store with scriptable connectivity failures.
#[derive(Default)]
pub struct MemoryStore {
    ops: Mutex<Vec<StoreOp>>,
    documents: Mutex<HashMap<(String, String), serde_json::Value>>,
    failing_creates: AtomicUsize,
    failing_pings: AtomicUsize,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// The next `n` create operations fail with `Unavailable`.
    pub fn fail_creates(&self, n: usize) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, n: usize) {
        self.failing_pings.store(n, Ordering::SeqCst);
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn documents(&self) -> HashMap<(String, String), serde_json::Value> {
        self.documents.lock().unwrap().clone()
    }

    /// Documents currently stored in `collection`, in creation order.
    pub fn collection(&self, collection: &str) -> Vec<(String, serde_json::Value)> {
        let documents = self.documents.lock().unwrap();
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match op {
                StoreOp::Create { collection: c, id } if c == collection => documents
                    .get(&(c.clone(), id.clone()))
                    .map(|doc| (id.clone(), doc.clone())),
                _ => None,
            })
            .collect()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        loop {
            let current = counter.load(Ordering::SeqCst);
            if current == 0 {
                return false;
            }
            if counter
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable {
            source: anyhow::anyhow!("connection refused"),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, collection: &str, record: serde_json::Value) -> StoreResult<String> {
        if Self::take_failure(&self.failing_creates) {
            return Err(Self::unavailable());
        }
        let id = format!("doc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.documents
            .lock()
            .unwrap()
            .insert((collection.to_string(), id.clone()), record);
        self.ops.lock().unwrap().push(StoreOp::Create {
            collection: collection.to_string(),
            id: id.clone(),
        });
        Ok(id)
    }

    async fn create_with_id(
        &self,
        collection: &str,
        id: &str,
        record: serde_json::Value,
    ) -> StoreResult<()> {
        if Self::take_failure(&self.failing_creates) {
            return Err(Self::unavailable());
        }
        self.documents
            .lock()
            .unwrap()
            .insert((collection.to_string(), id.to_string()), record);
        self.ops.lock().unwrap().push(StoreOp::Create {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        record: serde_json::Value,
    ) -> StoreResult<()> {
        self.documents
            .lock()
            .unwrap()
            .insert((collection.to_string(), id.to_string()), record);
        self.ops.lock().unwrap().push(StoreOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.ops.lock().unwrap().push(StoreOp::Ping);
        if Self::take_failure(&self.failing_pings) {
            return Err(Self::unavailable());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlerter {
    messages: Mutex<Vec<String>>,
}

impl RecordingAlerter {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn alert(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Captures every registration so tests can inject messages and assert on
/// subscription churn.
#[derive(Default)]
pub struct RecordingSubscriptions {
    inaugurators: Mutex<HashMap<HostId, MessageCallback>>,
    allocation_registrations: Mutex<Vec<AllocationIdx>>,
    allocation_unregistrations: Mutex<Vec<AllocationIdx>>,
    inaugurator_unregistrations: Mutex<Vec<HostId>>,
}

impl RecordingSubscriptions {
    pub fn registered_inaugurators(&self) -> Vec<HostId> {
        self.inaugurators.lock().unwrap().keys().cloned().collect()
    }

    pub fn registered_allocations(&self) -> Vec<AllocationIdx> {
        self.allocation_registrations.lock().unwrap().clone()
    }

    pub fn unregistered_allocations(&self) -> Vec<AllocationIdx> {
        self.allocation_unregistrations.lock().unwrap().clone()
    }

    pub fn unregistered_inaugurators(&self) -> Vec<HostId> {
        self.inaugurator_unregistrations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Subscriptions for RecordingSubscriptions {
    async fn register_for_all_allocations(&self, _callback: MessageCallback) -> Result<()> {
        Ok(())
    }

    async fn register_for_allocation(
        &self,
        idx: AllocationIdx,
        _callback: MessageCallback,
    ) -> Result<()> {
        self.allocation_registrations.lock().unwrap().push(idx);
        Ok(())
    }

    async fn unregister_for_allocation(&self, idx: AllocationIdx) -> Result<()> {
        self.allocation_unregistrations.lock().unwrap().push(idx);
        Ok(())
    }

    async fn register_for_inaugurator(
        &self,
        host_id: &HostId,
        callback: MessageCallback,
    ) -> Result<()> {
        self.inaugurators
            .lock()
            .unwrap()
            .insert(host_id.clone(), callback);
        Ok(())
    }

    async fn unregister_for_inaugurator(&self, host_id: &HostId) -> Result<()> {
        self.inaugurators.lock().unwrap().remove(host_id);
        self.inaugurator_unregistrations
            .lock()
            .unwrap()
            .push(host_id.clone());
        Ok(())
    }
}

/// A tracker wired to recording doubles, driven directly by tests.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub subscriptions: Arc<RecordingSubscriptions>,
    pub alerter: Arc<RecordingAlerter>,
    pub queue: EventQueue,
    pub rx: mpsc::UnboundedReceiver<Task>,
    pub tracker: AllocationTracker,
    pub config: ServerConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let store = Arc::new(MemoryStore::default());
        let subscriptions = Arc::new(RecordingSubscriptions::default());
        let alerter = Arc::new(RecordingAlerter::default());
        let (queue, rx) = EventQueue::new();
        let store_client = ResilientStoreClient::new(
            store.clone(),
            alerter.clone(),
            Duration::from_secs(config.store_retry_interval_secs),
        );
        let tracker = AllocationTracker::new(
            store_client,
            subscriptions.clone(),
            queue.clone(),
            &config,
        );
        Self {
            store,
            subscriptions,
            alerter,
            queue,
            rx,
            tracker,
            config,
        }
    }

    pub fn allocation_docs(&self) -> Vec<(String, serde_json::Value)> {
        self.store.collection(&self.config.allocations_collection)
    }

    pub fn inauguration_docs(&self) -> Vec<(String, serde_json::Value)> {
        self.store.collection(&self.config.inaugurations_collection)
    }
}

pub fn requested(nodes: &[&str]) -> AllocationEvent {
    let requirements = nodes
        .iter()
        .map(|name| {
            (
                name.to_string(),
                serde_json::json!({"imageLabel": "base", "cpus": 4}),
            )
        })
        .collect();
    AllocationEvent::Requested {
        allocation_info: serde_json::json!({"user": "tests", "purpose": "racktest"}),
        requirements,
    }
}

pub fn created(idx: u64, assignment: &[(&str, &str)]) -> AllocationEvent {
    let allocated = assignment
        .iter()
        .map(|(name, host)| (name.to_string(), HostId::from(*host)))
        .collect();
    AllocationEvent::Created {
        allocation_id: AllocationIdx::new(idx),
        allocated,
    }
}

pub fn progress(host: &str, chain_get_count: &[u64]) -> InaugurationEvent {
    InaugurationEvent {
        id: HostId::from(host),
        status: InaugurationStatus::Progress {
            progress: InaugurationProgress {
                state: "fetching".to_string(),
                chain_get_count: chain_get_count.to_vec(),
            },
        },
    }
}

pub fn inauguration_done(host: &str) -> InaugurationEvent {
    InaugurationEvent {
        id: HostId::from(host),
        status: InaugurationStatus::Done,
    }
}
