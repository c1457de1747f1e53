use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    data_model::{
        AllocationEvent, AllocationIdx, AllocationPhase, AllocationRecord, HostId, HostSequence,
        HostState, InaugurationEvent, InaugurationProgress, InaugurationRecord,
        InaugurationStatus, FETCHING_STATE,
    },
    monitor::EventPulse,
    queue::{self, EventQueue, Task},
    store::{ResilientStoreClient, StoreError},
    transport::Subscriptions,
    utils::{elapsed_secs_since, get_epoch_time_in_ms},
};

/// Verdict of a handler, consumed by the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Unrecoverable inconsistency: discard everything still queued and
    /// terminate instead of risking corrupted records.
    Halt { reason: String },
}

/// A persisted allocation document together with its store identifier.
#[derive(Debug, Clone)]
struct StoredAllocation {
    record_id: String,
    record: AllocationRecord,
}

/// Owns all allocation and host state. Every mutation happens through a
/// handler invoked by [`AllocationTracker::run`], which executes tasks
/// strictly in arrival order on a single consumer; no locking is needed
/// inside the handlers.
pub struct AllocationTracker {
    store: ResilientStoreClient,
    subscriptions: Arc<dyn Subscriptions>,
    queue: EventQueue,
    allocations_collection: String,
    inaugurations_collection: String,
    max_open_allocations: usize,
    open_allocations: HashMap<AllocationIdx, StoredAllocation>,
    hosts: HashMap<HostId, HostState>,
    last_requested: Option<StoredAllocation>,
    highest_allocation_idx: Option<AllocationIdx>,
    host_sequence: HostSequence,
}

impl AllocationTracker {
    pub fn new(
        store: ResilientStoreClient,
        subscriptions: Arc<dyn Subscriptions>,
        queue: EventQueue,
        config: &ServerConfig,
    ) -> Self {
        Self {
            store,
            subscriptions,
            queue,
            allocations_collection: config.allocations_collection.clone(),
            inaugurations_collection: config.inaugurations_collection.clone(),
            max_open_allocations: config.max_open_allocations,
            open_allocations: HashMap::new(),
            hosts: HashMap::new(),
            last_requested: None,
            highest_allocation_idx: None,
            host_sequence: HostSequence::default(),
        }
    }

    /// The serialized event loop. Dequeues exactly one task at a time and
    /// runs it to completion before looking at the next one. Returns `Ok`
    /// on a graceful stop or a fatal-but-clean halt; an `Err` means an
    /// unclassified handler failure that the caller must surface.
    pub async fn run(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<Task>,
        pulse: Option<EventPulse>,
    ) -> Result<()> {
        while let Some(task) = rx.recv().await {
            let flow = match task {
                Task::Barrier(ack) => {
                    let _ = ack.send(());
                    continue;
                }
                Task::Stop(ack) => {
                    info!("finished handling events");
                    let _ = ack.send(());
                    return Ok(());
                }
                Task::Allocation(event) => {
                    debug!(
                        open_allocations = self.open_allocations.len(),
                        "handling an allocation event"
                    );
                    let flow = self.handle_allocation_event(event).await?;
                    if let Some(pulse) = &pulse {
                        pulse.tick();
                    }
                    flow
                }
                Task::Inauguration(event) => {
                    let flow = self.handle_inauguration_event(event).await?;
                    if let Some(pulse) = &pulse {
                        pulse.tick();
                    }
                    flow
                }
            };
            if let Flow::Halt { reason } = flow {
                let discarded = queue::drain(rx);
                error!(discarded, "halting event processing: {reason}");
                return Ok(());
            }
        }
        Ok(())
    }

    pub async fn handle_allocation_event(&mut self, event: AllocationEvent) -> Result<Flow> {
        if self.open_allocations.len() >= self.max_open_allocations {
            error!(
                open_allocations = self.open_allocations.len(),
                "something has gone wrong; too many open allocations"
            );
            return Ok(Flow::Halt {
                reason: format!(
                    "the open allocation registry reached its bound of {}",
                    self.max_open_allocations
                ),
            });
        }
        match event {
            AllocationEvent::Requested {
                allocation_info,
                requirements,
            } => self.on_requested(allocation_info, requirements).await,
            AllocationEvent::Rejected { reason } => self.on_rejected(reason).await,
            AllocationEvent::Created {
                allocation_id,
                allocated,
            } => self.on_created(allocation_id, allocated).await,
            AllocationEvent::Done { allocation_id } => self.on_done(allocation_id).await,
            AllocationEvent::Dead {
                allocation_id,
                reason,
            } => self.on_dead(allocation_id, reason).await,
        }
    }

    pub async fn handle_inauguration_event(&mut self, event: InaugurationEvent) -> Result<Flow> {
        if !self.hosts.contains_key(&event.id) {
            error!(
                host_id = %event.id,
                "inauguration message for a host without a known allocation, ignoring"
            );
            return Ok(Flow::Continue);
        }
        match event.status {
            InaugurationStatus::Progress { progress } => {
                self.on_inauguration_progress(&event.id, progress);
                Ok(Flow::Continue)
            }
            InaugurationStatus::Done => self.on_inauguration_done(&event.id).await,
        }
    }

    async fn on_requested(
        &mut self,
        allocation_info: serde_json::Value,
        requirements: HashMap<String, serde_json::Value>,
    ) -> Result<Flow> {
        let record = AllocationRecord::requested(allocation_info, &requirements);
        let doc = serde_json::to_value(&record)?;
        let record_id = self.create_allocation_record(doc).await?;
        info!(record_id = %record_id, nr_nodes = record.nr_nodes, "new allocation request");
        self.last_requested = Some(StoredAllocation { record_id, record });
        Ok(Flow::Continue)
    }

    async fn on_rejected(&mut self, reason: String) -> Result<Flow> {
        let Some(pending) = self.last_requested.as_mut() else {
            info!("allocation rejection message without a request message before it, skipping");
            return Ok(Flow::Continue);
        };
        if pending.record.highest_phase_reached != AllocationPhase::Requested {
            error!(
                phase = %pending.record.highest_phase_reached,
                "allocation rejection message in an invalid context"
            );
            return Ok(Flow::Continue);
        }
        pending.record.highest_phase_reached = AllocationPhase::Rejected;
        pending.record.reason = reason;
        let record_id = pending.record_id.clone();
        let doc = serde_json::to_value(&pending.record)?;
        self.update_allocation_record(&record_id, doc).await?;
        self.last_requested = None;
        Ok(Flow::Continue)
    }

    async fn on_created(
        &mut self,
        idx: AllocationIdx,
        allocated: HashMap<String, HostId>,
    ) -> Result<Flow> {
        // Consistency gate before anything is recorded.
        if let Some(highest) = self.highest_allocation_idx {
            if idx < highest {
                error!(
                    %idx,
                    %highest,
                    "allocation index is smaller than the previous one (could the provider have \
                     been restarted?)"
                );
                return Ok(Flow::Halt {
                    reason: format!("allocation index went backwards ({idx} after {highest})"),
                });
            }
        }
        let Some(pending) = self.last_requested.as_mut() else {
            info!(%idx, "ignoring allocation creation message since its request message was skipped");
            return Ok(Flow::Continue);
        };
        if pending.record.highest_phase_reached != AllocationPhase::Requested {
            info!(
                %idx,
                phase = %pending.record.highest_phase_reached,
                "ignoring allocation creation message, no allocation request is pending"
            );
            return Ok(Flow::Continue);
        }
        info!(%idx, hosts = allocated.len(), "new allocation");
        self.highest_allocation_idx = Some(idx);

        pending.record.highest_phase_reached = AllocationPhase::Created;
        pending.record.bind_allocated(&allocated);
        pending.record.nr_nodes = pending.record.nodes.len();
        pending.record.allocation_id = Some(idx);
        pending.record.creation_time = Some(get_epoch_time_in_ms());
        let record_id = pending.record_id.clone();
        let record = pending.record.clone();

        let doc = serde_json::to_value(&record)?;
        self.update_allocation_record(&record_id, doc).await?;
        self.open_allocations.insert(
            idx,
            StoredAllocation {
                record_id,
                record: record.clone(),
            },
        );
        if let Err(err) = self
            .subscriptions
            .register_for_allocation(idx, self.queue.allocation_callback())
            .await
        {
            warn!(%idx, "error registering for allocation events: {err:?}");
        }

        for (name, host_id) in allocated {
            if let Some(existing) = self.hosts.get(&host_id) {
                let conflicting = existing.allocation_idx;
                warn!(
                    %idx,
                    %host_id,
                    %conflicting,
                    "allocation was created with a host which is already used by another \
                     allocation, unsubscribing from the latter first"
                );
                self.unsubscribe_allocation(conflicting).await?;
            }
            let requirements = match record.requirements_of(&name) {
                Some(requirements) => requirements.clone(),
                None => {
                    error!(%host_id, name = %name, "failed to resolve requirements for an allocated host");
                    serde_json::Value::Null
                }
            };
            self.hosts
                .insert(host_id.clone(), HostState::new(name, idx, requirements));
            info!(%host_id, "subscribing to inaugurator events");
            if let Err(err) = self
                .subscriptions
                .register_for_inaugurator(&host_id, self.queue.inauguration_callback())
                .await
            {
                warn!(%host_id, "error registering for inauguration events: {err:?}");
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_done(&mut self, idx: AllocationIdx) -> Result<Flow> {
        let Some(tracked) = self.open_allocations.get_mut(&idx) else {
            info!(%idx, "ignoring done message for an allocation which is not tracked");
            return Ok(Flow::Continue);
        };
        if tracked.record.highest_phase_reached != AllocationPhase::Created {
            info!(
                %idx,
                phase = %tracked.record.highest_phase_reached,
                "ignoring done message in an unexpected phase"
            );
            return Ok(Flow::Continue);
        }
        info!(%idx, "inauguration stage for the allocation is over");
        tracked.record.highest_phase_reached = AllocationPhase::Done;
        tracked.record.done = true;
        let creation_time = tracked.record.creation_time.unwrap_or(tracked.record.date);
        tracked.record.inauguration_duration = Some(elapsed_secs_since(creation_time));
        let record_id = tracked.record_id.clone();
        let doc = serde_json::to_value(&tracked.record)?;
        self.update_allocation_record(&record_id, doc).await?;
        Ok(Flow::Continue)
    }

    async fn on_dead(&mut self, idx: AllocationIdx, reason: String) -> Result<Flow> {
        let Some(tracked) = self.open_allocations.get_mut(&idx) else {
            info!(%idx, "ignoring death message for an allocation which is not tracked");
            return Ok(Flow::Continue);
        };
        info!(%idx, reason = %reason, "allocation is dead");
        tracked.record.highest_phase_reached = AllocationPhase::Dead;
        tracked.record.reason = reason;
        let creation_time = tracked.record.creation_time.unwrap_or(tracked.record.date);
        tracked.record.allocation_duration = elapsed_secs_since(creation_time);
        if tracked.record.done {
            tracked.record.test_duration = Some(elapsed_secs_since(creation_time));
        }
        let record_id = tracked.record_id.clone();
        let doc = serde_json::to_value(&tracked.record)?;
        self.update_allocation_record(&record_id, doc).await?;
        self.unsubscribe_allocation(idx).await?;
        Ok(Flow::Continue)
    }

    fn on_inauguration_progress(&mut self, host_id: &HostId, progress: InaugurationProgress) {
        if progress.state != FETCHING_STATE {
            return;
        }
        debug!(%host_id, "progress message");
        if let Some(host) = self.hosts.get_mut(host_id) {
            host.latest_chain_count = Some(progress.chain_get_count);
        }
    }

    async fn on_inauguration_done(&mut self, host_id: &HostId) -> Result<Flow> {
        if let Some(host) = self.hosts.get_mut(host_id) {
            host.end_timestamp = Some(get_epoch_time_in_ms());
            host.inauguration_done = true;
        }
        info!(%host_id, "host has finished inauguration, unsubscribing");
        self.persist_inauguration_record(host_id).await?;
        if let Err(err) = self.subscriptions.unregister_for_inaugurator(host_id).await {
            warn!(%host_id, "error unregistering from inauguration events: {err:?}");
        }
        self.hosts.remove(host_id);
        Ok(Flow::Continue)
    }

    /// Tears down every trace of an allocation: its registry entry, its
    /// per-allocation registration and all of its hosts. A partial record
    /// is persisted for every host whose inauguration never completed, so
    /// no host observation is silently lost.
    async fn unsubscribe_allocation(&mut self, idx: AllocationIdx) -> Result<()> {
        self.open_allocations.remove(&idx);
        if let Err(err) = self.subscriptions.unregister_for_allocation(idx).await {
            warn!(%idx, "error unregistering from allocation events: {err:?}");
        }
        let mut allocated_hosts = Vec::new();
        let mut uninaugurated_hosts = Vec::new();
        for (host_id, host) in &self.hosts {
            if host.allocation_idx == idx {
                allocated_hosts.push(host_id.clone());
                if !host.inauguration_done {
                    uninaugurated_hosts.push(host_id.clone());
                }
            }
        }
        if !uninaugurated_hosts.is_empty() {
            uninaugurated_hosts.sort();
            info!(
                %idx,
                hosts = ?uninaugurated_hosts,
                "inauguration stage for the allocation ended without finishing inauguration of \
                 some hosts"
            );
            for host_id in &uninaugurated_hosts {
                info!(%host_id, "unsubscribing from inauguration events");
                self.persist_inauguration_record(host_id).await?;
                if let Err(err) = self.subscriptions.unregister_for_inaugurator(host_id).await {
                    warn!(%host_id, "error unregistering from inauguration events: {err:?}");
                }
            }
        }
        for host_id in &allocated_hosts {
            self.hosts.remove(host_id);
        }
        Ok(())
    }

    async fn persist_inauguration_record(&mut self, host_id: &HostId) -> Result<()> {
        let Some(state) = self.hosts.get(host_id) else {
            return Ok(());
        };
        let sequence = self.host_sequence.sequence_of(host_id);
        let (record_id, record) = InaugurationRecord::build(host_id, state, sequence);
        let doc = serde_json::to_value(&record)?;
        info!(record_id = %record_id, %host_id, "inserting an inauguration record");
        loop {
            match self
                .store
                .create_with_id(&self.inaugurations_collection, &record_id, doc.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(StoreError::Unavailable { source }) => {
                    error!("error inserting an inauguration record: {source:?}");
                    self.store.handle_disconnection().await;
                }
                Err(err) => {
                    error!("inauguration record insertion failed, stopping: {err:?}");
                    self.queue.request_stop();
                    return Ok(());
                }
            }
        }
    }

    async fn create_allocation_record(&self, doc: serde_json::Value) -> Result<String> {
        loop {
            match self
                .store
                .create(&self.allocations_collection, doc.clone())
                .await
            {
                Ok(record_id) => return Ok(record_id),
                Err(StoreError::Unavailable { source }) => {
                    error!("error creating an allocation record: {source:?}");
                    self.store.handle_disconnection().await;
                }
                Err(err) => {
                    return Err(err).context("error persisting an allocation record");
                }
            }
        }
    }

    async fn update_allocation_record(&self, record_id: &str, doc: serde_json::Value) -> Result<()> {
        loop {
            match self
                .store
                .update(&self.allocations_collection, record_id, doc.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(StoreError::Unavailable { source }) => {
                    error!("error updating an allocation record: {source:?}");
                    self.store.handle_disconnection().await;
                }
                Err(err) => {
                    return Err(err).context("error persisting an allocation record");
                }
            }
        }
    }

}

#[allow(dead_code)]
impl AllocationTracker {
    pub fn open_allocation_count(&self) -> usize {
        self.open_allocations.len()
    }

    pub fn is_tracking_allocation(&self, idx: AllocationIdx) -> bool {
        self.open_allocations.contains_key(&idx)
    }

    pub fn is_tracking_host(&self, host_id: &HostId) -> bool {
        self.hosts.contains_key(host_id)
    }

    pub fn hosts_tracked_under(&self, idx: AllocationIdx) -> usize {
        self.hosts
            .values()
            .filter(|host| host.allocation_idx == idx)
            .count()
    }

    pub fn highest_allocation_idx(&self) -> Option<AllocationIdx> {
        self.highest_allocation_idx
    }
}
