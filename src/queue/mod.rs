use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    data_model::{AllocationEvent, InaugurationEvent},
    transport::MessageCallback,
};

/// A unit of work for the single consumer loop. Every state mutation in the
/// tracker happens through one of these, which is the sole protection of
/// the shared allocation/host tables.
pub enum Task {
    Allocation(AllocationEvent),
    Inauguration(InaugurationEvent),
    /// No-op; acked once every task enqueued before it has finished.
    Barrier(oneshot::Sender<()>),
    /// Sentinel; every task enqueued before it still runs, then the loop
    /// acks and terminates.
    Stop(oneshot::Sender<()>),
}

/// Producer handle of the serialized event loop. Cloneable and safe to use
/// from any number of delivery contexts; `enqueue` never blocks.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl EventQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!("event loop is gone, dropping a task");
        }
    }

    /// Blocks until every task enqueued before the call has finished.
    #[allow(dead_code)]
    pub async fn barrier(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(Task::Barrier(ack_tx));
        if ack_rx.await.is_err() {
            debug!("event loop terminated before acking the barrier");
        }
    }

    /// Requests a graceful stop and waits for the loop to terminate. Tasks
    /// already in the queue are processed first.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(Task::Stop(ack_tx));
        if ack_rx.await.is_err() {
            debug!("event loop already terminated");
        }
    }

    /// Fire-and-forget variant of [`EventQueue::stop`], usable from within
    /// an event handler.
    pub fn request_stop(&self) {
        let (ack_tx, _ack_rx) = oneshot::channel();
        self.enqueue(Task::Stop(ack_tx));
    }

    /// Transport-boundary decoder for allocation notifications. Payloads
    /// that do not decode are logged and dropped.
    pub fn allocation_callback(&self) -> MessageCallback {
        let queue = self.clone();
        Arc::new(move |payload: Bytes| {
            match serde_json::from_slice::<AllocationEvent>(&payload) {
                Ok(event) => queue.enqueue(Task::Allocation(event)),
                Err(err) => warn!("dropping an undecodable allocation message: {err:?}"),
            }
        })
    }

    /// Transport-boundary decoder for inauguration notifications.
    pub fn inauguration_callback(&self) -> MessageCallback {
        let queue = self.clone();
        Arc::new(move |payload: Bytes| {
            match serde_json::from_slice::<InaugurationEvent>(&payload) {
                Ok(event) => queue.enqueue(Task::Inauguration(event)),
                Err(err) => warn!("dropping an undecodable inauguration message: {err:?}"),
            }
        })
    }
}

/// Discards everything currently queued, acking any barrier or stop waiter
/// so that nothing deadlocks. Used on the fatal-inconsistency path.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Task>) -> usize {
    let mut discarded = 0;
    while let Ok(task) = rx.try_recv() {
        match task {
            Task::Barrier(ack) | Task::Stop(ack) => {
                let _ = ack.send(());
            }
            Task::Allocation(_) | Task::Inauguration(_) => discarded += 1,
        }
    }
    discarded
}
