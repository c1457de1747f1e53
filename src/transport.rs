use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, error, warn};

use crate::data_model::{AllocationIdx, HostId};

/// Invoked from the transport's own delivery context with the raw message
/// payload. Implementations must return quickly; all real work happens on
/// the event loop.
pub type MessageCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Registration surface of the notification broker. Delivery is
/// at-least-once and FIFO per registration only.
#[async_trait]
pub trait Subscriptions: Send + Sync {
    async fn register_for_all_allocations(&self, callback: MessageCallback) -> Result<()>;

    async fn register_for_allocation(
        &self,
        idx: AllocationIdx,
        callback: MessageCallback,
    ) -> Result<()>;

    async fn unregister_for_allocation(&self, idx: AllocationIdx) -> Result<()>;

    async fn register_for_inaugurator(
        &self,
        host_id: &HostId,
        callback: MessageCallback,
    ) -> Result<()>;

    async fn unregister_for_inaugurator(&self, host_id: &HostId) -> Result<()>;
}

const ALL_ALLOCATIONS_TOPIC: &str = "all-allocations";

fn allocation_topic(idx: AllocationIdx) -> String {
    format!("allocation-{idx}")
}

fn inaugurator_topic(host_id: &HostId) -> String {
    format!("inaugurator-{host_id}")
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum BrokerCommand {
    Register { topic: String },
    Unregister { topic: String },
}

#[derive(Deserialize)]
struct BrokerEnvelope {
    topic: String,
    payload: serde_json::Value,
}

/// Line-delimited JSON subscription client for the notification broker.
/// One reader task dispatches inbound envelopes to registered callbacks,
/// one writer task serializes register/unregister commands.
pub struct BrokerSubscriptions {
    callbacks: Arc<Mutex<HashMap<String, MessageCallback>>>,
    commands: mpsc::UnboundedSender<BrokerCommand>,
}

impl BrokerSubscriptions {
    pub async fn connect(url: &str) -> Result<Self> {
        let addr = url.trim_start_matches("tcp://");
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("error connecting to the notification broker at {addr}"))?;
        let (read_half, mut write_half) = stream.into_split();

        let callbacks: Arc<Mutex<HashMap<String, MessageCallback>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let dispatch_callbacks = callbacks.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => dispatch(&dispatch_callbacks, &line),
                    Ok(None) => {
                        warn!("notification broker closed the connection");
                        break;
                    }
                    Err(err) => {
                        error!("error reading from the notification broker: {err:?}");
                        break;
                    }
                }
            }
        });

        let (commands, mut commands_rx) = mpsc::unbounded_channel::<BrokerCommand>();
        tokio::spawn(async move {
            while let Some(command) = commands_rx.recv().await {
                let mut line = match serde_json::to_vec(&command) {
                    Ok(line) => line,
                    Err(err) => {
                        error!("error encoding a broker command: {err:?}");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(err) = write_half.write_all(&line).await {
                    error!("error writing to the notification broker: {err:?}");
                    break;
                }
            }
        });

        Ok(Self {
            callbacks,
            commands,
        })
    }

    fn register(&self, topic: String, callback: MessageCallback) -> Result<()> {
        self.callbacks
            .lock()
            .unwrap()
            .insert(topic.clone(), callback);
        self.commands
            .send(BrokerCommand::Register { topic })
            .context("broker connection is gone")
    }

    fn unregister(&self, topic: String) -> Result<()> {
        self.callbacks.lock().unwrap().remove(&topic);
        self.commands
            .send(BrokerCommand::Unregister { topic })
            .context("broker connection is gone")
    }
}

fn dispatch(callbacks: &Mutex<HashMap<String, MessageCallback>>, line: &str) {
    let envelope: BrokerEnvelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!("dropping an unparsable broker message: {err:?}");
            return;
        }
    };
    let callback = callbacks.lock().unwrap().get(&envelope.topic).cloned();
    match callback {
        Some(callback) => {
            let payload = serde_json::to_vec(&envelope.payload).unwrap_or_default();
            callback(Bytes::from(payload));
        }
        None => debug!(topic = %envelope.topic, "message for an unregistered topic"),
    }
}

#[async_trait]
impl Subscriptions for BrokerSubscriptions {
    async fn register_for_all_allocations(&self, callback: MessageCallback) -> Result<()> {
        self.register(ALL_ALLOCATIONS_TOPIC.to_string(), callback)
    }

    async fn register_for_allocation(
        &self,
        idx: AllocationIdx,
        callback: MessageCallback,
    ) -> Result<()> {
        self.register(allocation_topic(idx), callback)
    }

    async fn unregister_for_allocation(&self, idx: AllocationIdx) -> Result<()> {
        self.unregister(allocation_topic(idx))
    }

    async fn register_for_inaugurator(
        &self,
        host_id: &HostId,
        callback: MessageCallback,
    ) -> Result<()> {
        self.register(inaugurator_topic(host_id), callback)
    }

    async fn unregister_for_inaugurator(&self, host_id: &HostId) -> Result<()> {
        self.unregister(inaugurator_topic(host_id))
    }
}
