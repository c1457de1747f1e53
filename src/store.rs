use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::alerts::Alerter;

/// Failures of the document store, split by what the caller can do about
/// them: `Unavailable` is recoverable through the reconnection loop,
/// `Rejected` means the store refused the operation itself.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unreachable: {source}")]
    Unavailable {
        #[source]
        source: anyhow::Error,
    },
    #[error("store rejected the operation: {reason}")]
    Rejected { reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Create/update contract of the backing document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates a record with a store-assigned identifier and returns it.
    async fn create(&self, collection: &str, record: serde_json::Value) -> StoreResult<String>;

    /// Creates a record under a caller-chosen identifier.
    async fn create_with_id(
        &self,
        collection: &str,
        id: &str,
        record: serde_json::Value,
    ) -> StoreResult<()>;

    async fn update(&self, collection: &str, id: &str, record: serde_json::Value)
        -> StoreResult<()>;

    /// Cheap liveness probe used by the reconnection loop.
    async fn ping(&self) -> StoreResult<()>;
}

/// HTTP document store backend.
pub struct HttpDocumentStore {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpDocumentStore {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    fn url(&self, path: &str) -> StoreResult<Url> {
        self.endpoint.join(path).map_err(|err| StoreError::Rejected {
            reason: format!("invalid store path {path}: {err}"),
        })
    }

    async fn check(&self, response: reqwest::Response) -> StoreResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Rejected {
            reason: format!("{status}: {body}"),
        })
    }
}

fn classify(err: reqwest::Error) -> StoreError {
    if err.is_connect() || err.is_timeout() {
        StoreError::Unavailable { source: err.into() }
    } else {
        StoreError::Rejected {
            reason: err.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "_id")]
    id: String,
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn create(&self, collection: &str, record: serde_json::Value) -> StoreResult<String> {
        let url = self.url(&format!("{collection}/_doc"))?;
        let response = self
            .client
            .post(url)
            .json(&record)
            .send()
            .await
            .map_err(classify)?;
        let response = self.check(response).await?;
        let created: CreateResponse = response.json().await.map_err(classify)?;
        Ok(created.id)
    }

    async fn create_with_id(
        &self,
        collection: &str,
        id: &str,
        record: serde_json::Value,
    ) -> StoreResult<()> {
        let url = self.url(&format!("{collection}/_doc/{id}"))?;
        let response = self
            .client
            .put(url)
            .json(&record)
            .send()
            .await
            .map_err(classify)?;
        self.check(response).await?;
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        record: serde_json::Value,
    ) -> StoreResult<()> {
        let url = self.url(&format!("{collection}/_update/{id}"))?;
        let body = serde_json::json!({ "doc": record });
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(classify)?;
        self.check(response).await?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .send()
            .await
            .map_err(classify)?;
        self.check(response).await?;
        Ok(())
    }
}

/// Stateless conduit to the document store. Holds no records of its own and
/// never buffers failed writes; after `handle_disconnection` returns, the
/// caller re-issues the operation that failed.
#[derive(Clone)]
pub struct ResilientStoreClient {
    store: Arc<dyn DocumentStore>,
    alerter: Arc<dyn Alerter>,
    retry_interval: Duration,
}

impl ResilientStoreClient {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        alerter: Arc<dyn Alerter>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            alerter,
            retry_interval,
        }
    }

    pub async fn create(&self, collection: &str, record: serde_json::Value) -> StoreResult<String> {
        self.store.create(collection, record).await
    }

    pub async fn create_with_id(
        &self,
        collection: &str,
        id: &str,
        record: serde_json::Value,
    ) -> StoreResult<()> {
        self.store.create_with_id(collection, id, record).await
    }

    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        record: serde_json::Value,
    ) -> StoreResult<()> {
        self.store.update(collection, id, record).await
    }

    /// Invoked by the caller after catching [`StoreError::Unavailable`].
    /// Alerts once on the way into the outage, probes the store at a fixed
    /// interval until it answers, then alerts once on the way out.
    pub async fn handle_disconnection(&self) {
        self.alerter
            .alert("an error occurred while talking to the store, attempting to reconnect")
            .await;
        loop {
            info!(
                "will try to reconnect to the store in {} seconds",
                self.retry_interval.as_secs()
            );
            tokio::time::sleep(self.retry_interval).await;
            match self.store.ping().await {
                Ok(()) => {
                    info!("connected to the store again");
                    self.alerter.alert("connected to the store again").await;
                    return;
                }
                Err(err) => warn!("store is still unreachable: {err:?}"),
            }
        }
    }
}
