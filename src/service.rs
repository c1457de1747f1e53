use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tracing::{error, info};

use crate::{
    alerts::{build_alerter, Alerter},
    config::ServerConfig,
    monitor::{EventPulse, SilenceWatchdog},
    processor::AllocationTracker,
    queue::{EventQueue, Task},
    store::{HttpDocumentStore, ResilientStoreClient},
    transport::Subscriptions,
};

pub struct Service {
    pub config: ServerConfig,
    shutdown_tx: watch::Sender<()>,
    shutdown_rx: watch::Receiver<()>,
    alerter: Arc<dyn Alerter>,
    queue: EventQueue,
    rx: mpsc::UnboundedReceiver<Task>,
    tracker: AllocationTracker,
    pulse: EventPulse,
}

impl Service {
    pub async fn new(config: ServerConfig, subscriptions: Arc<dyn Subscriptions>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let alerter = build_alerter(config.alert_webhook_url.as_deref());

        let store = Arc::new(HttpDocumentStore::new(
            config
                .store_endpoint_url()
                .context("error parsing the store endpoint")?,
        ));
        let store_client = ResilientStoreClient::new(
            store,
            alerter.clone(),
            Duration::from_secs(config.store_retry_interval_secs),
        );

        let (queue, rx) = EventQueue::new();
        let tracker = AllocationTracker::new(
            store_client,
            subscriptions.clone(),
            queue.clone(),
            &config,
        );

        info!("subscribing to all hosts allocations");
        subscriptions
            .register_for_all_allocations(queue.allocation_callback())
            .await
            .context("error registering for allocation notifications")?;

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            alerter,
            queue,
            rx,
            tracker,
            pulse: EventPulse::new(),
        })
    }

    pub async fn start(mut self) -> Result<()> {
        let watchdog = SilenceWatchdog::new(
            self.pulse.clone(),
            Duration::from_secs(self.config.event_silence_alert_secs),
            self.alerter.clone(),
        );
        tokio::spawn(watchdog.run(self.shutdown_rx.clone()));

        let queue = self.queue.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, stopping the event loop gracefully");
            queue.stop().await;
        });

        let result = self.tracker.run(&mut self.rx, Some(self.pulse.clone())).await;
        let _ = self.shutdown_tx.send(());
        match result {
            Ok(()) => {
                info!("done");
                Ok(())
            }
            Err(err) => {
                error!("critical error, exiting: {err:?}");
                self.alerter
                    .alert(&format!("critical error, exiting: {err:#}"))
                    .await;
                Err(err)
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
