use std::sync::{Arc, Mutex};

use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tracing::info;

use crate::alerts::Alerter;

/// Shared timestamp of the most recently processed event. Ticked by the
/// event loop, read by the watchdog.
#[derive(Clone)]
pub struct EventPulse {
    last_event: Arc<Mutex<Instant>>,
}

impl EventPulse {
    pub fn new() -> Self {
        Self {
            last_event: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn tick(&self) {
        *self.last_event.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> tokio::time::Duration {
        self.last_event.lock().unwrap().elapsed()
    }
}

/// Raises a warning alert when no event has been processed for the
/// configured period and an informational alert when events resume. One
/// alert per silence episode.
pub struct SilenceWatchdog {
    pulse: EventPulse,
    threshold: tokio::time::Duration,
    poll_interval: tokio::time::Duration,
    alerter: Arc<dyn Alerter>,
}

impl SilenceWatchdog {
    pub fn new(
        pulse: EventPulse,
        threshold: tokio::time::Duration,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            pulse,
            threshold,
            poll_interval: tokio::time::Duration::from_secs(60),
            alerter,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<()>) {
        let mut silent = false;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let idle = self.pulse.idle_for();
                    if !silent && idle >= self.threshold {
                        silent = true;
                        self.alerter
                            .alert(&format!(
                                "no events were observed during the last {} seconds",
                                idle.as_secs()
                            ))
                            .await;
                    } else if silent && idle < self.threshold {
                        silent = false;
                        self.alerter.alert("events are being observed again").await;
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("silence watchdog shutting down");
                    break;
                }
            }
        }
    }
}
