//! Live source bridging a threaded protocol client into the dispatcher.
//!
//! Protocol clients deliver monitor updates on their own threads. Those
//! updates are pushed into a bounded queue and a pump task on the runtime
//! hands them to the dispatcher in arrival order. Blocking client calls
//! (`resolve`, `monitor`, `write`, `shutdown`) run on the blocking pool.
//!
//! Monitoring is demand-driven: the first subscriber of a variable triggers
//! discovery and a monitor through the dispatcher's demand hook.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pvstream_core::{Dispatcher, PvError, PvUpdate, Settings, SourceMode};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ValueSource;

/// Capability set of a device-network protocol client.
///
/// Every method may block; callers run them off the async runtime.
pub trait ProtocolClient: Send + Sync + 'static {
    /// Locate a variable on the network.
    fn resolve(&self, name: &str, timeout: Duration) -> Result<(), PvError>;

    /// Start delivering updates for a resolved variable into `sink`.
    fn monitor(&self, name: &str, sink: MonitorSink) -> Result<(), PvError>;

    /// Write a value and wait for the device to acknowledge it.
    fn write(&self, name: &str, value: &Value, timeout: Duration) -> Result<(), PvError>;

    /// Close the client and stop all monitors.
    fn shutdown(&self);
}

/// Thread-safe handle through which protocol clients deliver updates.
#[derive(Debug, Clone)]
pub struct MonitorSink {
    tx: mpsc::Sender<PvUpdate>,
}

impl MonitorSink {
    pub fn new(tx: mpsc::Sender<PvUpdate>) -> Self {
        Self { tx }
    }

    /// Queue an update without blocking. Returns false if it was dropped.
    pub fn push(&self, update: PvUpdate) -> bool {
        match self.tx.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(update)) => {
                warn!(pv = %update.name, "Live update queue full, dropping update");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

struct LiveState {
    client: Arc<dyn ProtocolClient>,
    dispatcher: Arc<Dispatcher>,
    timeout: Duration,
    /// Variables discovered on the network
    resolved: Mutex<HashSet<String>>,
    /// Variables with an active (or pending) monitor
    monitored: Mutex<HashSet<String>>,
}

impl LiveState {
    async fn monitor(self: Arc<Self>, name: String, sink: MonitorSink) {
        if !self.monitored.lock().insert(name.clone()) {
            return;
        }

        let client = self.client.clone();
        let timeout = self.timeout;
        let pv = name.clone();
        let result = tokio::task::spawn_blocking(move || {
            client.resolve(&pv, timeout)?;
            client.monitor(&pv, sink)
        })
        .await
        .map_err(|e| PvError::SourceUnavailable(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(()) => {
                self.resolved.lock().insert(name.clone());
                info!(pv = %name, "Monitoring live variable");
            }
            Err(e) => {
                // Allow a later subscriber to retry
                self.monitored.lock().remove(&name);
                error!(pv = %name, error = %e, "Failed to monitor live variable");
            }
        }
    }
}

/// Source backed by a [`ProtocolClient`].
pub struct LiveSource {
    state: Arc<LiveState>,
    queue_capacity: usize,
    shutdown: Mutex<CancellationToken>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl LiveSource {
    pub fn new(client: Arc<dyn ProtocolClient>, dispatcher: Arc<Dispatcher>, settings: &Settings) -> Self {
        Self {
            state: Arc::new(LiveState {
                client,
                dispatcher,
                timeout: settings.put_timeout(),
                resolved: Mutex::new(HashSet::new()),
                monitored: Mutex::new(HashSet::new()),
            }),
            queue_capacity: settings.live_queue_capacity.max(1),
            shutdown: Mutex::new(CancellationToken::new()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Number of variables currently monitored.
    pub fn monitored_count(&self) -> usize {
        self.state.monitored.lock().len()
    }
}

#[async_trait]
impl ValueSource for LiveSource {
    fn mode(&self) -> SourceMode {
        SourceMode::Live
    }

    async fn start(&self) -> Result<(), PvError> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let (update_tx, mut update_rx) = mpsc::channel::<PvUpdate>(self.queue_capacity);
        let sink = MonitorSink::new(update_tx);

        // Pump: client threads -> bounded queue -> dispatcher
        let dispatcher = self.state.dispatcher.clone();
        let pump_token = token.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_token.cancelled() => break,
                    update = update_rx.recv() => match update {
                        Some(update) => dispatcher.notify_update(update),
                        None => break,
                    },
                }
            }
        }));

        // Demand: first subscriber of a variable -> resolve + monitor
        let (demand_tx, mut demand_rx) = mpsc::unbounded_channel::<String>();
        for name in self.state.dispatcher.watched_variables() {
            let _ = demand_tx.send(name);
        }
        self.state.dispatcher.set_demand_hook(Arc::new(move |name: &str| {
            let _ = demand_tx.send(name.to_string());
        }));

        let state = self.state.clone();
        let demand_token = token.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = demand_token.cancelled() => break,
                    name = demand_rx.recv() => match name {
                        Some(name) => {
                            tokio::spawn(state.clone().monitor(name, sink.clone()));
                        }
                        None => break,
                    },
                }
            }
        }));

        info!("Live source started");
        Ok(())
    }

    async fn stop(&self) {
        self.state.dispatcher.clear_demand_hook();
        self.shutdown.lock().cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in tasks {
            let _ = handle.await;
        }

        let client = self.state.client.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || client.shutdown()).await {
            warn!(error = %e, "Live client shutdown panicked");
        }
        self.state.monitored.lock().clear();
        info!("Live source stopped");
    }

    async fn put(&self, name: &str, value: Value) -> Result<(), PvError> {
        let timeout = self.state.timeout;
        let needs_resolve = !self.state.resolved.lock().contains(name);
        let client = self.state.client.clone();
        let pv = name.to_string();

        let job = tokio::task::spawn_blocking(move || {
            if needs_resolve {
                client.resolve(&pv, timeout)?;
            }
            client.write(&pv, &value, timeout)
        });

        let result = match tokio::time::timeout(timeout, job).await {
            Err(_) => Err(PvError::WriteTimeout {
                name: name.to_string(),
                timeout,
            }),
            Ok(Err(e)) => Err(PvError::rejected(name, e.to_string())),
            Ok(Ok(result)) => result,
        };

        match &result {
            Ok(()) => {
                self.state.resolved.lock().insert(name.to_string());
                debug!(pv = %name, "Live write acknowledged");
            }
            Err(e) => warn!(pv = %name, error = %e, "Live write failed"),
        }
        result
    }

    fn current_value(&self, name: &str) -> Option<Value> {
        self.state.dispatcher.current_value(name)
    }
}
