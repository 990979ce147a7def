//! Subscription registry and update dispatcher.
//!
//! The dispatcher is the single ingestion point for every value source. For
//! each produced value it:
//! 1. stores it as the variable's last value,
//! 2. records it in the time-series cache,
//! 3. invokes every registered callback for that variable, in registration order.
//!
//! New subscribers are seeded synchronously with the last known value so they
//! never wait for the next tick to see state. A failing callback (error or
//! panic) is logged and skipped; delivery to the remaining callbacks continues.
//!
//! Ingestion and seeding of one variable are serialized by a per-variable
//! gate, so every callback observes that variable's samples in production
//! order, including the seed. Different variables never contend.
//!
//! All methods take `&self` and may be called from any thread.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, RwLock};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::PvError;
use crate::history::HistoryCache;
use crate::model::{PvUpdate, Severity};

/// Delivery handler registered for one variable.
pub type PvCallback = Arc<dyn Fn(&PvUpdate) -> Result<(), PvError> + Send + Sync>;

/// Hook invoked when a variable gains its first subscriber.
pub type DemandHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle identifying one registered callback, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Serializes ingestion and seeding of one variable. Reentrant so a callback
/// may notify or subscribe to the variable it is being called for.
type Gate = Arc<ReentrantMutex<()>>;

struct Registration {
    id: SubscriptionId,
    callback: PvCallback,
}

/// Shared registry of last values, history and subscriber callbacks.
pub struct Dispatcher {
    /// Variable name -> callbacks in registration order
    subscriptions: RwLock<HashMap<String, Vec<Registration>>>,
    /// Variable name -> last produced update
    last_values: RwLock<HashMap<String, PvUpdate>>,
    /// Variable name -> delivery gate
    gates: RwLock<HashMap<String, Gate>>,
    history: HistoryCache,
    demand_hook: RwLock<Option<DemandHook>>,
    next_id: AtomicU64,
    notified: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher whose history buffers hold at most `max_raw_points`.
    pub fn new(max_raw_points: usize) -> Self {
        Self::with_history(HistoryCache::new(max_raw_points))
    }

    pub fn with_history(history: HistoryCache) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            last_values: RwLock::new(HashMap::new()),
            gates: RwLock::new(HashMap::new()),
            history,
            demand_hook: RwLock::new(None),
            next_id: AtomicU64::new(1),
            notified: AtomicU64::new(0),
        }
    }

    /// Register a callback for a variable.
    ///
    /// If the variable already has a value, the callback receives it before
    /// this returns.
    pub fn subscribe(&self, name: &str, callback: PvCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let first = {
            let gate = self.gate(name);
            let _guard = gate.lock();

            let first = {
                let mut subs = self.subscriptions.write();
                let list = subs.entry(name.to_string()).or_default();
                list.push(Registration {
                    id,
                    callback: callback.clone(),
                });
                list.len() == 1
            };

            // No notify for this variable can run until the seed is delivered
            let current = self.last_values.read().get(name).cloned();
            if let Some(update) = current {
                self.deliver(&callback, &update);
            }
            first
        };

        if first {
            let hook = self.demand_hook.read().clone();
            if let Some(hook) = hook {
                hook(name);
            }
        }

        debug!(pv = %name, ?id, "Callback registered");
        id
    }

    /// Remove one callback. Returns false if it was not registered.
    ///
    /// Removing the last callback keeps the variable's history and last value.
    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let Some(list) = subs.get_mut(name) else {
            return false;
        };
        let Some(pos) = list.iter().position(|r| r.id == id) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            subs.remove(name);
        }
        true
    }

    /// Ingest a produced value and fan it out.
    pub fn notify(&self, name: &str, value: Value, timestamp: f64, severity: Severity) {
        self.notify_update(PvUpdate::new(name, value, timestamp, severity));
    }

    /// Ingest a produced update and fan it out.
    pub fn notify_update(&self, update: PvUpdate) {
        self.notified.fetch_add(1, Ordering::Relaxed);

        let gate = self.gate(&update.name);
        let _guard = gate.lock();

        self.last_values
            .write()
            .insert(update.name.clone(), update.clone());
        self.history
            .record(&update.name, &update.value, update.timestamp);

        // Snapshot the callbacks so none of them runs under the registry lock
        let callbacks: Vec<PvCallback> = self
            .subscriptions
            .read()
            .get(&update.name)
            .map(|list| list.iter().map(|r| r.callback.clone()).collect())
            .unwrap_or_default();

        for callback in &callbacks {
            self.deliver(callback, &update);
        }
    }

    fn gate(&self, name: &str) -> Gate {
        if let Some(gate) = self.gates.read().get(name) {
            return gate.clone();
        }
        self.gates
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
            .clone()
    }

    fn deliver(&self, callback: &PvCallback, update: &PvUpdate) {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(update))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(pv = %update.name, error = %e, "Subscriber callback failed");
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                let e = PvError::CallbackFailure {
                    name: update.name.clone(),
                    reason,
                };
                error!(pv = %update.name, error = %e, "Subscriber callback panicked");
            }
        }
    }

    /// Install the hook invoked when a variable gains its first subscriber.
    pub fn set_demand_hook(&self, hook: DemandHook) {
        *self.demand_hook.write() = Some(hook);
    }

    pub fn clear_demand_hook(&self) {
        *self.demand_hook.write() = None;
    }

    /// Last update produced for a variable.
    pub fn current(&self, name: &str) -> Option<PvUpdate> {
        self.last_values.read().get(name).cloned()
    }

    /// Last value produced for a variable.
    pub fn current_value(&self, name: &str) -> Option<Value> {
        self.last_values.read().get(name).map(|u| u.value.clone())
    }

    /// The time-series cache fed by this dispatcher.
    pub fn history(&self) -> &HistoryCache {
        &self.history
    }

    /// Number of callbacks registered for a variable.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.subscriptions.read().get(name).map_or(0, Vec::len)
    }

    /// Number of callbacks registered across all variables.
    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions.read().values().map(Vec::len).sum()
    }

    /// Names of all variables with at least one callback, sorted.
    pub fn watched_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of all variables with a last value, sorted.
    pub fn variables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.last_values.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Total updates ingested since creation.
    pub fn notified_count(&self) -> u64 {
        self.notified.load(Ordering::Relaxed)
    }

    /// Forget last values of variables nobody watches and that have not
    /// produced a sample within `max_idle_secs` of `now`.
    ///
    /// History buffers are left untouched. Returns the number of pruned entries.
    pub fn prune_idle(&self, now: f64, max_idle_secs: f64) -> usize {
        let subs = self.subscriptions.read();
        let mut last = self.last_values.write();
        let before = last.len();
        last.retain(|name, update| {
            subs.contains_key(name) || now - update.timestamp <= max_idle_secs
        });
        before - last.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_history(HistoryCache::default())
    }
}
