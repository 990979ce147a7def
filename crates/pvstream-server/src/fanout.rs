//! Connection fan-out manager.
//!
//! Multiplexes the subscription sets of many client connections onto the
//! shared [`Dispatcher`]. Each `(connection, variable)` pair owns exactly one
//! dispatcher callback. That callback encodes the update and queues it on the
//! connection's outbox, which the connection's own task drains onto the
//! socket. Callbacks may therefore fire on any thread, including protocol
//! client threads, without touching the socket directly.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pvstream_core::{Dispatcher, PvCallback, PvError, PvUpdate, SubscriptionId};
use pvstream_protocol::encode_update;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Connection {
    outbox: mpsc::Sender<String>,
    /// Variable name -> dispatcher registration
    subscriptions: HashMap<String, SubscriptionId>,
}

/// Registry of connections and the dispatcher callbacks they own.
pub struct FanoutManager {
    dispatcher: Arc<Dispatcher>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
}

impl FanoutManager {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Register a connection whose outgoing messages go to `outbox`.
    pub fn connect(&self, outbox: mpsc::Sender<String>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.lock().insert(
            id,
            Connection {
                outbox,
                subscriptions: HashMap::new(),
            },
        );
        debug!(conn = %id, "Connection registered");
        id
    }

    /// Subscribe a connection to a variable.
    ///
    /// Returns false if the connection is unknown or already subscribed. The
    /// variable's current value, if any, is queued before this returns.
    pub fn subscribe(&self, conn: ConnectionId, name: &str) -> bool {
        let mut connections = self.connections.lock();
        let Some(connection) = connections.get_mut(&conn) else {
            debug!(%conn, pv = %name, "Subscribe on unknown connection");
            return false;
        };
        if connection.subscriptions.contains_key(name) {
            return false;
        }

        let callback = delivery(conn, connection.outbox.clone());
        let id = self.dispatcher.subscribe(name, callback);
        connection.subscriptions.insert(name.to_string(), id);
        debug!(%conn, pv = %name, "Subscribed");
        true
    }

    /// Unsubscribe a connection from a variable. Returns false if it was not
    /// subscribed.
    pub fn unsubscribe(&self, conn: ConnectionId, name: &str) -> bool {
        let mut connections = self.connections.lock();
        let Some(id) = connections
            .get_mut(&conn)
            .and_then(|c| c.subscriptions.remove(name))
        else {
            return false;
        };
        self.dispatcher.unsubscribe(name, id);
        debug!(%conn, pv = %name, "Unsubscribed");
        true
    }

    /// Drop a connection and every subscription it holds.
    ///
    /// Safe to call more than once; returns the number of subscriptions
    /// removed.
    pub fn disconnect(&self, conn: ConnectionId) -> usize {
        let Some(connection) = self.connections.lock().remove(&conn) else {
            return 0;
        };
        let count = connection.subscriptions.len();
        for (name, id) in connection.subscriptions {
            self.dispatcher.unsubscribe(&name, id);
        }
        debug!(%conn, subscriptions = count, "Connection removed");
        count
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Variables a connection is subscribed to, sorted.
    pub fn subscriptions(&self, conn: ConnectionId) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .lock()
            .get(&conn)
            .map(|c| c.subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn total_subscriptions(&self) -> usize {
        self.connections
            .lock()
            .values()
            .map(|c| c.subscriptions.len())
            .sum()
    }
}

/// Build the dispatcher callback for one `(connection, variable)` pair.
fn delivery(conn: ConnectionId, outbox: mpsc::Sender<String>) -> PvCallback {
    Arc::new(move |update: &PvUpdate| -> Result<(), PvError> {
        let text = encode_update(update).map_err(|e| PvError::CallbackFailure {
            name: update.name.clone(),
            reason: e.to_string(),
        })?;
        match outbox.try_send(text) {
            Ok(()) => {}
            // Connection already torn down
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%conn, pv = %update.name, "Outbound queue full, dropping update");
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn manager() -> (Arc<Dispatcher>, FanoutManager) {
        let dispatcher = Arc::new(Dispatcher::new(1_000));
        let manager = FanoutManager::new(dispatcher.clone());
        (dispatcher, manager)
    }

    fn next_json(rx: &mut mpsc::Receiver<String>) -> Option<Value> {
        rx.try_recv().ok().map(|text| serde_json::from_str(&text).unwrap())
    }

    #[test]
    fn test_subscribe_queues_current_value() {
        let (dispatcher, manager) = manager();
        dispatcher.notify("SIM:TEMP:1", json!(25.5), 100.0, 0);

        let (tx, mut rx) = mpsc::channel(16);
        let conn = manager.connect(tx);
        assert!(manager.subscribe(conn, "SIM:TEMP:1"));

        let msg = next_json(&mut rx).unwrap();
        assert_eq!(msg["type"], "pv_update");
        assert_eq!(msg["value"], 25.5);
        assert!(next_json(&mut rx).is_none());
    }

    #[test]
    fn test_duplicate_subscribe_is_idempotent() {
        let (dispatcher, manager) = manager();
        let (tx, mut rx) = mpsc::channel(16);
        let conn = manager.connect(tx);

        assert!(manager.subscribe(conn, "A"));
        assert!(!manager.subscribe(conn, "A"));
        assert_eq!(dispatcher.subscriber_count("A"), 1);

        dispatcher.notify("A", json!(1), 1.0, 0);
        assert!(next_json(&mut rx).is_some());
        assert!(next_json(&mut rx).is_none());
    }

    #[test]
    fn test_unsubscribe() {
        let (dispatcher, manager) = manager();
        let (tx, mut rx) = mpsc::channel(16);
        let conn = manager.connect(tx);

        manager.subscribe(conn, "A");
        assert!(manager.unsubscribe(conn, "A"));
        assert!(!manager.unsubscribe(conn, "A"));
        assert_eq!(dispatcher.subscriber_count("A"), 0);

        dispatcher.notify("A", json!(1), 1.0, 0);
        assert!(next_json(&mut rx).is_none());
    }

    #[test]
    fn test_disconnect_removes_all_callbacks() {
        let (dispatcher, manager) = manager();
        let (tx, _rx) = mpsc::channel(16);
        let conn = manager.connect(tx);
        let (other_tx, _other_rx) = mpsc::channel(16);
        let other = manager.connect(other_tx);

        for name in ["A", "B", "C"] {
            manager.subscribe(conn, name);
        }
        manager.subscribe(other, "A");

        assert_eq!(manager.disconnect(conn), 3);
        assert_eq!(manager.disconnect(conn), 0);
        assert_eq!(dispatcher.total_subscriptions(), 1);
        assert_eq!(dispatcher.subscriber_count("A"), 1);
        assert_eq!(manager.connection_count(), 1);
        assert!(!manager.subscribe(conn, "A"));
    }

    #[test]
    fn test_send_to_closed_connection_is_swallowed() {
        let (dispatcher, manager) = manager();
        let (tx, rx) = mpsc::channel(16);
        let conn = manager.connect(tx);
        manager.subscribe(conn, "A");
        drop(rx);

        dispatcher.notify("A", json!(1), 1.0, 0);
        assert_eq!(dispatcher.current_value("A"), Some(json!(1)));
    }

    #[test]
    fn test_full_outbox_drops_updates() {
        let (dispatcher, manager) = manager();
        let (tx, mut rx) = mpsc::channel(2);
        let conn = manager.connect(tx);
        manager.subscribe(conn, "A");

        for i in 0..5 {
            dispatcher.notify("A", json!(i), i as f64, 0);
        }
        assert_eq!(next_json(&mut rx).unwrap()["value"], 0);
        assert_eq!(next_json(&mut rx).unwrap()["value"], 1);
        assert!(next_json(&mut rx).is_none());
    }

    #[test]
    fn test_foreign_thread_notify_is_delivered() {
        let (dispatcher, manager) = manager();
        let (tx, mut rx) = mpsc::channel(16);
        let conn = manager.connect(tx);
        manager.subscribe(conn, "BL:TEMP");

        let producer = dispatcher.clone();
        std::thread::spawn(move || {
            producer.notify("BL:TEMP", json!(21.0), 5.0, 1);
        })
        .join()
        .unwrap();

        let msg = next_json(&mut rx).unwrap();
        assert_eq!(msg["pv"], "BL:TEMP");
        assert_eq!(msg["severity"], 1);
        assert_eq!(manager.subscriptions(conn), vec!["BL:TEMP".to_string()]);
    }
}
