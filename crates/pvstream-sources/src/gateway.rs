//! Line-JSON gateway protocol client.
//!
//! Talks to a device gateway over TCP using one JSON object per line.
//!
//! Requests carry an `op` and a request `id`:
//! ```json
//! {"op": "resolve", "id": 1, "pv": "BL:TEMP"}
//! {"op": "monitor", "id": 2, "pv": "BL:TEMP"}
//! {"op": "put", "id": 3, "pv": "BL:MTR:VAL", "value": 12.5}
//! {"op": "shutdown", "id": 4}
//! ```
//!
//! The gateway answers each request with an acknowledgement and pushes monitor
//! updates as they happen:
//! ```json
//! {"ack": 3, "ok": false, "error": "read-only"}
//! {"pv": "BL:TEMP", "value": 25.3, "severity": 0, "timestamp": 1700000000.5}
//! ```
//!
//! A dedicated reader thread routes acknowledgements to the waiting caller and
//! updates to the sink registered for the variable.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use pvstream_core::{now_epoch, PvError, PvUpdate, Severity, SEVERITY_NORMAL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::live::{MonitorSink, ProtocolClient};

#[derive(Debug, Serialize)]
struct Request<'a> {
    op: &'a str,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pv: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct Ack {
    ack: u64,
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Update {
    pv: String,
    value: Value,
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    timestamp: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Reply {
    Ack(Ack),
    Update(Update),
}

type Pending = Arc<Mutex<HashMap<u64, mpsc::Sender<Ack>>>>;
type Sinks = Arc<Mutex<HashMap<String, MonitorSink>>>;

/// Protocol client for a line-JSON device gateway.
pub struct LineGatewayClient {
    writer: Mutex<TcpStream>,
    pending: Pending,
    sinks: Sinks,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LineGatewayClient {
    /// Connect to the gateway at `addr`.
    ///
    /// `timeout` bounds the connection attempt and every request that does
    /// not carry its own timeout.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, PvError> {
        let unavailable = |e: std::io::Error| PvError::SourceUnavailable(format!("{addr}: {e}"));

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(unavailable)?
            .next()
            .ok_or_else(|| PvError::SourceUnavailable(format!("{addr}: no address")))?;
        let stream = TcpStream::connect_timeout(&socket_addr, timeout).map_err(unavailable)?;
        stream.set_nodelay(true).map_err(unavailable)?;
        let read_half = stream.try_clone().map_err(unavailable)?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let sinks: Sinks = Arc::new(Mutex::new(HashMap::new()));

        let reader = {
            let pending = pending.clone();
            let sinks = sinks.clone();
            std::thread::Builder::new()
                .name("pvstream-gateway".to_string())
                .spawn(move || read_loop(read_half, pending, sinks))
                .map_err(unavailable)?
        };

        debug!(%addr, "Gateway connection established");
        Ok(Self {
            writer: Mutex::new(stream),
            pending,
            sinks,
            next_id: AtomicU64::new(1),
            request_timeout: timeout,
            reader: Mutex::new(Some(reader)),
        })
    }

    fn request(
        &self,
        op: &str,
        pv: Option<&str>,
        value: Option<&Value>,
        timeout: Duration,
    ) -> Result<Ack, PvError> {
        let name = pv.unwrap_or_default();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.pending.lock().insert(id, tx);

        let line = serde_json::to_string(&Request { op, id, pv, value })
            .map_err(|e| PvError::rejected(name, e.to_string()))?;
        let sent = {
            let mut writer = self.writer.lock();
            writer
                .write_all(line.as_bytes())
                .and_then(|_| writer.write_all(b"\n"))
                .and_then(|_| writer.flush())
        };
        if let Err(e) = sent {
            self.pending.lock().remove(&id);
            return Err(PvError::SourceUnavailable(e.to_string()));
        }

        match rx.recv_timeout(timeout) {
            Ok(ack) => Ok(ack),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.pending.lock().remove(&id);
                Err(PvError::WriteTimeout {
                    name: name.to_string(),
                    timeout,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(PvError::SourceUnavailable(
                "gateway connection closed".to_string(),
            )),
        }
    }
}

impl ProtocolClient for LineGatewayClient {
    fn resolve(&self, name: &str, timeout: Duration) -> Result<(), PvError> {
        let ack = self.request("resolve", Some(name), None, timeout)?;
        if ack.ok {
            Ok(())
        } else {
            Err(PvError::UnknownVariable(name.to_string()))
        }
    }

    fn monitor(&self, name: &str, sink: MonitorSink) -> Result<(), PvError> {
        self.sinks.lock().insert(name.to_string(), sink);
        let result = self
            .request("monitor", Some(name), None, self.request_timeout)
            .and_then(|ack| {
                if ack.ok {
                    Ok(())
                } else {
                    Err(PvError::UnknownVariable(name.to_string()))
                }
            });
        if result.is_err() {
            self.sinks.lock().remove(name);
        }
        result
    }

    fn write(&self, name: &str, value: &Value, timeout: Duration) -> Result<(), PvError> {
        let ack = self.request("put", Some(name), Some(value), timeout)?;
        if ack.ok {
            Ok(())
        } else {
            Err(PvError::rejected(
                name,
                ack.error.unwrap_or_else(|| "rejected by gateway".to_string()),
            ))
        }
    }

    fn shutdown(&self) {
        if let Err(e) = self.request("shutdown", None, None, self.request_timeout) {
            debug!(error = %e, "Gateway did not acknowledge shutdown");
        }
        let _ = self.writer.lock().shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }
        self.sinks.lock().clear();
    }
}

fn read_loop(stream: TcpStream, pending: Pending, sinks: Sinks) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "Gateway read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Reply>(&line) {
            Ok(Reply::Ack(ack)) => {
                if let Some(tx) = pending.lock().remove(&ack.ack) {
                    let _ = tx.send(ack);
                }
            }
            Ok(Reply::Update(update)) => {
                let sink = sinks.lock().get(&update.pv).cloned();
                if let Some(sink) = sink {
                    sink.push(PvUpdate::new(
                        update.pv,
                        update.value,
                        update.timestamp.unwrap_or_else(now_epoch),
                        update.severity.unwrap_or(SEVERITY_NORMAL),
                    ));
                }
            }
            Err(e) => warn!(error = %e, "Malformed gateway message"),
        }
    }

    // Wake every caller still waiting for an acknowledgement
    pending.lock().clear();
    error!("Gateway connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::TcpListener;

    /// Single-connection gateway knowing the variables prefixed `GW:`.
    fn fake_gateway() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let reader = BufReader::new(stream);

            for line in reader.lines() {
                let Ok(line) = line else { break };
                let req: Value = serde_json::from_str(&line).unwrap();
                let id = req["id"].as_u64().unwrap();
                let pv = req["pv"].as_str().unwrap_or_default().to_string();
                let known = pv.starts_with("GW:");

                let reply = match req["op"].as_str().unwrap() {
                    "resolve" => json!({"ack": id, "ok": known}),
                    "monitor" => json!({"ack": id, "ok": known}),
                    "put" if pv == "GW:HANG" => continue,
                    "put" if req["value"].is_number() => json!({"ack": id, "ok": true}),
                    "put" => json!({"ack": id, "ok": false, "error": "type mismatch"}),
                    _ => {
                        let _ = writeln!(writer, "{}", json!({"ack": id, "ok": true}));
                        break;
                    }
                };
                writeln!(writer, "{reply}").unwrap();

                if req["op"] == "monitor" && known {
                    for i in 0..3 {
                        let update = json!({"pv": pv, "value": i, "severity": 0, "timestamp": 10.0 + i as f64});
                        writeln!(writer, "{update}").unwrap();
                    }
                }
            }
        });

        addr
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = LineGatewayClient::connect(&addr, Duration::from_millis(500))
            .err()
            .unwrap();
        assert!(matches!(err, PvError::SourceUnavailable(_)));
    }

    #[test]
    fn test_resolve_and_write() {
        let addr = fake_gateway();
        let client = LineGatewayClient::connect(&addr, Duration::from_secs(2)).unwrap();
        let timeout = Duration::from_secs(2);

        client.resolve("GW:TEMP", timeout).unwrap();
        assert_eq!(
            client.resolve("OTHER", timeout).unwrap_err(),
            PvError::UnknownVariable("OTHER".to_string())
        );

        client.write("GW:VAL", &json!(1.5), timeout).unwrap();
        let err = client.write("GW:VAL", &json!("x"), timeout).unwrap_err();
        assert_eq!(err, PvError::rejected("GW:VAL", "type mismatch"));

        client.shutdown();
    }

    #[test]
    fn test_write_timeout() {
        let addr = fake_gateway();
        let client = LineGatewayClient::connect(&addr, Duration::from_secs(2)).unwrap();

        let err = client
            .write("GW:HANG", &json!(1), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, PvError::WriteTimeout { .. }));

        client.shutdown();
    }

    #[test]
    fn test_monitor_delivers_updates() {
        let addr = fake_gateway();
        let client = LineGatewayClient::connect(&addr, Duration::from_secs(2)).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);

        client.monitor("GW:TEMP", MonitorSink::new(tx)).unwrap();

        let updates: Vec<PvUpdate> = (0..3).map(|_| rx.blocking_recv().unwrap()).collect();
        assert_eq!(
            updates,
            vec![
                PvUpdate::new("GW:TEMP", 0, 10.0, 0),
                PvUpdate::new("GW:TEMP", 1, 11.0, 0),
                PvUpdate::new("GW:TEMP", 2, 12.0, 0),
            ]
        );

        client.shutdown();
    }
}
