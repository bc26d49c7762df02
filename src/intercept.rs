use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tracing::warn;

use crate::protocol::Direction;
use crate::proxy::ProxyMessage;
use crate::sink::QuerySink;

/// Endpoints of one live proxied connection.
struct Endpoints {
    client: String,
    server: String,
}

/// Binds the proxy's event stream to the query sink: one line per
/// reconstructed statement, prefixed with the client endpoint it came from.
/// Also drives the optional raw-traffic hex dump.
///
/// Holds the registry of live connections; an entry exists exactly as long
/// as the connection it describes.
pub struct Recorder {
    sink: Box<dyn QuerySink>,
    hex_dump: Option<HexDump>,
    connections: HashMap<u64, Endpoints>,
}

impl Recorder {
    pub fn new(sink: Box<dyn QuerySink>, hex_dump: Option<HexDump>) -> Self {
        Self {
            sink,
            hex_dump,
            connections: HashMap::new(),
        }
    }

    pub fn handle(&mut self, msg: ProxyMessage) {
        match msg {
            ProxyMessage::ConnectionOpened {
                conn_id,
                client_addr,
                server_addr,
            } => {
                self.connections.insert(
                    conn_id,
                    Endpoints {
                        client: client_addr,
                        server: server_addr,
                    },
                );
            }
            ProxyMessage::ConnectionClosed { conn_id } => {
                self.connections.remove(&conn_id);
            }
            ProxyMessage::Query { conn_id, sql } => {
                let Some(endpoints) = self.connections.get(&conn_id) else {
                    return;
                };
                let line = format!("{} {}", endpoints.client, sql);
                // A failed write loses the line, never the connection.
                if let Err(e) = self.sink.append_line(&line) {
                    warn!("query sink write failed: {e}");
                }
            }
            ProxyMessage::Traffic {
                conn_id,
                direction,
                data,
            } => {
                if let (Some(hex_dump), Some(endpoints)) =
                    (self.hex_dump.as_mut(), self.connections.get(&conn_id))
                {
                    hex_dump.dump(direction, endpoints, &data);
                }
            }
        }
    }
}

/// Debug tap: one appended line per forwarded chunk, with both endpoints and
/// the whole payload hex-encoded.
pub struct HexDump {
    file: File,
}

impl HexDump {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening hex dump file {}", path.display()))?;
        Ok(Self { file })
    }

    fn dump(&mut self, direction: Direction, endpoints: &Endpoints, data: &[u8]) {
        let result = writeln!(
            self.file,
            "{direction} client={:<22} server={:<22} len={:>5} hex={}",
            endpoints.client,
            endpoints.server,
            data.len(),
            hex::encode(data)
        )
        .and_then(|_| self.file.flush());
        if let Err(e) = result {
            warn!("hex dump write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct CaptureSink {
        lines: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl QuerySink for CaptureSink {
        fn append_line(&mut self, line: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("disk on fire");
            }
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    fn recorder_with_capture(fail: bool) -> (Recorder, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = CaptureSink {
            lines: lines.clone(),
            fail,
        };
        (Recorder::new(Box::new(sink), None), lines)
    }

    fn opened(conn_id: u64) -> ProxyMessage {
        ProxyMessage::ConnectionOpened {
            conn_id,
            client_addr: "10.0.0.7:55100".to_string(),
            server_addr: "127.0.0.1:5432".to_string(),
        }
    }

    #[test]
    fn query_lines_carry_client_endpoint() {
        let (mut recorder, lines) = recorder_with_capture(false);
        recorder.handle(opened(1));
        recorder.handle(ProxyMessage::Query {
            conn_id: 1,
            sql: "SELECT 1".to_string(),
        });
        assert_eq!(*lines.lock().unwrap(), vec!["10.0.0.7:55100 SELECT 1"]);
    }

    #[test]
    fn registry_follows_connection_lifecycle() {
        let (mut recorder, lines) = recorder_with_capture(false);
        recorder.handle(opened(3));
        assert!(recorder.connections.contains_key(&3));

        recorder.handle(ProxyMessage::ConnectionClosed { conn_id: 3 });
        assert!(recorder.connections.is_empty());

        // Events for a dead or unknown connection are dropped.
        recorder.handle(ProxyMessage::Query {
            conn_id: 3,
            sql: "SELECT 1".to_string(),
        });
        assert!(lines.lock().unwrap().is_empty());
    }

    #[test]
    fn sink_failure_is_swallowed() {
        let (mut recorder, _) = recorder_with_capture(true);
        recorder.handle(opened(1));
        recorder.handle(ProxyMessage::Query {
            conn_id: 1,
            sql: "SELECT 1".to_string(),
        });
        // Still alive and processing afterwards.
        recorder.handle(ProxyMessage::ConnectionClosed { conn_id: 1 });
        assert!(recorder.connections.is_empty());
    }
}
