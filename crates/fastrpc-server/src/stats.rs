use serde::{Deserialize, Serialize};

/// Lifecycle state of a connection as seen in a stats snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Running,
    /// Input is over (or the socket failed); waiting for pending requests.
    Draining,
}

/// Counters for one live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub conn_id: u32,
    pub label: String,
    pub state: ConnectionState,
    pub pending: usize,
    pub started: u64,
    pub completed: u64,
    pub errors: u64,
}

/// Counters for one registered RPC method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodStats {
    pub name: String,
    pub started: u64,
    pub completed: u64,
    pub errors: u64,
}

/// Point-in-time snapshot of the server's bookkeeping.
///
/// Connections are sorted by id and methods by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerStats {
    pub closed: bool,
    pub connections: Vec<ConnectionStats>,
    pub methods: Vec<MethodStats>,
    /// Messages received for connections no longer in the table.
    pub ignored_noconn: u64,
    /// Messages received on connections that had already failed or ended.
    pub ignored_badconn: u64,
    /// ERROR messages from clients (legacy abort requests).
    pub ignored_aborts: u64,
}

impl ServerStats {
    pub fn connection(&self, conn_id: u32) -> Option<&ConnectionStats> {
        self.connections.iter().find(|c| c.conn_id == conn_id)
    }

    pub fn method(&self, name: &str) -> Option<&MethodStats> {
        self.methods.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stats_serialization() {
        let stats = ServerStats {
            closed: false,
            connections: vec![ConnectionStats {
                conn_id: 1,
                label: "127.0.0.1:5000".to_string(),
                state: ConnectionState::Draining,
                pending: 2,
                started: 5,
                completed: 3,
                errors: 1,
            }],
            methods: vec![MethodStats {
                name: "echo".to_string(),
                started: 5,
                completed: 3,
                errors: 1,
            }],
            ignored_noconn: 0,
            ignored_badconn: 0,
            ignored_aborts: 4,
        };

        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["connections"][0]["state"], json!("draining"));
        assert_eq!(value["ignored_aborts"], json!(4));

        let parsed: ServerStats = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, stats);
        assert_eq!(parsed.connection(1).map(|c| c.pending), Some(2));
        assert!(parsed.connection(2).is_none());
        assert_eq!(parsed.method("echo").map(|m| m.errors), Some(1));
    }
}
