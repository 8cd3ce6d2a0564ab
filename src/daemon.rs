//! JSON-RPC client for the coin daemons
//!
//! The manager fans every command out to all configured instances
//! concurrently and returns the per-instance outcomes in configuration
//! order. Batch requests only ever go to the first instance.

use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use futures::future::join_all;
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;

/// What went wrong talking to one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Connection refused, the daemon is not reachable
    Offline(String),
    /// Request failed in transit
    Transport(String),
    /// The daemon replied but not with parseable JSON-RPC
    Protocol(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline(msg) => write!(f, "offline: {}", msg),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

/// Result of one command against one instance
#[derive(Debug, Clone)]
pub struct RpcOutcome {
    /// Index of the instance in configuration order
    pub instance: usize,
    /// Transport or parse failure, if any
    pub error: Option<RpcError>,
    /// The `result` field of the JSON-RPC response body
    pub response: Option<Value>,
    /// The `error` field of the JSON-RPC response body
    pub rpc_error: Option<Value>,
    /// Raw response body for logging
    pub raw: Option<String>,
}

impl RpcOutcome {
    /// Whether the call reached the daemon and it returned no error
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.rpc_error.as_ref().map_or(true, Value::is_null)
    }
}

/// One configured daemon instance
#[derive(Debug, Clone)]
struct DaemonInstance {
    host: String,
    port: u16,
    user: String,
    password: String,
    index: usize,
}

impl DaemonInstance {
    fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Fan-out JSON-RPC client over all configured daemons
pub struct DaemonManager {
    instances: Vec<DaemonInstance>,
    client: reqwest::Client,
}

impl DaemonManager {
    /// Build a manager from the configured daemon list
    pub fn new(daemons: &[DaemonConfig]) -> Result<Self> {
        if daemons.is_empty() {
            return Err(Error::config("no daemons configured"));
        }
        let instances = daemons
            .iter()
            .enumerate()
            .map(|(index, d)| DaemonInstance {
                host: d.host.clone(),
                port: d.port,
                user: d.user.clone(),
                password: d.password.clone(),
                index,
            })
            .collect();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { instances, client })
    }

    fn request_id() -> u64 {
        crate::util::unix_time() * 1000 + rand::rng().random_range(0..10)
    }

    async fn perform(&self, instance: &DaemonInstance, body: Value) -> RpcOutcome {
        let result = self
            .client
            .post(instance.url())
            .basic_auth(&instance.user, Some(&instance.password))
            .json(&body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                return RpcOutcome {
                    instance: instance.index,
                    error: Some(RpcError::Offline(e.to_string())),
                    response: None,
                    rpc_error: None,
                    raw: None,
                }
            }
            Err(e) => {
                return RpcOutcome {
                    instance: instance.index,
                    error: Some(RpcError::Transport(e.to_string())),
                    response: None,
                    rpc_error: None,
                    raw: None,
                }
            }
        };

        let raw = match response.text().await {
            Ok(raw) => raw,
            Err(e) => {
                return RpcOutcome {
                    instance: instance.index,
                    error: Some(RpcError::Transport(e.to_string())),
                    response: None,
                    rpc_error: None,
                    raw: None,
                }
            }
        };

        // some daemons emit bare -nan in numeric fields
        let cleaned = raw.replace(":-nan,", ":0,");
        match serde_json::from_str::<Value>(&cleaned) {
            // batch requests come back as an array of response objects
            Ok(parsed) if parsed.is_array() => RpcOutcome {
                instance: instance.index,
                error: None,
                rpc_error: None,
                response: Some(parsed),
                raw: Some(raw),
            },
            Ok(mut parsed) => RpcOutcome {
                instance: instance.index,
                error: None,
                rpc_error: parsed.get_mut("error").map(Value::take),
                response: parsed.get_mut("result").map(Value::take),
                raw: Some(raw),
            },
            Err(e) => {
                tracing::error!(
                    instance = instance.index,
                    "could not parse rpc response: {}",
                    e
                );
                RpcOutcome {
                    instance: instance.index,
                    error: Some(RpcError::Protocol(e.to_string())),
                    response: None,
                    rpc_error: None,
                    raw: Some(raw),
                }
            }
        }
    }

    /// Send one command to every instance concurrently. Outcomes come back
    /// in configuration order regardless of completion order.
    pub async fn cmd(&self, method: &str, params: Value) -> Vec<RpcOutcome> {
        let futures = self.instances.iter().map(|instance| {
            let body = json!({
                "method": method,
                "params": params,
                "id": Self::request_id(),
            });
            self.perform(instance, body)
        });
        join_all(futures).await
    }

    /// Send a JSON-RPC batch to the first instance only
    pub async fn batch_cmd(&self, commands: &[(&str, Value)]) -> RpcOutcome {
        let body: Vec<Value> = commands
            .iter()
            .map(|(method, params)| {
                json!({
                    "method": method,
                    "params": params,
                    "id": Self::request_id(),
                })
            })
            .collect();
        self.perform(&self.instances[0], Value::Array(body)).await
    }

    /// Probe every instance with getpeerinfo; errors if any is unreachable
    pub async fn is_online(&self) -> Result<()> {
        let outcomes = self.cmd("getpeerinfo", json!([])).await;
        let offline: Vec<usize> = outcomes
            .iter()
            .filter(|o| !o.is_ok())
            .map(|o| o.instance)
            .collect();
        if offline.is_empty() {
            Ok(())
        } else {
            Err(Error::daemon(format!(
                "failed to connect daemon instance(s) {:?}",
                offline
            )))
        }
    }

    /// Number of configured instances
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}
