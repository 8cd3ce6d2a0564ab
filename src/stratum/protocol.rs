//! Stratum wire messages
//!
//! Stratum is line-delimited JSON-RPC 1.0. Responses always carry both
//! `result` and `error` keys, with null for whichever does not apply, since
//! some miner firmware chokes on absent keys.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A request or notification received from a miner
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    /// Request id, absent on notifications
    #[serde(default)]
    pub id: Value,
    /// Method name
    pub method: String,
    /// Positional parameters
    #[serde(default)]
    pub params: Vec<Value>,
}

/// A response sent back to a miner
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    /// Id of the request being answered
    pub id: Value,
    /// Result payload, null on errors
    pub result: Value,
    /// Error tuple, null on success
    pub error: Value,
}

impl RpcResponse {
    /// Successful response
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: Value::Null,
        }
    }

    /// Error response carrying the stratum error tuple
    pub fn err(id: Value, error: StratumError) -> Self {
        Self {
            id,
            result: Value::Null,
            error: error.to_tuple(),
        }
    }
}

/// A server-initiated notification such as mining.notify
#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification {
    /// Always null for notifications
    pub id: Value,
    /// Method name
    pub method: String,
    /// Positional parameters
    pub params: Vec<Value>,
}

impl RpcNotification {
    /// Build a notification for the given method
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Self {
            id: Value::Null,
            method: method.to_string(),
            params,
        }
    }
}

/// Share rejection reasons with their wire codes
#[derive(Debug, Clone, PartialEq)]
pub enum StratumError {
    /// Code 20: malformed submission field sizes or ntime out of range
    Other(String),
    /// Code 21: job id not in the valid-jobs window
    JobNotFound,
    /// Code 22: identical submission already seen on this job
    DuplicateShare,
    /// Code 23: share difficulty below the assigned difficulty
    LowDifficultyShare(f64),
    /// Code 24: submitting worker was never authorized
    UnauthorizedWorker,
    /// Code 25: submission before mining.subscribe
    NotSubscribed,
}

impl StratumError {
    /// Numeric wire code
    pub fn code(&self) -> i64 {
        match self {
            Self::Other(_) => 20,
            Self::JobNotFound => 21,
            Self::DuplicateShare => 22,
            Self::LowDifficultyShare(_) => 23,
            Self::UnauthorizedWorker => 24,
            Self::NotSubscribed => 25,
        }
    }

    /// Human-readable rejection message
    pub fn message(&self) -> String {
        match self {
            Self::Other(msg) => msg.clone(),
            Self::JobNotFound => "job not found".to_string(),
            Self::DuplicateShare => "duplicate share".to_string(),
            Self::LowDifficultyShare(diff) => {
                format!("low difficulty share of {}", diff)
            }
            Self::UnauthorizedWorker => "unauthorized worker".to_string(),
            Self::NotSubscribed => "not subscribed".to_string(),
        }
    }

    /// The `[code, message, null]` tuple stratum puts in the error field
    pub fn to_tuple(&self) -> Value {
        json!([self.code(), self.message(), Value::Null])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parsing() {
        let req: RpcRequest = serde_json::from_str(
            r#"{"id": 1, "method": "mining.subscribe", "params": []}"#,
        )
        .unwrap();
        assert_eq!(req.id, json!(1));
        assert_eq!(req.method, "mining.subscribe");
        assert!(req.params.is_empty());

        // notifications omit the id
        let req: RpcRequest =
            serde_json::from_str(r#"{"method": "mining.extranonce.subscribe"}"#).unwrap();
        assert_eq!(req.id, Value::Null);
    }

    #[test]
    fn test_response_always_carries_both_keys() {
        let ok = serde_json::to_string(&RpcResponse::ok(json!(4), json!(true))).unwrap();
        assert!(ok.contains("\"result\":true"));
        assert!(ok.contains("\"error\":null"));

        let err =
            serde_json::to_string(&RpcResponse::err(json!(5), StratumError::JobNotFound)).unwrap();
        assert!(err.contains("\"result\":null"));
        assert!(err.contains("[21,\"job not found\",null]"));
    }

    #[test]
    fn test_errors_compare_by_value() {
        assert_eq!(
            StratumError::LowDifficultyShare(0.5),
            StratumError::LowDifficultyShare(0.5)
        );
        assert_ne!(
            StratumError::LowDifficultyShare(0.5),
            StratumError::LowDifficultyShare(0.25)
        );
        assert_ne!(StratumError::JobNotFound, StratumError::DuplicateShare);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(StratumError::Other("incorrect size of nonce".into()).code(), 20);
        assert_eq!(StratumError::JobNotFound.code(), 21);
        assert_eq!(StratumError::DuplicateShare.code(), 22);
        assert_eq!(StratumError::LowDifficultyShare(0.5).code(), 23);
        assert_eq!(StratumError::UnauthorizedWorker.code(), 24);
        assert_eq!(StratumError::NotSubscribed.code(), 25);
        assert_eq!(
            StratumError::LowDifficultyShare(0.5).message(),
            "low difficulty share of 0.5"
        );
    }
}
