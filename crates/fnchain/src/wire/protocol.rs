//! Message types of the duplex call protocol.
//!
//! One call on a connection is:
//!
//! ```text
//! client ──▶ Call(header) Data* Status
//! server ──▶ Data* Status
//! ```
//!
//! Calls on one connection are sequential. Either side closes the connection
//! after a failed call.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

use crate::error::CallError;
use crate::options::CallOptions;

/// Correlates log lines of one call across gateway and runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call-scoped metadata, sent once before any payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHeader {
    #[serde(default)]
    pub call_id: CallId,
    /// Function identifiers, in pipeline order.
    pub chain: Vec<String>,
    /// One options list per identifier.
    pub options: Vec<CallOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CallHeader {
    pub fn new(chain: Vec<String>, options: Vec<CallOptions>) -> Self {
        Self {
            call_id: CallId::new(),
            chain,
            options,
            timeout_ms: None,
        }
    }

    /// Header for a call to a single function.
    pub fn single(function: impl Into<String>, options: CallOptions) -> Self {
        Self::new(vec![function.into()], vec![options])
    }

    pub fn with_call_id(mut self, call_id: CallId) -> Self {
        self.call_id = call_id;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }

    /// Reject headers whose chain and options disagree.
    pub fn validate(&self) -> Result<(), CallError> {
        if self.chain.is_empty() {
            return Err(CallError::EmptyChain);
        }
        if self.chain.len() != self.options.len() {
            return Err(CallError::Malformed(format!(
                "chain/option count mismatch: {} functions, {} option sets",
                self.chain.len(),
                self.options.len()
            )));
        }
        if let Some(blank) = self.chain.iter().position(|id| id.trim().is_empty()) {
            return Err(CallError::Malformed(format!("hop {blank} has an empty identifier")));
        }
        Ok(())
    }
}

/// Terminal status of one direction of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatus {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn from_result(result: &Result<(), CallError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Call(CallHeader),
    Data(Bytes),
    Status(CallStatus),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call(_) => "call",
            Self::Data(_) => "data",
            Self::Status(_) => "status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_json_shape() {
        let header = CallHeader::new(
            vec!["upper".into(), "http://rev:9000".into()],
            vec![CallOptions::parse(["n=1"]), CallOptions::new()],
        );
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["chain"], serde_json::json!(["upper", "http://rev:9000"]));
        assert_eq!(json["options"], serde_json::json!([["n=1"], []]));
        assert!(json.get("timeout_ms").is_none());
        assert!(json["call_id"].is_string());
    }

    #[test]
    fn header_without_call_id_gets_one() {
        let header: CallHeader =
            serde_json::from_str(r#"{"chain":["echo"],"options":[[]],"timeout_ms":1500}"#).unwrap();
        assert_eq!(header.timeout(), Some(std::time::Duration::from_millis(1500)));
        header.validate().unwrap();
    }

    #[test]
    fn count_mismatch_is_malformed() {
        let header = CallHeader::new(vec!["a".into(), "b".into()], vec![CallOptions::new()]);
        let err = header.validate().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MalformedExpression);
        assert!(err.to_string().contains("chain/option count mismatch"));
    }

    #[test]
    fn empty_chain_is_rejected() {
        let header = CallHeader::new(vec![], vec![]);
        assert!(matches!(header.validate(), Err(CallError::EmptyChain)));
    }

    #[test]
    fn status_from_result() {
        assert_eq!(CallStatus::from_result(&Ok(())), CallStatus::ok());
        insta::assert_json_snapshot!(
            CallStatus::from_result(&Err(CallError::ProcessDied)),
            @r#"
        {
          "success": false,
          "error": "process died during call"
        }
        "#
        );
    }
}
