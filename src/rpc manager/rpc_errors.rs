use thiserror::Error;

/// Errors returned by endpoint calls
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Transport-level errors (network, connection)
    #[error("Transport error: {message} (endpoint: {endpoint})")]
    Transport { endpoint: String, message: String },

    /// Call did not finish within its deadline
    #[error("Timeout after {timeout_ms}ms (endpoint: {endpoint})")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// JSON-RPC error object returned by the node
    #[error("RPC response error: {message} (endpoint: {endpoint}, code: {code})")]
    Response {
        endpoint: String,
        code: i64,
        message: String,
    },

    /// Response could not be decoded into the expected shape
    #[error("Decode error: {message} (endpoint: {endpoint})")]
    Decode { endpoint: String, message: String },

    /// Node already holds this transaction in its pool
    #[error("Transaction already known (endpoint: {endpoint})")]
    AlreadyKnown { endpoint: String },

    /// Endpoint provider had nothing to offer
    #[error("No endpoints available")]
    NoEndpoints,
}

/// Result alias for endpoint calls
pub type RpcResult<T> = Result<T, RpcError>;

impl RpcError {
    /// Check if this error is retryable on the same or another endpoint
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Transport { .. } => true,
            RpcError::Timeout { .. } => true,
            RpcError::NoEndpoints => true,
            // Server-side failures (-32000 family covers "header not found" etc.)
            RpcError::Response { code, .. } => *code <= -32000 && *code > -32100,
            RpcError::Decode { .. } => false,
            RpcError::AlreadyKnown { .. } => false,
        }
    }

    /// Submission treats an "already known" rejection as acceptance
    pub fn is_already_known(&self) -> bool {
        matches!(self, RpcError::AlreadyKnown { .. })
    }

    /// Endpoint name the error originated from, if any
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            RpcError::Transport { endpoint, .. }
            | RpcError::Timeout { endpoint, .. }
            | RpcError::Response { endpoint, .. }
            | RpcError::Decode { endpoint, .. }
            | RpcError::AlreadyKnown { endpoint } => Some(endpoint),
            RpcError::NoEndpoints => None,
        }
    }

    /// Map a node error message onto the error taxonomy
    pub fn from_response(endpoint: &str, code: i64, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("already known") || lower.contains("known transaction") {
            return RpcError::AlreadyKnown {
                endpoint: endpoint.to_string(),
            };
        }
        RpcError::Response {
            endpoint: endpoint.to_string(),
            code,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_known_is_detected() {
        let err = RpcError::from_response("node-a", -32000, "already known");
        assert!(err.is_already_known());
        assert!(!err.is_retryable());

        let err = RpcError::from_response("node-a", -32000, "Known transaction: 0xabc");
        assert!(err.is_already_known());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RpcError::Timeout {
            endpoint: "a".into(),
            timeout_ms: 100
        }
        .is_retryable());
        assert!(RpcError::from_response("a", -32000, "header not found").is_retryable());
        assert!(!RpcError::from_response("a", -32602, "invalid params").is_retryable());
        assert!(!RpcError::Decode {
            endpoint: "a".into(),
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_endpoint_name() {
        assert_eq!(
            RpcError::AlreadyKnown {
                endpoint: "b".into()
            }
            .endpoint(),
            Some("b")
        );
        assert_eq!(RpcError::NoEndpoints.endpoint(), None);
    }
}
