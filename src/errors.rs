use thiserror::Error;

/// Error kinds surfaced by the gateway core.
///
/// `Clone` so a lazy session can cache its first construction error and
/// replay it to every later acquirer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Catalog spec invalid, missing required field, empty endpoint.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Network I/O, subprocess spawn, connect refused.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Protocol handshake rejected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 401 without a usable challenge.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Cannot obtain protected-resource or authorization-server metadata.
    #[error("authorization discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Metadata document missing a required field, or issuer mismatch.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Dynamic client registration returned non-2xx or an empty client_id.
    #[error("client registration rejected: {0}")]
    RegistrationRejected(String),

    /// Callback or initialize past its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The callback was invoked twice.
    #[error("authorization flow already completed")]
    AlreadyCompleted,

    /// Credential helper lookup miss.
    #[error("not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }

    /// Prefix the error message with context, preserving the kind.
    pub fn wrap(self, context: &str) -> Self {
        use GatewayError::*;
        match self {
            Config(m) => Config(format!("{context}: {m}")),
            Transport(m) => Transport(format!("{context}: {m}")),
            Protocol(m) => Protocol(format!("{context}: {m}")),
            Unauthorized(m) => Unauthorized(format!("{context}: {m}")),
            DiscoveryFailed(m) => DiscoveryFailed(format!("{context}: {m}")),
            InvalidMetadata(m) => InvalidMetadata(format!("{context}: {m}")),
            RegistrationRejected(m) => RegistrationRejected(format!("{context}: {m}")),
            Timeout(m) => Timeout(format!("{context}: {m}")),
            NotFound(m) => NotFound(format!("{context}: {m}")),
            AlreadyCompleted => AlreadyCompleted,
        }
    }
}

/// Best-effort extraction of a human-readable message from an HTTP error
/// body: `error_description` preferred, then `error`, then `message`, then
/// the raw body.
pub(crate) fn message_from_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error_description", "error", "message"] {
            if let Some(msg) = value.get(key).and_then(|v| v.as_str())
                && !msg.is_empty()
            {
                return msg.to_string();
            }
        }
    }
    body.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_prefers_error_description() {
        let body = r#"{"error":"invalid_client","error_description":"redirect mismatch"}"#;
        assert_eq!(message_from_body(body), "redirect mismatch");
    }

    #[test]
    fn test_message_falls_back_to_error() {
        let body = r#"{"error":"invalid_client"}"#;
        assert_eq!(message_from_body(body), "invalid_client");
    }

    #[test]
    fn test_message_falls_back_to_message_field() {
        let body = r#"{"message":"nope"}"#;
        assert_eq!(message_from_body(body), "nope");
    }

    #[test]
    fn test_message_raw_body_for_non_json() {
        assert_eq!(message_from_body("plain failure\n"), "plain failure");
    }

    #[test]
    fn test_errors_are_cloneable() {
        let e = GatewayError::Timeout("initialize".to_string());
        let c = e.clone();
        assert_eq!(e, c);
    }
}
