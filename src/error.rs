//! Error types for the cloud provider

use thiserror::Error;

/// Main error type for provider operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cloud API fault (non-2xx SDK response or transport failure)
    #[error("cloud api error: {message}")]
    CloudApi {
        /// HTTP status code reported by the cloud, when known
        status_code: Option<u16>,
        /// Error detail from the SDK
        message: String,
    },

    /// No offering can currently satisfy the request; the host retries
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// NodeClass selectors have not resolved yet; the host retries
    #[error("nodeclass not ready: {0}")]
    NodeClassNotReady(String),

    /// The backing instance (or NodeClass) no longer exists
    #[error("nodeclaim not found: {0}")]
    NodeClaimNotFound(String),

    /// Validation error for specs, selectors, or options
    #[error("validation error: {0}")]
    Validation(String),

    /// Price feed error
    #[error("price feed error: {0}")]
    PriceFeed(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a cloud API error with the given message and no status code
    pub fn cloud_api(msg: impl Into<String>) -> Self {
        Self::CloudApi {
            status_code: None,
            message: msg.into(),
        }
    }

    /// Create a cloud API error carrying the HTTP status code
    pub fn cloud_api_status(status_code: u16, msg: impl Into<String>) -> Self {
        Self::CloudApi {
            status_code: Some(status_code),
            message: msg.into(),
        }
    }

    /// Create an insufficient-capacity error with the given message
    pub fn insufficient_capacity(msg: impl Into<String>) -> Self {
        Self::InsufficientCapacity(msg.into())
    }

    /// Create a nodeclass-not-ready error with the given message
    pub fn node_class_not_ready(msg: impl Into<String>) -> Self {
        Self::NodeClassNotReady(msg.into())
    }

    /// Create a nodeclaim-not-found error with the given message
    pub fn node_claim_not_found(msg: impl Into<String>) -> Self {
        Self::NodeClaimNotFound(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a price feed error with the given message
    pub fn price_feed(msg: impl Into<String>) -> Self {
        Self::PriceFeed(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True when the error indicates the referenced cloud resource is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NodeClaimNotFound(_) => true,
            Error::CloudApi {
                status_code: Some(code),
                ..
            } => *code == 404,
            _ => false,
        }
    }

    /// True when the error is transient and the host should retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InsufficientCapacity(_) | Error::NodeClassNotReady(_) => true,
            Error::CloudApi { status_code, .. } => {
                // 4xx faults are caller mistakes; everything else may recover
                !matches!(status_code, Some(code) if (400..500).contains(code))
            }
            Error::Kube(_) => true,
            Error::NodeClaimNotFound(_) | Error::Validation(_) | Error::Serialization(_) => false,
            Error::PriceFeed(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_recognized_from_status_code() {
        assert!(Error::cloud_api_status(404, "no such instance").is_not_found());
        assert!(!Error::cloud_api_status(403, "denied").is_not_found());
        assert!(!Error::cloud_api("timeout").is_not_found());
        assert!(Error::node_claim_not_found("instance already terminated").is_not_found());
    }

    #[test]
    fn transient_errors_are_retryable() {
        // Capacity shortages and unresolved selectors recover on their own
        assert!(Error::insufficient_capacity("no offerings").is_retryable());
        assert!(Error::node_class_not_ready("Ready=False").is_retryable());

        // 5xx and transport faults may recover; 4xx will not
        assert!(Error::cloud_api_status(503, "throttled").is_retryable());
        assert!(Error::cloud_api("connection reset").is_retryable());
        assert!(!Error::cloud_api_status(400, "bad request").is_retryable());

        // User and code errors must not be retried
        assert!(!Error::validation("selector term has no fields").is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
        assert!(!Error::node_claim_not_found("gone").is_retryable());
    }

    #[test]
    fn messages_identify_the_subsystem() {
        let err = Error::insufficient_capacity("no launch template configs produced");
        assert!(err.to_string().contains("insufficient capacity"));

        let err = Error::node_class_not_ready("condition Ready is False");
        assert!(err.to_string().contains("nodeclass not ready"));

        let err = Error::cloud_api_status(500, "internal error");
        assert!(err.to_string().contains("cloud api error"));
    }
}
