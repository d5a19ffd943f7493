//! Error types for Consul discovery.

use reqwest::StatusCode;
use thiserror::Error;

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for discovery failures.
#[derive(Error, Debug)]
pub enum Error {
    /// The target descriptor could not be parsed or is incomplete.
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget {
        /// The offending target.
        target: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A query parameter of the target has a malformed value.
    #[error("invalid value '{value}' for parameter '{name}': {reason}")]
    InvalidParameter {
        /// The parameter name.
        name: String,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The HTTP client failed to build or a request failed in transit.
    #[error("Consul request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Consul answered with a non-success status.
    #[error("Consul returned {status}: {body}")]
    Status {
        /// The HTTP status.
        status: StatusCode,
        /// The response body, as text.
        body: String,
    },

    /// A blocking query response did not carry a usable `X-Consul-Index` header.
    #[error("Consul response has no valid X-Consul-Index header")]
    MissingIndex,

    /// The response body could not be decoded.
    #[error("failed to decode Consul response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The address sink no longer accepts updates.
    #[error("address sink closed")]
    SinkClosed,
}
