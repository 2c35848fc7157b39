//! Gateway error taxonomy and JSON-RPC error code mapping
//!
//! Every rejection the gateway produces flows through [`GatewayError`] so
//! that the client always receives a well-formed error envelope carrying
//! its original request id. Socket-level failures are the one exception;
//! those terminate the session instead of producing an envelope.

use crate::envelope;
use crate::store::StoreError;
use serde_json::Value;
use thiserror::Error;

/// Errors produced while admitting, checking or forwarding a request
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The method is not on the configured allow-list
    #[error("method {0} is not allowed")]
    MethodNotAllowed(String),

    /// The body is not a valid JSON-RPC request envelope
    #[error("invalid json request")]
    InvalidRequest,

    /// The raw transaction payload could not be decoded
    #[error("invalid transaction: {0}")]
    TransactionInvalid(String),

    /// No admission rule matched the transaction
    #[error("transaction is not allowed")]
    TransactionNotAllowed,

    /// The sender is not on the deploy allow-list
    #[error("deploy is not allowed")]
    DeployNotAllowed,

    /// The rate-limit bucket for the matched rule is exhausted
    #[error("rate limit exceeded, try again in {wait_secs} seconds")]
    RateLimitExceeded {
        /// Seconds until the current interval can have budget again
        wait_secs: u64,
    },

    /// Upstream gas simulation rejected the transaction
    #[error("{0}")]
    GasCheckFailed(String),

    /// The upstream node could not be reached
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// An internal failure, including exhausted backing-store retries
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The JSON-RPC error code for this error
    pub fn code(&self) -> i64 {
        match self {
            Self::MethodNotAllowed(_) => -32601,
            Self::InvalidRequest => -32700,
            Self::TransactionInvalid(_)
            | Self::TransactionNotAllowed
            | Self::DeployNotAllowed
            | Self::RateLimitExceeded { .. }
            | Self::GasCheckFailed(_) => -32602,
            Self::UpstreamUnreachable(_) | Self::Internal(_) => -32603,
        }
    }

    /// Converts the error into a response envelope for the given request id
    pub fn to_envelope(&self, id: Value) -> Value {
        envelope::error_envelope(id, self.code(), &self.to_string())
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}
