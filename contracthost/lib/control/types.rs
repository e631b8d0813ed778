//! Request and response bodies of the control plane.

use serde::{Deserialize, Serialize};

use crate::{manager::InstanceInfo, token::Token};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Response body for the /health endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "ok" while the host is serving
    pub status: String,
    /// Number of live contract instances
    pub live_instances: usize,
}

/// Response body for the /token/{token} endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The token queried
    pub token: Token,
    /// The balance the token holds
    pub balance: u64,
    /// The live instance serving the token, if any
    pub instance: Option<InstanceInfo>,
}

/// Query string of the /token/{token}/fund endpoint
#[derive(Debug, Deserialize)]
pub struct FundQuery {
    /// Units to add; defaults to the configured funding amount
    pub amount: Option<u64>,
}

/// Response body for the /token/{token}/fund endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct FundResponse {
    /// The token funded
    pub token: Token,
    /// The balance after funding
    pub balance: u64,
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}
