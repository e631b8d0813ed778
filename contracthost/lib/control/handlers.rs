//! HTTP request handlers of the control plane.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::{
    types::{ErrorResponse, FundQuery, FundResponse, HealthResponse, TokenResponse},
    ControlState,
};
use crate::{config::DEFAULT_FUNDING_AMOUNT, HostError, HostResult};

//-------------------------------------------------------------------------------------------------
// Functions: Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for the GET /health endpoint
pub async fn health_handler(State(state): State<ControlState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        live_instances: state.manager.live_count(),
    })
}

/// Handler for the GET /token/{token} endpoint
///
/// Returns the balance of the token and a snapshot of its live instance.
pub async fn token_handler(
    State(state): State<ControlState>,
    Path(token): Path<String>,
) -> Response {
    match handle_token(&state, &token).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the POST /token/{token}/fund endpoint
///
/// Adds compute units to the balance of the token.
pub async fn fund_handler(
    State(state): State<ControlState>,
    Path(token): Path<String>,
    Query(query): Query<FundQuery>,
) -> Response {
    let amount = query.amount.unwrap_or(DEFAULT_FUNDING_AMOUNT);
    match handle_fund(&state, &token, amount).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

//-------------------------------------------------------------------------------------------------
// Functions: Helpers
//-------------------------------------------------------------------------------------------------

async fn handle_token(state: &ControlState, token: &str) -> HostResult<TokenResponse> {
    let token = state.matcher.parse(token)?;
    let balance = state.ledger.get_balance(&token).await?;
    let instance = state.manager.instance(&token);

    Ok(TokenResponse {
        token,
        balance,
        instance,
    })
}

async fn handle_fund(state: &ControlState, token: &str, amount: u64) -> HostResult<FundResponse> {
    let token = state.matcher.parse(token)?;
    let balance = state.ledger.credit(&token, amount).await?;
    tracing::info!(token = %token, amount, balance, "funded token");

    Ok(FundResponse { token, balance })
}

fn error_response(error: HostError) -> Response {
    let status = match &error {
        HostError::InvalidToken(_) => StatusCode::BAD_REQUEST,
        HostError::TokenNotFound(_) => StatusCode::NOT_FOUND,
        _ => {
            tracing::error!(error = %error, "control plane request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}
