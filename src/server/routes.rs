//! HTTP route handlers.
//!
//! Each handler submits to the issue worker and answers with the terminal
//! status or a generic error. A caller that hangs up does not cancel the
//! issuance.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::{error, info};

use crate::engine::dispatch::IssueQueue;
use crate::types::{DepositRequest, WithdrawalRequest};

/// Shared state accessible by all route handlers.
pub type AppState = IssueQueue;

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// The body every failure answers with.
pub fn server_error() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "server error".to_string(),
        }),
    )
}

/// POST /user-deposit
pub async fn user_deposit(
    State(queue): State<AppState>,
    Json(request): Json<DepositRequest>,
) -> impl IntoResponse {
    let participant = request.id.clone();
    match queue.deposit(request).await {
        Ok(receipt) => {
            info!(%participant, offer_id = %receipt.offer_id, "Deposit offer sent");
            Json(StatusResponse {
                status: receipt.status_line(),
            })
            .into_response()
        }
        Err(e) => {
            error!(%participant, error = %e, "Deposit failed");
            server_error().into_response()
        }
    }
}

/// POST /user-withdraw
pub async fn user_withdraw(
    State(queue): State<AppState>,
    Json(request): Json<WithdrawalRequest>,
) -> impl IntoResponse {
    let winner = request.winner.id.clone();
    match queue.withdraw(request).await {
        Ok(receipt) => {
            info!(%winner, offer_id = %receipt.offer_id, rake = %receipt.rake, "Payout offer sent");
            Json(StatusResponse {
                status: receipt.status_line(),
            })
            .into_response()
        }
        Err(e) => {
            error!(%winner, error = %e, "Withdrawal failed");
            server_error().into_response()
        }
    }
}

/// GET /health
pub async fn health() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
    })
}

/// Any route not listed above.
pub async fn fallback() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "server error".to_string(),
        }),
    )
}
