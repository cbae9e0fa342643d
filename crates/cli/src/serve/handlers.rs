//! HTTP route handlers for the subscription API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use remit_engine::{ChargeError, GrantRequest, IssueError};
use remit_ledger::from_base_units;
use remit_store::{StoreError, Subscription};
use time::OffsetDateTime;

use super::state::AppState;
use super::json_error;

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// POST /subscriptions
///
/// Records a pending grant and returns the delegate's public credential
/// for the external approval flow. The private credential never leaves
/// the store.
pub(crate) async fn handle_create_grant(
    State(state): State<Arc<AppState>>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let owner_account = match parsed.get("owner_account").and_then(|v| v.as_str()) {
        Some(s) => s.to_string(),
        None => {
            return json_error(StatusCode::BAD_REQUEST, "missing 'owner_account' field")
                .into_response()
        }
    };
    let source_account = match parsed.get("source_account").and_then(|v| v.as_str()) {
        Some(s) => s.to_string(),
        None => {
            return json_error(StatusCode::BAD_REQUEST, "missing 'source_account' field")
                .into_response()
        }
    };
    let periods = match parsed
        .get("periods")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
    {
        Some(p) => p,
        None => {
            return json_error(StatusCode::BAD_REQUEST, "missing or invalid 'periods' field")
                .into_response()
        }
    };
    let period_amount = match parsed
        .get("period_amount")
        .and_then(|v| v.as_u64())
        .or(state.default_period_amount)
    {
        Some(a) => a,
        None => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "missing 'period_amount' and no default rate configured",
            )
            .into_response()
        }
    };

    let request = GrantRequest {
        owner_account,
        source_account: source_account.clone(),
        period_amount,
        periods,
    };

    match state.issuer.issue(request, OffsetDateTime::now_utc()).await {
        Ok((id, delegate_public)) => {
            // Demo mode: the mock ledger stands in for the external
            // approval flow, so fund the account and record the
            // allowance as an approval transaction would.
            if let Some(mock) = &state.mock {
                let ceiling = period_amount.saturating_mul(u64::from(periods));
                mock.credit(&source_account, ceiling).await;
                mock.approve_delegate(&source_account, &delegate_public.0, ceiling)
                    .await;
            }
            let body = serde_json::json!({
                "subscription_id": id,
                "delegate_public": delegate_public.0,
            });
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(e) => issue_error_response(e),
    }
}

/// POST /subscriptions/{id}/activate
///
/// Idempotent `pending → active` transition, invoked once the owner's
/// approval transaction is independently confirmed.
pub(crate) async fn handle_activate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.issuer.activate(&id, OffsetDateTime::now_utc()).await {
        Ok(sub) => {
            let body = serde_json::json!({
                "subscription_id": sub.id,
                "status": sub.status,
                "next_charge_at": sub.next_charge_at,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => issue_error_response(e),
    }
}

/// POST /subscriptions/{id}/revoke
pub(crate) async fn handle_revoke(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.issuer.revoke(&id).await {
        Ok(sub) => {
            let body = serde_json::json!({
                "subscription_id": sub.id,
                "status": sub.status,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => issue_error_response(e),
    }
}

/// POST /subscriptions/{id}/charge
pub(crate) async fn handle_charge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.executor.charge(&id, OffsetDateTime::now_utc()).await {
        Ok(receipt) => {
            let body = serde_json::json!({
                "ok": true,
                "subscription_id": receipt.id,
                "tx_ref": receipt.tx_ref.map(|t| t.0),
                "amount_charged": receipt.amount_charged,
                "amount_charged_decimal":
                    from_base_units(receipt.amount_charged, state.asset_decimals).to_string(),
                "periods_remaining": receipt.periods_remaining,
                "next_charge_at": receipt.next_charge_at,
                "status": receipt.status,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => charge_error_response(e),
    }
}

/// GET /subscriptions/{id}
pub(crate) async fn handle_get_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get(&id).await {
        Ok(sub) => (StatusCode::OK, Json(subscription_view(&sub))).into_response(),
        Err(StoreError::NotFound { .. }) => {
            json_error(StatusCode::NOT_FOUND, &format!("subscription '{}' not found", id))
                .into_response()
        }
        Err(StoreError::Unavailable(msg)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, &msg).into_response()
        }
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

/// Response shape for a subscription. Built field by field: the record
/// must never be serialized whole, because it carries the private
/// delegate seed.
fn subscription_view(sub: &Subscription) -> serde_json::Value {
    serde_json::json!({
        "id": sub.id,
        "owner_account": sub.owner_account,
        "owner_source_account": sub.owner_source_account,
        "delegate_public": sub.delegate_public,
        "status": sub.status,
        "periods_remaining": sub.periods_remaining,
        "period_amount": sub.period_amount,
        "approved_ceiling": sub.approved_ceiling,
        "period_secs": sub.period_secs,
        "created_at": sub.created_at,
        "next_charge_at": sub.next_charge_at,
        "charge_history": sub.charge_history,
    })
}

fn issue_error_response(e: IssueError) -> Response {
    match e {
        IssueError::NotFound { .. } => {
            json_error(StatusCode::NOT_FOUND, &e.to_string()).into_response()
        }
        IssueError::InvalidRequest { .. } | IssueError::CeilingOverflow { .. } => {
            json_error(StatusCode::BAD_REQUEST, &e.to_string()).into_response()
        }
        IssueError::InvalidStatus { .. } => {
            json_error(StatusCode::CONFLICT, &e.to_string()).into_response()
        }
        IssueError::Store(StoreError::Unavailable(_)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).into_response()
        }
        IssueError::Store(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response()
        }
    }
}

fn charge_error_response(e: ChargeError) -> Response {
    match e {
        ChargeError::NotFound { .. } => {
            json_error(StatusCode::NOT_FOUND, &e.to_string()).into_response()
        }
        // Not an alarm condition: the caller asked before the schedule
        // allowed it.
        ChargeError::NotDue { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string()).into_response()
        }
        ChargeError::AlreadyInProgress { .. } => {
            json_error(StatusCode::CONFLICT, &e.to_string()).into_response()
        }
        ChargeError::Failed { .. } => {
            json_error(StatusCode::BAD_GATEWAY, &e.to_string()).into_response()
        }
        ChargeError::Store(StoreError::Unavailable(_)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).into_response()
        }
        ChargeError::Store(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response()
        }
    }
}
