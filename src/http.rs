//! HTTP facade: JSON requests in, certificate identifiers out.
//!
//! Accepts `POST` with `{ "name", "amount", "class" }` on any path, checks
//! out a pooled engine connection, and maps the engine's reply onto HTTP
//! statuses: 403 for insufficient shares, 400 for validation failures, 503
//! when no engine connection can be produced, 500 for an engine fault.
//! Validation the gateway can do alone (JSON shape, amount bounds, holder
//! content) never consumes an engine round-trip.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{holder_is_valid, GrantRequest, MAX_CLASS_TAG_LEN};
use crate::pool::Pool;
use crate::wire::{Denial, GrantReply};

/// Shared gateway state: the engine pool and the issuing company name.
pub struct Gateway {
    pub pool: Pool,
    pub company: String,
}

/// Any-path POST router over the shared gateway state.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new().fallback(post(issue)).with_state(gateway)
}

#[derive(Debug, Deserialize)]
struct IssueRequest {
    name: String,
    amount: i64,
    class: String,
}

#[derive(Debug, Serialize)]
struct IssueResponse {
    id: String,
    company: String,
    name: String,
    amount: u32,
    class: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

async fn issue(
    State(gateway): State<Arc<Gateway>>,
    payload: Result<Json<IssueRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            debug!(%rejection, "rejecting unparseable request body");
            return error_response(StatusCode::BAD_REQUEST, "MALFORMED");
        }
    };

    let Ok(amount) = u32::try_from(body.amount) else {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_AMOUNT");
    };
    if amount == 0 {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_AMOUNT");
    }
    if !holder_is_valid(&body.name) {
        return error_response(StatusCode::BAD_REQUEST, "MALFORMED");
    }
    if body.class.len() > MAX_CLASS_TAG_LEN {
        // Cannot be a configured class, and would not fit the wire either.
        return error_response(StatusCode::BAD_REQUEST, "UNKNOWN_CLASS");
    }

    let mut conn = match gateway.pool.checkout().await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(%err, "no engine connection available");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "BACKEND_UNAVAILABLE");
        }
    };

    let request = GrantRequest {
        class: body.class.clone(),
        holder: body.name.clone(),
        amount,
    };
    match conn.grant(&request).await {
        Ok(GrantReply::Granted(number)) => {
            let response = IssueResponse {
                id: format!("{}-{}", body.class, number),
                company: gateway.company.clone(),
                name: body.name,
                amount,
                class: body.class,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(GrantReply::Denied(denial)) => error_response(status_for(denial), denial.as_str()),
        Err(err) => {
            warn!(%err, "engine round-trip failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "BACKEND_UNAVAILABLE")
        }
    }
}

fn status_for(denial: Denial) -> StatusCode {
    match denial {
        Denial::InsufficientShares => StatusCode::FORBIDDEN,
        Denial::EngineFault => StatusCode::INTERNAL_SERVER_ERROR,
        Denial::UnknownClass | Denial::InvalidAmount | Denial::Malformed => {
            StatusCode::BAD_REQUEST
        }
    }
}

fn error_response(status: StatusCode, reason: &'static str) -> Response {
    (status, Json(ErrorBody { error: reason })).into_response()
}
