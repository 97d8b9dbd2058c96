//! Turns the handful of errors the HTTP layer itself can produce (bad JSON
//! body, no route) into a response, in the teacher's
//! `FrontendErrorResponse`/`IntoResponse` style. Pipeline-level failures
//! never reach here: [`crate::pipeline::Pipeline::resolve`] always resolves
//! to a well-formed [`crate::jsonrpc::JsonRpcResponse`] instead.

use crate::jsonrpc::JsonRpcResponse;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use derive_more::From;
use serde_json::Value;
use tracing::{instrument, trace};

#[derive(Debug, From)]
pub enum FrontendErrorResponse {
    InvalidJsonBody(JsonRejection),
    NotFound,
}

impl IntoResponse for FrontendErrorResponse {
    #[instrument(level = "trace")]
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::InvalidJsonBody(err) => {
                trace!(?err, "invalid json-rpc body");
                (
                    StatusCode::OK,
                    JsonRpcResponse::invalid_request(Value::Null),
                )
            }
            Self::NotFound => (StatusCode::NOT_FOUND, JsonRpcResponse::invalid_request(Value::Null)),
        };

        (status, Json(body)).into_response()
    }
}

#[instrument(level = "trace")]
pub async fn handler_404() -> Response {
    FrontendErrorResponse::NotFound.into_response()
}
