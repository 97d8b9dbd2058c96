//! Axum handlers for the proxy's HTTP surface, following the teacher's
//! `frontend/http_proxy.rs` shape: a plain async fn per route, state reached
//! through an `Extension`, response built as `(StatusCode, Json(...))`.

use crate::frontend::errors::FrontendErrorResponse;
use crate::jsonrpc::{JsonRpcRequestEnum, JsonRpcResponseEnum};
use crate::pipeline::Pipeline;
use axum::extract::rejection::JsonRejection;
use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

#[instrument(skip(pipeline, payload))]
pub async fn proxy_rpc(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    payload: Result<Json<JsonRpcRequestEnum>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(json) => json,
        Err(rejection) => return FrontendErrorResponse::InvalidJsonBody(rejection).into_response(),
    };

    let body = match payload {
        JsonRpcRequestEnum::Single(request) => {
            JsonRpcResponseEnum::Single(pipeline.resolve(request).await)
        }
        JsonRpcRequestEnum::Batch(requests) => {
            let responses = join_all(requests.into_iter().map(|request| pipeline.resolve(request))).await;
            JsonRpcResponseEnum::Batch(responses)
        }
    };

    (StatusCode::OK, Json(body)).into_response()
}

pub async fn health(Extension(pipeline): Extension<Arc<Pipeline>>) -> Response {
    let snapshot = pipeline.health_snapshot().await;
    (StatusCode::OK, Json(snapshot)).into_response()
}

pub async fn cache_stats(Extension(pipeline): Extension<Arc<Pipeline>>) -> Response {
    let snapshot = pipeline.cache_stats().await;
    (StatusCode::OK, Json(snapshot)).into_response()
}

#[derive(Debug, Serialize)]
struct FlushResponse {
    success: bool,
    message: String,
}

pub async fn cache_flush(Extension(pipeline): Extension<Arc<Pipeline>>) -> Response {
    match pipeline.flush().await {
        Ok(()) => (
            StatusCode::OK,
            Json(FlushResponse {
                success: true,
                message: "cache flushed".to_string(),
            }),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(%err, "cache flush failed");
            (
                StatusCode::OK,
                Json(FlushResponse {
                    success: false,
                    message: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}
