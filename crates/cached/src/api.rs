//! Client HTTP surface
//!
//! `GET /` lists every record as a JSON array, `POST /` creates one from a
//! JSON body. Creates answer `ok` or `exists` with 200; a body that is not a
//! record gets 400 and an encoding fault gets 500.

use crate::node::{ApiError, CacheNode, CreateOutcome};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use gossip_cache_core::codec;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

pub fn router(node: Arc<CacheNode>) -> Router {
    Router::new()
        .route("/", get(list_records).post(create_record))
        .route("/health", get(health))
        .with_state(node)
}

async fn list_records(State(node): State<Arc<CacheNode>>) -> Response {
    match codec::records_to_json(&node.list_records()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to serialize record list: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn create_record(State(node): State<Arc<CacheNode>>, body: Bytes) -> Response {
    match node.create_from_json(&body) {
        Ok(CreateOutcome::Created) => (StatusCode::OK, "ok").into_response(),
        Ok(CreateOutcome::AlreadyExists) => (StatusCode::OK, "exists").into_response(),
        Err(ApiError::Malformed(e)) => {
            debug!("Rejected create: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e @ ApiError::Serialization(_)) => {
            error!("Create failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health(State(node): State<Arc<CacheNode>>) -> Json<serde_json::Value> {
    let stats = node.stats();
    Json(json!({
        "node": node.name(),
        "incarnation": node.incarnation(),
        "members": stats.members,
        "records": stats.records,
        "pending_broadcasts": stats.pending_broadcasts,
        "fenced_sources": stats.fenced_sources,
        "digest": codec::short_digest(&stats.digest),
    }))
}
