//! HTTP query surface over an open dataset.
//!
//! Three GET routes: address history, contract history, and the raw
//! header stream. History bodies are JSON with hex-encoded byte fields;
//! an empty history is a 404 so thin clients can probe cheaply.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::server::{Item, Server};
use crate::types::HASH_SIZE;

#[derive(Debug, Deserialize)]
pub struct AddressQuery {
    pub address: String,
    #[serde(default)]
    pub start: String,
}

#[derive(Debug, Deserialize)]
pub struct ContractQuery {
    pub contract: String,
    #[serde(default)]
    pub start: String,
}

/// Wire form of one item; byte fields are hex.
#[derive(Debug, Serialize, Deserialize)]
pub struct ItemBody {
    pub data: String,
    pub compression: u8,
    pub block: usize,
    pub index: usize,
    pub num_leaves: usize,
    pub num_miner_payouts: usize,
    pub merkle_proof: String,
}

impl From<&Item<'_>> for ItemBody {
    fn from(item: &Item<'_>) -> Self {
        Self {
            data: hex::encode(item.data),
            compression: item.compression.tag(),
            block: item.block,
            index: item.index,
            num_leaves: item.num_leaves,
            num_miner_payouts: item.num_miner_payouts,
            merkle_proof: hex::encode(&item.merkle_proof),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryBody {
    pub next: String,
    pub history: Vec<ItemBody>,
}

pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/v1/address-history", get(address_history))
        .route("/v1/contract-history", get(contract_history))
        .route("/v1/headers", get(headers))
        .with_state(server)
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, msg).into_response()
}

fn error_response(err: Error) -> Response {
    match err {
        Error::InvalidInput(_) | Error::TooLargeIndex => bad_request(err.to_string()),
        other => {
            tracing::error!(error = %other, "query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

fn decode_key(hex_key: &str) -> Result<Vec<u8>, Response> {
    let bytes = hex::decode(hex_key).map_err(|e| bad_request(format!("bad hex key: {e}")))?;
    if bytes.len() != HASH_SIZE {
        return Err(bad_request(format!("key has {} bytes, want {HASH_SIZE}", bytes.len())));
    }
    Ok(bytes)
}

fn history_response(result: crate::error::Result<(Vec<Item<'_>>, String)>) -> Response {
    match result {
        Ok((history, _)) if history.is_empty() => {
            (StatusCode::NOT_FOUND, "not found\n").into_response()
        }
        Ok((history, next)) => {
            let body = HistoryBody { next, history: history.iter().map(ItemBody::from).collect() };
            Json(body).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn address_history(
    State(server): State<Arc<Server>>,
    Query(query): Query<AddressQuery>,
) -> Response {
    let address = match decode_key(&query.address) {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    history_response(server.address_history(&address, &query.start))
}

async fn contract_history(
    State(server): State<Arc<Server>>,
    Query(query): Query<ContractQuery>,
) -> Response {
    let contract = match decode_key(&query.contract) {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    history_response(server.contract_history(&contract, &query.start))
}

async fn headers(State(server): State<Arc<Server>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        server.headers().to_vec(),
    )
        .into_response()
}
