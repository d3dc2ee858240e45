//! Read-only HTTP query surface over the store.
//!
//! Serves `/blocks`, `/blocks/:number`, and `/transactions/:hash` over
//! plain http1 connections.

use crate::error::Result;
use crate::store::Store;
use crate::types::{BlockHeader, Transaction, TransactionLog};
use alloy_primitives::B256;
use http::{header::CONTENT_TYPE, Method, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::str::FromStr;
use tokio::net::TcpListener;
use tracing::{debug, error};

#[derive(Serialize)]
struct BlockSummary {
    block_num: u64,
    block_hash: String,
    parent_hash: String,
    block_time: u64,
}

impl BlockSummary {
    fn from_header(header: &BlockHeader) -> Self {
        Self {
            block_num: header.number.saturating_to(),
            block_hash: format!("{:#x}", header.hash),
            parent_hash: format!("{:#x}", header.parent_hash),
            block_time: header.time,
        }
    }
}

#[derive(Serialize)]
struct BlocksResponse {
    blocks: Vec<BlockSummary>,
}

#[derive(Serialize)]
struct BlockResponse {
    #[serde(flatten)]
    summary: BlockSummary,
    transactions: Vec<String>,
}

#[derive(Serialize)]
struct TransactionResponse {
    tx_hash: String,
    from: String,
    to: Option<String>,
    nonce: String,
    value: String,
    data: String,
    logs: Vec<TransactionLog>,
}

impl TransactionResponse {
    fn from_transaction(tx: &Transaction) -> Self {
        Self {
            tx_hash: format!("{:#x}", tx.hash),
            from: format!("{:#x}", tx.from_address),
            to: tx.to_address.map(|to| format!("{to:#x}")),
            nonce: tx.nonce.to_string(),
            value: tx.value.to_string(),
            data: tx.input.clone(),
            logs: tx.logs.clone(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: &'static str,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let payload = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(payload)))
        .unwrap_or_default()
}

fn not_found() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &ErrorBody {
            code: "0001",
            message: "Entity not found",
        },
    )
}

fn invalid_request() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::BAD_REQUEST,
        &ErrorBody {
            code: "0003",
            message: "Invalid request",
        },
    )
}

fn internal_error() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &ErrorBody {
            code: "0002",
            message: "Internal error",
        },
    )
}

/// Accept loop for the query surface.
pub async fn serve(listener: TcpListener, store: Store) -> Result<()> {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, "failed to accept connection");
                continue;
            }
        };
        debug!(remote = %remote, "accepted connection");

        let store = store.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let store = store.clone();
                async move {
                    let (parts, _body) = req.into_parts();
                    Ok::<_, Infallible>(route(&parts.method, &parts.uri, &store).await)
                }
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(error = %err, "connection error");
            }
        });
    }
}

/// Dispatches one request. Split out from [`serve`] so tests can drive the
/// routing table directly.
pub(crate) async fn route(method: &Method, uri: &Uri, store: &Store) -> Response<Full<Bytes>> {
    if method != Method::GET {
        return not_found();
    }

    let path: Vec<&str> = uri.path().trim_matches('/').split('/').collect();
    match path.as_slice() {
        ["blocks"] => list_blocks(uri, store).await,
        ["blocks", id] => get_block(id, store).await,
        ["transactions", hash] => get_transaction(hash, store).await,
        _ => not_found(),
    }
}

fn query_param<'a>(uri: &'a Uri, name: &str) -> Option<&'a str> {
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix(name)?.strip_prefix('='))
}

async fn list_blocks(uri: &Uri, store: &Store) -> Response<Full<Bytes>> {
    let Some(limit) = query_param(uri, "limit").and_then(|raw| raw.parse::<u32>().ok()) else {
        return invalid_request();
    };

    match store.recent_headers(limit).await {
        Ok(headers) => json_response(
            StatusCode::OK,
            &BlocksResponse {
                blocks: headers.iter().map(BlockSummary::from_header).collect(),
            },
        ),
        Err(err) => {
            error!(error = %err, "failed to list blocks");
            internal_error()
        }
    }
}

async fn get_block(id: &str, store: &Store) -> Response<Full<Bytes>> {
    let Ok(number) = id.parse::<u64>() else {
        return invalid_request();
    };

    match store.header_by_number(number).await {
        Ok(Some(header)) => json_response(
            StatusCode::OK,
            &BlockResponse {
                summary: BlockSummary::from_header(&header),
                transactions: header
                    .transaction_hashes
                    .iter()
                    .map(|hash| format!("{hash:#x}"))
                    .collect(),
            },
        ),
        Ok(None) => not_found(),
        Err(err) => {
            error!(error = %err, number, "failed to load block");
            internal_error()
        }
    }
}

async fn get_transaction(hash: &str, store: &Store) -> Response<Full<Bytes>> {
    let Ok(hash) = B256::from_str(hash) else {
        return invalid_request();
    };

    match store.transaction_by_hash(hash).await {
        Ok(Some(tx)) => json_response(StatusCode::OK, &TransactionResponse::from_transaction(&tx)),
        Ok(None) => not_found(),
        Err(err) => {
            error!(error = %err, hash = %hash, "failed to load transaction");
            internal_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};
    use http_body_util::BodyExt;
    use serde_json::Value;

    async fn seeded_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.expect("store");

        let tx = Transaction {
            block_number: Some(U256::from(11u64)),
            hash: B256::with_last_byte(0x11),
            from_address: Address::with_last_byte(0xaa),
            to_address: None,
            nonce: U256::from(3u64),
            value: U256::from(1_500u64),
            input: "0xabcd".to_string(),
            logs: vec![TransactionLog {
                index: U256::from(0u64),
                data: "0x01".to_string(),
            }],
        };
        let headers = [
            BlockHeader {
                number: U256::from(10u64),
                hash: B256::with_last_byte(0x0a),
                parent_hash: B256::with_last_byte(0x09),
                time: 1_000,
                transaction_hashes: Vec::new(),
            },
            BlockHeader {
                number: U256::from(11u64),
                hash: B256::with_last_byte(0x0b),
                parent_hash: B256::with_last_byte(0x0a),
                time: 1_012,
                transaction_hashes: vec![tx.hash],
            },
        ];
        store.save_batch(&headers, &[tx]).await.expect("seed");
        store
    }

    async fn get(store: &Store, target: &str) -> (StatusCode, Value) {
        let uri: Uri = target.parse().expect("uri");
        let response = route(&Method::GET, &uri, store).await;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = serde_json::from_slice(&bytes).expect("json body");
        (status, value)
    }

    #[tokio::test]
    async fn blocks_listing_is_newest_first_and_limited() {
        let store = seeded_store().await;
        let (status, body) = get(&store, "/blocks?limit=1").await;

        assert_eq!(status, StatusCode::OK);
        let blocks = body["blocks"].as_array().expect("array");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["block_num"], 11);
        assert_eq!(blocks[0]["block_time"], 1_012);
    }

    #[tokio::test]
    async fn missing_or_malformed_limit_is_invalid() {
        let store = seeded_store().await;

        let (status, body) = get(&store, "/blocks").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "0003");

        let (status, _) = get(&store, "/blocks?limit=soon").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn block_lookup_includes_transaction_hashes() {
        let store = seeded_store().await;
        let (status, body) = get(&store, "/blocks/11").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["block_num"], 11);
        let hashes = body["transactions"].as_array().expect("array");
        assert_eq!(hashes.len(), 1);

        let (status, body) = get(&store, "/blocks/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "0001");
        assert_eq!(body["message"], "Entity not found");

        let (status, _) = get(&store, "/blocks/eleven").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn transaction_lookup_round_trips() {
        let store = seeded_store().await;
        let hash = format!("{:#x}", B256::with_last_byte(0x11));
        let (status, body) = get(&store, &format!("/transactions/{hash}")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tx_hash"], hash.as_str());
        assert_eq!(body["nonce"], "3");
        assert_eq!(body["value"], "1500");
        assert!(body["to"].is_null());
        assert_eq!(body["logs"].as_array().expect("array").len(), 1);

        let missing = format!("{:#x}", B256::with_last_byte(0x99));
        let (status, _) = get(&store, &format!("/transactions/{missing}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(&store, "/transactions/nothex").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let store = seeded_store().await;
        let (status, _) = get(&store, "/accounts/0x00").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let uri: Uri = "/blocks?limit=1".parse().expect("uri");
        let response = route(&Method::POST, &uri, &store).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
