//! JSON-RPC access to the upstream node.

use crate::error::{Error, Result};
use crate::types::{BlockHeader, Transaction, TransactionReceipt};
use alloy_primitives::B256;
use async_trait::async_trait;
use jsonrpsee::core::client::{ClientT, Error as ClientError};
use jsonrpsee::core::params::BatchRequestBuilder;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use std::time::Duration;

/// Source of chain data for the fetch pipeline.
///
/// Each batched operation corresponds to exactly one outbound HTTP request,
/// so callers pay one rate-governor token per call.
#[async_trait]
pub trait EthRpc: Send + Sync {
    /// Header of the block the node currently considers canonical head.
    async fn latest_header(&self) -> Result<BlockHeader>;

    /// Headers for the given block numbers, in request order.
    async fn headers_by_number(&self, numbers: &[u64]) -> Result<Vec<BlockHeader>>;

    /// Transactions for the given hashes. Order across the batch follows
    /// the request; a null element is an upstream failure.
    async fn transactions_by_hash(&self, hashes: &[B256]) -> Result<Vec<Transaction>>;

    /// Receipts for the given transaction hashes. Null elements are
    /// silently dropped, so the result may be shorter than the request.
    async fn transaction_receipts(&self, hashes: &[B256]) -> Result<Vec<TransactionReceipt>>;
}

/// [`EthRpc`] over a batching JSON-RPC HTTP client.
#[derive(Debug)]
pub struct HttpRpc {
    client: HttpClient,
}

impl HttpRpc {
    /// Connects to the node at `url` with a per-request timeout.
    pub fn connect(url: &str, request_timeout: Duration) -> Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(request_timeout)
            .build(url)
            .map_err(|err| Error::Config(format!("invalid rpc endpoint `{url}`: {err}")))?;
        Ok(Self { client })
    }
}

fn classify(err: ClientError) -> Error {
    match err {
        ClientError::ParseError(err) => Error::Protocol(err.to_string()),
        other => Error::Upstream(other.to_string()),
    }
}

#[async_trait]
impl EthRpc for HttpRpc {
    async fn latest_header(&self) -> Result<BlockHeader> {
        let header: Option<BlockHeader> = self
            .client
            .request("eth_getBlockByNumber", rpc_params!["latest", false])
            .await
            .map_err(classify)?;
        header.ok_or_else(|| Error::Upstream("node returned no latest header".to_string()))
    }

    async fn headers_by_number(&self, numbers: &[u64]) -> Result<Vec<BlockHeader>> {
        if numbers.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = BatchRequestBuilder::new();
        for number in numbers {
            batch
                .insert(
                    "eth_getBlockByNumber",
                    rpc_params![format!("0x{number:x}"), false],
                )
                .map_err(|err| Error::Protocol(err.to_string()))?;
        }

        let responses = self
            .client
            .batch_request::<Option<BlockHeader>>(batch)
            .await
            .map_err(classify)?;

        let mut headers = Vec::with_capacity(numbers.len());
        for (number, entry) in numbers.iter().zip(responses) {
            match entry {
                Ok(Some(header)) => headers.push(header),
                Ok(None) => {
                    return Err(Error::Upstream(format!(
                        "received null header for block 0x{number:x}"
                    )))
                }
                Err(err) => {
                    return Err(Error::Upstream(format!(
                        "block 0x{number:x}: {}",
                        err.message()
                    )))
                }
            }
        }
        Ok(headers)
    }

    async fn transactions_by_hash(&self, hashes: &[B256]) -> Result<Vec<Transaction>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = BatchRequestBuilder::new();
        for hash in hashes {
            batch
                .insert("eth_getTransactionByHash", rpc_params![format!("{hash:#x}")])
                .map_err(|err| Error::Protocol(err.to_string()))?;
        }

        let responses = self
            .client
            .batch_request::<Option<Transaction>>(batch)
            .await
            .map_err(classify)?;

        let mut transactions = Vec::with_capacity(hashes.len());
        for (hash, entry) in hashes.iter().zip(responses) {
            match entry {
                Ok(Some(tx)) => transactions.push(tx),
                Ok(None) => {
                    return Err(Error::Upstream(format!(
                        "received null transaction for {hash:#x}"
                    )))
                }
                Err(err) => {
                    return Err(Error::Upstream(format!(
                        "transaction {hash:#x}: {}",
                        err.message()
                    )))
                }
            }
        }
        Ok(transactions)
    }

    async fn transaction_receipts(&self, hashes: &[B256]) -> Result<Vec<TransactionReceipt>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = BatchRequestBuilder::new();
        for hash in hashes {
            batch
                .insert(
                    "eth_getTransactionReceipt",
                    rpc_params![format!("{hash:#x}")],
                )
                .map_err(|err| Error::Protocol(err.to_string()))?;
        }

        let responses = self
            .client
            .batch_request::<Option<TransactionReceipt>>(batch)
            .await
            .map_err(classify)?;

        let mut receipts = Vec::with_capacity(hashes.len());
        for (hash, entry) in hashes.iter().zip(responses) {
            match entry {
                // A node that has not yet indexed the receipt returns null;
                // the pipeline tolerates the gap.
                Ok(Some(receipt)) => receipts.push(receipt),
                Ok(None) => {}
                Err(err) => {
                    return Err(Error::Upstream(format!(
                        "receipt {hash:#x}: {}",
                        err.message()
                    )))
                }
            }
        }
        Ok(receipts)
    }
}
