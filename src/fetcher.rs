//! Three-stage fetch pipeline and the ingestion loop driving it.
//!
//! Each iteration plans a batch of block numbers, fetches headers, fans the
//! transaction and receipt lookups out over the rate governor, and commits
//! the assembled batch in one store transaction. Stages do not overlap: the
//! transaction stage waits for every header, the receipt stage for every
//! transaction, so batches move between stages by value.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::planner;
use crate::rate::RateLimiter;
use crate::rpc::EthRpc;
use crate::store::Store;
use crate::types::{BlockHeader, Transaction, TransactionReceipt};
use alloy_primitives::B256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// How long to wait before re-probing the tip once fully caught up.
const TIP_POLL_MS: u64 = 1000;

/// Outcome of a single plan→fetch→commit iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Nothing left to fetch at the observed tip.
    UpToDate { tip: u64 },
    /// One batch was committed.
    BatchCommitted { blocks: usize, transactions: usize },
}

/// Decides whether a failed iteration should be retried.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, error: &Error, attempt: u32) -> bool;
}

/// Default policy: every pipeline error terminates the loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFast;

impl RetryPolicy for FailFast {
    fn should_retry(&self, _error: &Error, _attempt: u32) -> bool {
        false
    }
}

/// Batched, rate-limited block fetcher.
pub struct BlockFetcher<C> {
    client: Arc<C>,
    store: Store,
    limiter: Arc<RateLimiter>,
    header_batch_size: usize,
    tx_batch_size: usize,
    log_batch_size: usize,
    shutdown: watch::Sender<bool>,
}

impl<C: EthRpc + 'static> BlockFetcher<C> {
    /// Builds the fetcher and its rate governor from the configuration.
    pub fn new(client: Arc<C>, store: Store, config: &Config) -> Result<Self> {
        config.validate()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let burst = config.header_batch_size.max(config.tx_batch_size);
        let limiter = RateLimiter::new(
            config.rate_limit_value,
            config.rate_limit_seconds,
            burst,
            shutdown_rx,
        )?;

        Ok(Self {
            client,
            store,
            limiter: Arc::new(limiter),
            header_batch_size: config.header_batch_size,
            tx_batch_size: config.tx_batch_size,
            log_batch_size: config.log_batch_size,
            shutdown,
        })
    }

    /// Runs the ingestion loop until a fatal error.
    pub async fn run(&self) -> Result<()> {
        self.run_with_policy(&FailFast).await
    }

    /// Runs the ingestion loop, consulting `policy` after each failure.
    pub async fn run_with_policy(&self, policy: &dyn RetryPolicy) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.run_once().await {
                Ok(FetchOutcome::BatchCommitted { .. }) => {
                    attempt = 0;
                }
                Ok(FetchOutcome::UpToDate { tip }) => {
                    attempt = 0;
                    debug!(tip, "caught up with chain tip");
                    sleep(Duration::from_millis(TIP_POLL_MS)).await;
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    if policy.should_retry(&err, attempt) {
                        warn!(error = %err, attempt, "iteration failed, retrying");
                        sleep(Duration::from_millis(TIP_POLL_MS)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One plan→fetch→commit iteration.
    pub async fn run_once(&self) -> Result<FetchOutcome> {
        // A previous failed iteration may have tripped the shutdown signal
        // to cancel its siblings; arm it again before doing new work.
        self.shutdown.send_replace(false);

        self.limiter.acquire().await?;
        let tip = self.client.latest_header().await?;
        let tip_number = u64::try_from(tip.number)
            .map_err(|_| Error::Protocol(format!("tip number {} exceeds u64", tip.number)))?;

        let newest = self.store.newest_block_number().await?;
        let oldest = self.store.oldest_block_number().await?;
        let plan = planner::plan(tip_number, newest, oldest, self.header_batch_size);
        debug!(
            tip = tip_number,
            newest = ?newest,
            oldest = ?oldest,
            planned = plan.len(),
            "planned next batch"
        );
        if plan.is_empty() {
            return Ok(FetchOutcome::UpToDate { tip: tip_number });
        }

        self.limiter.acquire().await?;
        let headers = self.client.headers_by_number(&plan).await?;

        let mut transactions = self.fetch_transactions(&headers).await?;
        self.populate_logs(&mut transactions).await?;

        self.store.save_batch(&headers, &transactions).await?;
        info!(
            blocks = headers.len(),
            transactions = transactions.len(),
            tip = tip_number,
            "batch committed"
        );
        Ok(FetchOutcome::BatchCommitted {
            blocks: headers.len(),
            transactions: transactions.len(),
        })
    }

    /// Stage T: fetch every transaction referenced by `headers`.
    ///
    /// Chunks are dispatched concurrently; ordering across chunks is
    /// unspecified, which the commit stage does not rely on.
    async fn fetch_transactions(&self, headers: &[BlockHeader]) -> Result<Vec<Transaction>> {
        let hashes: Vec<B256> = headers
            .iter()
            .flat_map(|header| header.transaction_hashes.iter().copied())
            .collect();
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let mut workers: JoinSet<Result<Vec<Transaction>>> = JoinSet::new();
        for chunk in hashes.chunks(self.tx_batch_size) {
            let chunk = chunk.to_vec();
            let client = Arc::clone(&self.client);
            let limiter = Arc::clone(&self.limiter);
            workers.spawn(async move {
                limiter.acquire().await?;
                client.transactions_by_hash(&chunk).await
            });
        }

        let mut transactions = Vec::with_capacity(hashes.len());
        self.collect(workers, |chunk| {
            transactions.extend(chunk);
            Ok(())
        })
        .await?;
        Ok(transactions)
    }

    /// Stage L: populate every transaction's logs from its receipt.
    ///
    /// A receipt for a hash outside the batch is a protocol violation; a
    /// transaction whose receipt never arrives keeps its empty logs.
    async fn populate_logs(&self, transactions: &mut [Transaction]) -> Result<()> {
        if transactions.is_empty() {
            return Ok(());
        }

        let index: HashMap<B256, usize> = transactions
            .iter()
            .enumerate()
            .map(|(position, tx)| (tx.hash, position))
            .collect();
        let hashes: Vec<B256> = transactions.iter().map(|tx| tx.hash).collect();

        let mut workers: JoinSet<Result<Vec<TransactionReceipt>>> = JoinSet::new();
        for chunk in hashes.chunks(self.log_batch_size) {
            let chunk = chunk.to_vec();
            let client = Arc::clone(&self.client);
            let limiter = Arc::clone(&self.limiter);
            workers.spawn(async move {
                limiter.acquire().await?;
                client.transaction_receipts(&chunk).await
            });
        }

        self.collect(workers, |receipts| {
            for receipt in receipts {
                let Some(&position) = index.get(&receipt.transaction_hash) else {
                    return Err(Error::Protocol(format!(
                        "receipt for unknown transaction {:#x}",
                        receipt.transaction_hash
                    )));
                };
                transactions[position].logs = receipt.logs;
            }
            Ok(())
        })
        .await
    }

    /// Fan-in barrier over a set of workers.
    ///
    /// The first error wins and trips the shutdown signal so that siblings
    /// blocked on the rate governor bail out; their cancellations are
    /// drained without masking the original error.
    async fn collect<T: 'static>(
        &self,
        mut workers: JoinSet<Result<T>>,
        mut on_item: impl FnMut(T) -> Result<()>,
    ) -> Result<()> {
        let mut first_error: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_err) => Err(Error::Upstream(format!("worker task failed: {join_err}"))),
            };
            let result = match result {
                Ok(item) if first_error.is_none() => on_item(item),
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                if first_error.is_none() {
                    self.shutdown.send_replace(true);
                    first_error = Some(err);
                } else if !matches!(err, Error::Cancelled) {
                    debug!(error = %err, "suppressed sibling error");
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
