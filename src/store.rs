//! Relational persistence for blocks and transactions.
//!
//! Backed by [`sqlx::Any`], so the production MySQL store and the SQLite
//! stores used in tests share one implementation. The ingestion loop is the
//! only writer; the query surface reads concurrently through the same pool.

use crate::error::{Error, Result};
use crate::types::{BlockHeader, Transaction, TransactionLog};
use alloy_primitives::{Address, B256, U256};
use sqlx::{AnyPool, Row};
use std::str::FromStr;

/// Bind-parameter ceiling of the wire protocol; statements are chunked to
/// stay below it.
const MAX_BIND_PARAMS: usize = 65_535;
/// Columns per row in the transactions insert.
const TX_COLUMNS: usize = 8;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    number      BIGINT PRIMARY KEY,
    hash        CHAR(66) NOT NULL,
    parent_hash CHAR(66) NOT NULL,
    timestamp   BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    hash         CHAR(66) PRIMARY KEY,
    block_number BIGINT NOT NULL REFERENCES blocks(number),
    from_address CHAR(42) NOT NULL,
    to_address   CHAR(42),
    nonce        VARCHAR(80) NOT NULL,
    input        MEDIUMTEXT NOT NULL,
    value        VARCHAR(80) NOT NULL,
    logs         MEDIUMTEXT NOT NULL
);
"#;

/// Handle to the block store. Cheap to clone; all clones share one pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: AnyPool,
}

impl Store {
    /// Connects to `url` and creates the schema if missing.
    ///
    /// In-memory SQLite databases exist per connection, so those pools are
    /// pinned to a single connection.
    pub async fn connect(url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let max_connections = if url.starts_with("sqlite") { 1 } else { 10 };
        let pool: AnyPool = sqlx::pool::PoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Highest stored block number, if any block is stored.
    pub async fn newest_block_number(&self) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT MAX(number) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        let number: Option<i64> = row.try_get(0)?;
        Ok(number.map(|n| n as u64))
    }

    /// Lowest stored block number, if any block is stored.
    pub async fn oldest_block_number(&self) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT MIN(number) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        let number: Option<i64> = row.try_get(0)?;
        Ok(number.map(|n| n as u64))
    }

    /// Commits one fetched batch atomically.
    ///
    /// Either every header and transaction in the batch becomes visible, or
    /// none of it does. A unique-key collision (a re-fetched block) fails
    /// the whole batch with [`Error::Conflict`].
    pub async fn save_batch(
        &self,
        headers: &[BlockHeader],
        transactions: &[Transaction],
    ) -> Result<()> {
        if headers.is_empty() && transactions.is_empty() {
            return Ok(());
        }

        let mut db_tx = self.pool.begin().await?;

        if !headers.is_empty() {
            let mut sql =
                String::from("INSERT INTO blocks (number, hash, parent_hash, timestamp) VALUES ");
            push_placeholder_rows(&mut sql, headers.len(), 4);

            let mut query = sqlx::query(&sql);
            for header in headers {
                query = query
                    .bind(block_number_i64(header.number)?)
                    .bind(format!("{:#x}", header.hash))
                    .bind(format!("{:#x}", header.parent_hash))
                    .bind(header.time as i64);
            }
            query.execute(&mut *db_tx).await?;
        }

        let rows_per_statement = MAX_BIND_PARAMS / TX_COLUMNS;
        for chunk in transactions.chunks(rows_per_statement) {
            let mut sql = String::from(
                "INSERT INTO transactions \
                 (hash, block_number, from_address, to_address, nonce, input, value, logs) VALUES ",
            );
            push_placeholder_rows(&mut sql, chunk.len(), TX_COLUMNS);

            let mut query = sqlx::query(&sql);
            for tx in chunk {
                let block_number = tx.block_number.ok_or_else(|| {
                    Error::Protocol(format!("transaction {:#x} has no block number", tx.hash))
                })?;
                let logs = serde_json::to_string(&tx.logs)?;
                query = query
                    .bind(format!("{:#x}", tx.hash))
                    .bind(block_number_i64(block_number)?)
                    .bind(format!("{:#x}", tx.from_address))
                    .bind(tx.to_address.map(|to| format!("{to:#x}")))
                    .bind(tx.nonce.to_string())
                    .bind(tx.input.clone())
                    .bind(tx.value.to_string())
                    .bind(logs);
            }
            query.execute(&mut *db_tx).await?;
        }

        db_tx.commit().await?;
        Ok(())
    }

    /// The `limit` most recent headers, newest first. Transaction hashes
    /// are not populated.
    pub async fn recent_headers(&self, limit: u32) -> Result<Vec<BlockHeader>> {
        let rows = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp FROM blocks \
             ORDER BY number DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| header_from_row(&row)).collect()
    }

    /// Header plus stored transaction hashes for one block.
    pub async fn header_by_number(&self, number: u64) -> Result<Option<BlockHeader>> {
        let row = sqlx::query("SELECT number, hash, parent_hash, timestamp FROM blocks WHERE number = ?")
            .bind(number as i64)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut header = header_from_row(&row)?;

        let rows = sqlx::query("SELECT hash FROM transactions WHERE block_number = ?")
            .bind(number as i64)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let hash: String = row.try_get(0)?;
            header.transaction_hashes.push(parse_b256(&hash)?);
        }

        Ok(Some(header))
    }

    /// Full stored transaction, including its logs.
    pub async fn transaction_by_hash(&self, hash: B256) -> Result<Option<Transaction>> {
        let row = sqlx::query(
            "SELECT hash, block_number, from_address, to_address, nonce, input, value, logs \
             FROM transactions WHERE hash = ?",
        )
        .bind(format!("{hash:#x}"))
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let hash: String = row.try_get(0)?;
        let block_number: i64 = row.try_get(1)?;
        let from_address: String = row.try_get(2)?;
        let to_address: Option<String> = row.try_get(3)?;
        let nonce: String = row.try_get(4)?;
        let input: String = row.try_get(5)?;
        let value: String = row.try_get(6)?;
        let logs: String = row.try_get(7)?;

        let logs: Vec<TransactionLog> = serde_json::from_str(&logs)
            .map_err(|err| Error::Store(format!("corrupt logs column: {err}")))?;

        Ok(Some(Transaction {
            block_number: Some(U256::from(block_number as u64)),
            hash: parse_b256(&hash)?,
            from_address: parse_address(&from_address)?,
            to_address: to_address.as_deref().map(parse_address).transpose()?,
            nonce: parse_decimal(&nonce)?,
            value: parse_decimal(&value)?,
            input,
            logs,
        }))
    }
}

fn push_placeholder_rows(sql: &mut String, rows: usize, columns: usize) {
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for column in 0..columns {
            if column > 0 {
                sql.push_str(", ");
            }
            sql.push('?');
        }
        sql.push(')');
    }
}

fn block_number_i64(number: U256) -> Result<i64> {
    u64::try_from(number)
        .ok()
        .and_then(|n| i64::try_from(n).ok())
        .ok_or_else(|| Error::Protocol(format!("block number {number} exceeds storage range")))
}

fn header_from_row(row: &sqlx::any::AnyRow) -> Result<BlockHeader> {
    let number: i64 = row.try_get(0)?;
    let hash: String = row.try_get(1)?;
    let parent_hash: String = row.try_get(2)?;
    let time: i64 = row.try_get(3)?;
    Ok(BlockHeader {
        number: U256::from(number as u64),
        hash: parse_b256(&hash)?,
        parent_hash: parse_b256(&parent_hash)?,
        time: time as u64,
        transaction_hashes: Vec::new(),
    })
}

fn parse_b256(text: &str) -> Result<B256> {
    B256::from_str(text).map_err(|err| Error::Store(format!("corrupt hash column `{text}`: {err}")))
}

fn parse_address(text: &str) -> Result<Address> {
    Address::from_str(text)
        .map_err(|err| Error::Store(format!("corrupt address column `{text}`: {err}")))
}

fn parse_decimal(text: &str) -> Result<U256> {
    U256::from_str_radix(text, 10)
        .map_err(|err| Error::Store(format!("corrupt numeric column `{text}`: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.expect("connect")
    }

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            number: U256::from(number),
            hash: B256::from(U256::from(number)),
            parent_hash: B256::from(U256::from(number.saturating_sub(1))),
            time: 1_600_000_000 + number,
            transaction_hashes: Vec::new(),
        }
    }

    fn transaction(block: u64, salt: u64) -> Transaction {
        Transaction {
            block_number: Some(U256::from(block)),
            hash: B256::from(U256::from(block * 1_000 + salt)),
            from_address: Address::with_last_byte(0xaa),
            to_address: (salt % 2 == 0).then(|| Address::with_last_byte(0xbb)),
            nonce: U256::from(salt),
            value: U256::from(10u64).pow(U256::from(18u64)) * U256::from(salt),
            input: "0x".to_string(),
            logs: vec![TransactionLog {
                index: U256::from(0u64),
                data: "0xfeed".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn empty_store_has_no_bounds() {
        let store = memory_store().await;
        assert_eq!(store.newest_block_number().await.expect("newest"), None);
        assert_eq!(store.oldest_block_number().await.expect("oldest"), None);
    }

    #[tokio::test]
    async fn batch_round_trips_bounds_and_entities() {
        let store = memory_store().await;

        let mut h0 = header(100);
        let tx = transaction(100, 1);
        h0.transaction_hashes.push(tx.hash);
        let h1 = header(101);

        store
            .save_batch(&[h0.clone(), h1.clone()], &[tx.clone()])
            .await
            .expect("commit");

        assert_eq!(store.newest_block_number().await.expect("newest"), Some(101));
        assert_eq!(store.oldest_block_number().await.expect("oldest"), Some(100));

        let stored = store
            .header_by_number(100)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(stored.hash, h0.hash);
        assert_eq!(stored.time, h0.time);
        assert_eq!(stored.transaction_hashes, vec![tx.hash]);

        let stored_tx = store
            .transaction_by_hash(tx.hash)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(stored_tx.from_address, tx.from_address);
        assert_eq!(stored_tx.to_address, tx.to_address);
        assert_eq!(stored_tx.nonce, tx.nonce);
        assert_eq!(stored_tx.value, tx.value);
        assert_eq!(stored_tx.logs, tx.logs);
    }

    #[tokio::test]
    async fn zero_transaction_block_is_still_visible() {
        let store = memory_store().await;
        store.save_batch(&[header(7)], &[]).await.expect("commit");

        let stored = store
            .header_by_number(7)
            .await
            .expect("query")
            .expect("present");
        assert!(stored.transaction_hashes.is_empty());
    }

    #[tokio::test]
    async fn missing_entities_return_none() {
        let store = memory_store().await;
        assert!(store.header_by_number(9).await.expect("query").is_none());
        assert!(store
            .transaction_by_hash(B256::with_last_byte(9))
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn recent_headers_are_newest_first() {
        let store = memory_store().await;
        store
            .save_batch(&[header(1), header(2), header(3)], &[])
            .await
            .expect("commit");

        let recent = store.recent_headers(2).await.expect("query");
        let numbers: Vec<u64> = recent
            .iter()
            .map(|h| u64::try_from(h.number).expect("fits"))
            .collect();
        assert_eq!(numbers, vec![3, 2]);
    }

    #[tokio::test]
    async fn duplicate_block_fails_whole_batch() {
        let store = memory_store().await;
        store.save_batch(&[header(999)], &[]).await.expect("first commit");

        let err = store
            .save_batch(&[header(998), header(999), header(1000)], &[])
            .await
            .err()
            .expect("conflict");
        assert!(matches!(err, Error::Conflict(_)));

        // Atomicity: the non-conflicting rows of the batch are not visible.
        assert!(store.header_by_number(998).await.expect("query").is_none());
        assert!(store.header_by_number(1000).await.expect("query").is_none());
        assert_eq!(store.newest_block_number().await.expect("newest"), Some(999));
    }

    #[tokio::test]
    async fn duplicate_transaction_rolls_back_headers_too() {
        let store = memory_store().await;
        let tx = transaction(50, 1);
        store
            .save_batch(&[header(50)], &[tx.clone()])
            .await
            .expect("first commit");

        let mut dup = transaction(51, 2);
        dup.hash = tx.hash;
        let err = store
            .save_batch(&[header(51)], &[dup])
            .await
            .err()
            .expect("conflict");
        assert!(matches!(err, Error::Conflict(_)));
        assert!(store.header_by_number(51).await.expect("query").is_none());
    }

    #[tokio::test]
    async fn large_values_survive_storage() {
        let store = memory_store().await;
        let mut tx = transaction(60, 1);
        tx.value = U256::MAX;
        let mut h = header(60);
        h.transaction_hashes.push(tx.hash);

        store.save_batch(&[h], &[tx.clone()]).await.expect("commit");
        let stored = store
            .transaction_by_hash(tx.hash)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(stored.value, U256::MAX);
    }
}
