//! Wire and domain types for indexed chain data.
//!
//! Numeric fields on the wire arrive as hex quantities (`"0x4d2"`), decimal
//! strings, or plain JSON numbers depending on the node; the [`quantity`]
//! codec normalizes all three into [`U256`]/`u64` and treats anything else
//! as a protocol violation.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// Canonical block header as fetched from `eth_getBlockByNumber` with
/// `include_txs = false`: the `transactions` field carries hashes only.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockHeader {
    #[serde(deserialize_with = "quantity::deserialize")]
    pub number: U256,
    pub hash: B256,
    #[serde(rename = "parentHash")]
    pub parent_hash: B256,
    /// Unix seconds.
    #[serde(rename = "timestamp", deserialize_with = "quantity::deserialize_u64")]
    pub time: u64,
    /// Transaction hashes in the chain's declared order.
    #[serde(rename = "transactions", default)]
    pub transaction_hashes: Vec<B256>,
}

/// A transaction together with the logs populated from its receipt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Transaction {
    /// Absent for pending transactions; always present once mined.
    #[serde(
        rename = "blockNumber",
        default,
        deserialize_with = "quantity::deserialize_opt"
    )]
    pub block_number: Option<U256>,
    pub hash: B256,
    #[serde(rename = "from")]
    pub from_address: Address,
    /// `None` for contract creation.
    #[serde(rename = "to", default)]
    pub to_address: Option<Address>,
    #[serde(deserialize_with = "quantity::deserialize")]
    pub nonce: U256,
    #[serde(deserialize_with = "quantity::deserialize")]
    pub value: U256,
    /// Hex-encoded calldata.
    #[serde(default)]
    pub input: String,
    /// Populated by the receipt stage; empty until then.
    #[serde(default)]
    pub logs: Vec<TransactionLog>,
}

/// Single log entry attached to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLog {
    #[serde(
        rename = "logIndex",
        serialize_with = "quantity::serialize",
        deserialize_with = "quantity::deserialize"
    )]
    pub index: U256,
    /// Hex-encoded log payload.
    #[serde(default)]
    pub data: String,
}

/// Receipt subset needed to attach logs back to their transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransactionReceipt {
    #[serde(rename = "transactionHash")]
    pub transaction_hash: B256,
    #[serde(default)]
    pub logs: Vec<TransactionLog>,
}

/// Serde codec for Ethereum quantity fields.
pub mod quantity {
    use alloy_primitives::U256;
    use serde::de::{self, Deserializer, Visitor};
    use serde::ser::Serializer;
    use std::fmt;

    /// Parse a quantity from its string form: `0x`-prefixed hex or decimal.
    pub fn parse(text: &str) -> Option<U256> {
        let text = text.trim();
        if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            U256::from_str_radix(hex, 16).ok()
        } else {
            U256::from_str_radix(text, 10).ok()
        }
    }

    struct QuantityVisitor;

    impl<'de> Visitor<'de> for QuantityVisitor {
        type Value = U256;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a hex or decimal quantity")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<U256, E> {
            parse(value).ok_or_else(|| E::custom(format!("invalid quantity `{value}`")))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<U256, E> {
            Ok(U256::from(value))
        }
    }

    struct OptQuantityVisitor;

    impl<'de> Visitor<'de> for OptQuantityVisitor {
        type Value = Option<U256>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a hex or decimal quantity, or null")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            d.deserialize_any(QuantityVisitor).map(Some)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        d.deserialize_any(QuantityVisitor)
    }

    pub fn deserialize_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<U256>, D::Error> {
        d.deserialize_option(OptQuantityVisitor)
    }

    pub fn deserialize_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let value = d.deserialize_any(QuantityVisitor)?;
        u64::try_from(value).map_err(|_| de::Error::custom("quantity exceeds u64"))
    }

    pub fn serialize<S: Serializer>(value: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{value:x}"))
    }
}
