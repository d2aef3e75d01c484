//! Explorer record types.
//!
//! `Raw*` structs mirror the JSON the explorer returns: every field is an
//! optional string because the API mixes empty strings, `null`s and missing
//! keys depending on the endpoint. They are decoded once at ingestion into
//! the typed records the ledger works with (`MoneyTransaction`,
//! `TransferEvent`), so nothing downstream branches on string formats.

use alloy::primitives::{hex, Address, Selector, TxHash, U256};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid address in `{field}`: {value:?}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("invalid transaction hash: {0:?}")]
    InvalidHash(String),
    #[error("invalid number in `{field}`: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("invalid unix timestamp: {0:?}")]
    InvalidTimestamp(String),
}

/// Token standards the explorer can list transfers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenStandard {
    Erc721,
    Erc1155,
}

impl TokenStandard {
    /// `action` parameter of the `account` module listing this standard.
    pub fn action(&self) -> &'static str {
        match self {
            TokenStandard::Erc721 => "tokennfttx",
            TokenStandard::Erc1155 => "token1155tx",
        }
    }
}

impl std::fmt::Display for TokenStandard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenStandard::Erc721 => write!(f, "ERC721"),
            TokenStandard::Erc1155 => write!(f, "ERC1155"),
        }
    }
}

/// A normal transaction as listed by `account/txlist` or returned by
/// `proxy/eth_getTransactionByHash`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTransaction {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, rename = "timeStamp")]
    pub time_stamp: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    /// Decimal string on `txlist`, `0x` hex on the proxy endpoint.
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, rename = "methodId")]
    pub method_id: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
}

/// A token transfer as listed by `account/tokennfttx` or `account/token1155tx`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTokenTransfer {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, rename = "timeStamp")]
    pub time_stamp: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default, rename = "contractAddress")]
    pub contract_address: Option<String>,
    #[serde(default, rename = "tokenID")]
    pub token_id: Option<String>,
    #[serde(default, rename = "tokenName")]
    pub token_name: Option<String>,
    /// ERC1155 only.
    #[serde(default, rename = "tokenValue")]
    pub token_value: Option<String>,
}

/// An entry of `account/balancemulti`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBalance {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub balance: Option<String>,
}

/// The money side of a token transfer. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoneyTransaction {
    pub hash: TxHash,
    /// Absent on records fetched by hash through the proxy endpoint.
    pub timestamp: Option<DateTime<Utc>>,
    pub from: Address,
    /// Absent for contract creations.
    pub to: Option<Address>,
    /// Native token units (wei).
    pub value: U256,
    pub method_selector: Option<Selector>,
}

impl TryFrom<&RawTransaction> for MoneyTransaction {
    type Error = DecodeError;

    fn try_from(raw: &RawTransaction) -> Result<Self, Self::Error> {
        let hash = parse_hash(required("hash", &raw.hash)?)?;
        let timestamp = match raw.time_stamp.as_deref() {
            Some(s) if !s.trim().is_empty() => Some(parse_timestamp(s)?),
            _ => None,
        };
        let from = parse_address("from", required("from", &raw.from)?)?
            .ok_or(DecodeError::MissingField("from"))?;
        let to = match raw.to.as_deref() {
            Some(s) => parse_address("to", s)?,
            None => None,
        };

        Ok(Self {
            hash,
            timestamp,
            from,
            to,
            value: parse_value(&raw.value)?,
            method_selector: parse_selector(raw.method_id.as_deref(), raw.input.as_deref()),
        })
    }
}

/// One observed NFT transfer, consumed by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub timestamp: DateTime<Utc>,
    pub from: Address,
    pub to: Address,
    pub contract: Address,
    pub token_id: U256,
    pub standard: TokenStandard,
    /// Always 1 for ERC721.
    pub token_amount: U256,
    pub token_name: String,
    pub tx_hash: TxHash,
}

impl TransferEvent {
    pub fn decode(raw: &RawTokenTransfer, standard: TokenStandard) -> Result<Self, DecodeError> {
        let token_amount = match standard {
            TokenStandard::Erc721 => U256::from(1),
            TokenStandard::Erc1155 => {
                parse_decimal("tokenValue", required("tokenValue", &raw.token_value)?)?
            }
        };

        Ok(Self {
            timestamp: parse_timestamp(required("timeStamp", &raw.time_stamp)?)?,
            from: required_address("from", &raw.from)?,
            to: required_address("to", &raw.to)?,
            contract: required_address("contractAddress", &raw.contract_address)?,
            token_id: parse_decimal("tokenID", required("tokenID", &raw.token_id)?)?,
            standard,
            token_amount,
            token_name: raw.token_name.clone().unwrap_or_default(),
            tx_hash: parse_hash(required("hash", &raw.hash)?)?,
        })
    }

    /// Sender and receiver coincide: a test artifact that moves nothing.
    pub fn is_self_transfer(&self) -> bool {
        self.from == self.to
    }
}

/// Lowercase, `0x`-prefixed, full-width hex as used at the API boundary.
pub fn to_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode_prefixed(bytes)
}

/// Parse an address field. Empty means "no address" (contract creation);
/// a bare `0x` is the zero address.
pub fn parse_address(field: &'static str, raw: &str) -> Result<Option<Address>, DecodeError> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }
    if s.eq_ignore_ascii_case("0x") {
        return Ok(Some(Address::ZERO));
    }
    Address::from_str(s)
        .map(Some)
        .map_err(|_| DecodeError::InvalidAddress {
            field,
            value: raw.to_string(),
        })
}

pub fn parse_hash(raw: &str) -> Result<TxHash, DecodeError> {
    TxHash::from_str(raw.trim()).map_err(|_| DecodeError::InvalidHash(raw.to_string()))
}

/// Parse a transaction value given either as a JSON number, a decimal
/// string or a `0x` hex string.
pub fn parse_value(raw: &serde_json::Value) -> Result<U256, DecodeError> {
    match raw {
        serde_json::Value::Number(n) => match n.as_u64() {
            Some(v) => Ok(U256::from(v)),
            // Numbers keep their source digits, so wide integers parse exactly.
            None => parse_decimal("value", &n.to_string()),
        },
        serde_json::Value::String(s) => parse_quantity("value", s),
        serde_json::Value::Null => Err(DecodeError::MissingField("value")),
        other => Err(DecodeError::InvalidNumber {
            field: "value",
            value: other.to_string(),
        }),
    }
}

fn parse_quantity(field: &'static str, raw: &str) -> Result<U256, DecodeError> {
    let s = raw.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some("") => Ok(U256::ZERO),
        Some(digits) => U256::from_str_radix(digits, 16).map_err(|_| DecodeError::InvalidNumber {
            field,
            value: raw.to_string(),
        }),
        None => parse_decimal(field, s),
    }
}

fn parse_decimal(field: &'static str, raw: &str) -> Result<U256, DecodeError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(DecodeError::MissingField(field));
    }
    U256::from_str_radix(s, 10).map_err(|_| DecodeError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| DecodeError::InvalidTimestamp(raw.to_string()))
}

/// `methodId` when the listing provides it, else the first four bytes of
/// the call data. Plain value transfers (`0x`) have no selector.
fn parse_selector(method_id: Option<&str>, input: Option<&str>) -> Option<Selector> {
    let source = method_id
        .filter(|s| !s.trim().is_empty())
        .or(input)?
        .trim();
    let digits = source.strip_prefix("0x").unwrap_or(source);
    let bytes = hex::decode(digits.get(..8)?).ok()?;
    Some(Selector::from_slice(&bytes))
}

fn required<'a>(field: &'static str, value: &'a Option<String>) -> Result<&'a str, DecodeError> {
    match value.as_deref() {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(DecodeError::MissingField(field)),
    }
}

fn required_address(field: &'static str, value: &Option<String>) -> Result<Address, DecodeError> {
    parse_address(field, required(field, value)?)?.ok_or(DecodeError::MissingField(field))
}
