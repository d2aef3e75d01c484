//! Where the wallets to analyse come from: a YAML address book, or the
//! counterparties of a set of contracts.

use crate::explorer::types::{parse_address, to_hex};
use crate::explorer::{ExplorerApi, ExplorerError};
use alloy::primitives::Address;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum AddressBookError {
    #[error("failed to read address book: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse address book: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid address in `{list}`: {value}")]
    InvalidAddress { list: &'static str, value: String },
    #[error("address book has no `{0}` entries")]
    Empty(&'static str),
}

/// ```yaml
/// wallets:
///   - "0x5aeda56215b167893e80b4fe645ba6d5bab767de"
/// contracts:
///   - "0x2953399124f0cbb46d2cbacd8a89cf0599974963"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressBook {
    #[serde(default)]
    pub wallets: Vec<String>,
    #[serde(default)]
    pub contracts: Vec<String>,
}

impl AddressBook {
    pub fn load(path: &Path) -> Result<Self, AddressBookError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, AddressBookError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn wallet_addresses(&self) -> Result<Vec<Address>, AddressBookError> {
        parse_list("wallets", &self.wallets)
    }

    pub fn contract_addresses(&self) -> Result<Vec<Address>, AddressBookError> {
        parse_list("contracts", &self.contracts)
    }
}

fn parse_list(list: &'static str, raw: &[String]) -> Result<Vec<Address>, AddressBookError> {
    if raw.is_empty() {
        return Err(AddressBookError::Empty(list));
    }
    raw.iter()
        .map(|value| {
            parse_address(list, value)
                .ok()
                .flatten()
                .ok_or_else(|| AddressBookError::InvalidAddress {
                    list,
                    value: value.clone(),
                })
        })
        .collect()
}

/// Every address that sent to or received from one of `contracts`,
/// de-duplicated in first-seen order.
pub async fn wallets_from_contracts(
    client: &dyn ExplorerApi,
    contracts: &[Address],
) -> Result<Vec<Address>, ExplorerError> {
    let mut seen = HashSet::new();
    let mut wallets = Vec::new();

    for contract in contracts {
        let records = client.normal_transactions(*contract).await?;
        let before = wallets.len();

        for raw in &records {
            for (field, value) in [("from", &raw.from), ("to", &raw.to)] {
                let Some(value) = value.as_deref() else {
                    continue;
                };
                match parse_address(field, value) {
                    Ok(Some(address)) => {
                        if seen.insert(address) {
                            wallets.push(address);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(contract = %to_hex(contract), error = %e, "skipping undecodable address"),
                }
            }
        }

        info!(
            contract = %to_hex(contract),
            transactions = records.len(),
            new_wallets = wallets.len() - before,
            "wallets derived from contract"
        );
    }

    Ok(wallets)
}
