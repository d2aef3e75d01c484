//! NFT lifecycle tracking.
//!
//! Each NFT (token id + contract) accumulates one classified event per
//! transfer applied from the owning wallet's point of view:
//! - `Created`: first event, minted to the wallet for free
//! - `Governance`: first event, minted to the wallet under the reserved
//!   governance token name; never traded afterwards
//! - `Sold`: the wallet sent it and got paid
//! - `Bought`: the wallet received it from someone other than the mint
//!   address and paid for it
//!
//! A transfer that breaks one of these rules is refused with a named
//! `NftError` and leaves the sequence untouched.

use crate::config::{ConfigError, GovernanceConfig};
use crate::explorer::types::{parse_address, to_hex, TransferEvent};
use alloy::primitives::{address, Address, TxHash, U256};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

/// Senders of minted tokens; also the burn destination.
pub const MINT_ADDRESS: Address = Address::ZERO;

pub const GOVERNANCE_TOKEN_NAME: &str = "NftGovernance";

pub const GOVERNANCE_CONTRACT: Address = address!("88e0f9b16f5c3ff1f48576bf2dc785070c6a86a5");

/// Identity of an NFT within one wallet's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NftKey {
    pub token_id: U256,
    pub contract: Address,
}

impl NftKey {
    pub fn of(transfer: &TransferEvent) -> Self {
        Self {
            token_id: transfer.token_id,
            contract: transfer.contract,
        }
    }
}

impl std::fmt::Display for NftKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.token_id, to_hex(self.contract))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NftStatus {
    Created,
    Sold,
    Bought,
    Governance,
}

impl std::fmt::Display for NftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NftStatus::Created => write!(f, "created"),
            NftStatus::Sold => write!(f, "sold"),
            NftStatus::Bought => write!(f, "bought"),
            NftStatus::Governance => write!(f, "governance"),
        }
    }
}

/// One classified transfer of an NFT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftEvent {
    pub timestamp: DateTime<Utc>,
    pub from: Address,
    pub to: Address,
    pub token_amount: U256,
    pub token_name: String,
    pub tx_hash: TxHash,
    /// Native value of the paired money transaction, in wei.
    pub value: U256,
    pub status: NftStatus,
}

impl NftEvent {
    fn new(transfer: &TransferEvent, value: U256, status: NftStatus) -> Self {
        Self {
            timestamp: transfer.timestamp,
            from: transfer.from,
            to: transfer.to,
            token_amount: transfer.token_amount,
            token_name: transfer.token_name.clone(),
            tx_hash: transfer.tx_hash,
            value,
            status,
        }
    }
}

/// Fixed markers the classifier compares transfers against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRules {
    pub governance_token_name: String,
    pub governance_contract: Address,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            governance_token_name: GOVERNANCE_TOKEN_NAME.to_string(),
            governance_contract: GOVERNANCE_CONTRACT,
        }
    }
}

impl ClassificationRules {
    pub fn from_config(config: &GovernanceConfig) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidAddress {
            field: "governance.contract",
            value: config.contract.clone(),
        };
        let contract = parse_address("governance.contract", &config.contract)
            .map_err(|_| invalid())?
            .ok_or_else(invalid)?;

        Ok(Self {
            governance_token_name: config.token_name.clone(),
            governance_contract: contract,
        })
    }

    pub fn is_governance_token(&self, transfer: &TransferEvent) -> bool {
        transfer.token_name == self.governance_token_name
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NftError {
    #[error("nft {key}: wallet {actor} is neither sender nor receiver of transfer {tx}")]
    NotAParty { key: NftKey, actor: Address, tx: TxHash },
    #[error("nft {key}: cannot be created by {tx}, {prior} events already recorded")]
    CreatedNotFirst { key: NftKey, tx: TxHash, prior: usize },
    #[error("nft {key}: created by {tx} but {value} wei changed hands")]
    CreatedWithValue { key: NftKey, tx: TxHash, value: U256 },
    #[error("nft {key}: sold in {tx} before it was ever acquired")]
    SoldBeforeAcquired { key: NftKey, tx: TxHash },
    #[error("nft {key}: governance token cannot be {status} ({tx})")]
    TradeOnGovernance { key: NftKey, tx: TxHash, status: NftStatus },
    #[error("nft {key}: {status} in {tx} but no money changed hands")]
    TradeWithoutValue { key: NftKey, tx: TxHash, status: NftStatus },
    #[error("nft {key}: governance token received in {tx} after being traded")]
    GovernanceAfterTrade { key: NftKey, tx: TxHash },
    #[error("nft {key}: governance token received in {tx}, {prior} events already recorded")]
    GovernanceNotFirst { key: NftKey, tx: TxHash, prior: usize },
    #[error("nft {key}: creation recorded at event {index}, only the first event may be a creation")]
    CreatedOutOfOrder { key: NftKey, index: usize },
}

/// Append-only classified history of one NFT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nft {
    key: NftKey,
    events: Vec<NftEvent>,
}

impl Nft {
    pub fn new(key: NftKey) -> Self {
        Self {
            key,
            events: Vec::new(),
        }
    }

    pub fn key(&self) -> NftKey {
        self.key
    }

    pub fn events(&self) -> &[NftEvent] {
        &self.events
    }

    pub fn statuses(&self) -> impl Iterator<Item = NftStatus> + '_ {
        self.events.iter().map(|e| e.status)
    }

    /// Classify `transfer` from `actor`'s side and append the result.
    ///
    /// `value` is the resolved native value of the paired transaction.
    pub fn apply(
        &mut self,
        actor: Address,
        transfer: &TransferEvent,
        value: U256,
        rules: &ClassificationRules,
    ) -> Result<NftStatus, NftError> {
        let status = if actor == transfer.from {
            self.check_sold(transfer, value)?
        } else if actor == transfer.to {
            if transfer.from == MINT_ADDRESS {
                if rules.is_governance_token(transfer) {
                    if transfer.contract != rules.governance_contract {
                        warn!(
                            nft = %self.key,
                            contract = %to_hex(transfer.contract),
                            "governance-named token minted by unexpected contract"
                        );
                    }
                    self.check_governance(transfer)?
                } else {
                    self.check_created(transfer, value)?
                }
            } else {
                self.check_trade(transfer.tx_hash, value, NftStatus::Bought)?
            }
        } else {
            return Err(NftError::NotAParty {
                key: self.key,
                actor,
                tx: transfer.tx_hash,
            });
        };

        self.events.push(NftEvent::new(transfer, value, status));
        Ok(status)
    }

    fn check_created(&self, transfer: &TransferEvent, value: U256) -> Result<NftStatus, NftError> {
        let tx = transfer.tx_hash;
        if !self.events.is_empty() {
            return Err(NftError::CreatedNotFirst {
                key: self.key,
                tx,
                prior: self.events.len(),
            });
        }
        if !value.is_zero() {
            return Err(NftError::CreatedWithValue { key: self.key, tx, value });
        }
        Ok(NftStatus::Created)
    }

    fn check_governance(&self, transfer: &TransferEvent) -> Result<NftStatus, NftError> {
        let tx = transfer.tx_hash;
        if self.ever_sold() || self.ever_bought() {
            return Err(NftError::GovernanceAfterTrade { key: self.key, tx });
        }
        if !self.events.is_empty() {
            return Err(NftError::GovernanceNotFirst {
                key: self.key,
                tx,
                prior: self.events.len(),
            });
        }
        Ok(NftStatus::Governance)
    }

    fn check_sold(&self, transfer: &TransferEvent, value: U256) -> Result<NftStatus, NftError> {
        let tx = transfer.tx_hash;
        if self.events.is_empty() {
            return Err(NftError::SoldBeforeAcquired { key: self.key, tx });
        }
        self.check_trade(tx, value, NftStatus::Sold)
    }

    fn check_trade(&self, tx: TxHash, value: U256, status: NftStatus) -> Result<NftStatus, NftError> {
        if self.is_governance() {
            return Err(NftError::TradeOnGovernance { key: self.key, tx, status });
        }
        if value.is_zero() {
            return Err(NftError::TradeWithoutValue { key: self.key, tx, status });
        }
        Ok(status)
    }

    fn with_status(&self, status: NftStatus) -> impl Iterator<Item = &NftEvent> + '_ {
        self.events.iter().filter(move |e| e.status == status)
    }

    pub fn sale_count(&self) -> usize {
        self.with_status(NftStatus::Sold).count()
    }

    pub fn purchase_count(&self) -> usize {
        self.with_status(NftStatus::Bought).count()
    }

    pub fn ever_sold(&self) -> bool {
        self.sale_count() > 0
    }

    pub fn ever_bought(&self) -> bool {
        self.purchase_count() > 0
    }

    pub fn is_governance(&self) -> bool {
        self.with_status(NftStatus::Governance).next().is_some()
    }

    /// True when the history starts with a creation. A creation anywhere
    /// after the first event is a broken history and reported as such.
    pub fn ever_created(&self) -> Result<bool, NftError> {
        if let Some(index) = self
            .events
            .iter()
            .skip(1)
            .position(|e| e.status == NftStatus::Created)
        {
            return Err(NftError::CreatedOutOfOrder {
                key: self.key,
                index: index + 1,
            });
        }
        Ok(self
            .events
            .first()
            .is_some_and(|e| e.status == NftStatus::Created))
    }

    /// Sum of values received over Sold events, in wei.
    pub fn total_revenue(&self) -> U256 {
        self.with_status(NftStatus::Sold)
            .fold(U256::ZERO, |acc, e| acc + e.value)
    }

    /// Sum of values paid over Bought events, in wei.
    pub fn total_cost(&self) -> U256 {
        self.with_status(NftStatus::Bought)
            .fold(U256::ZERO, |acc, e| acc + e.value)
    }

    /// Sender of each Sold event, in event order.
    ///
    /// This is the tracked wallet's own side of the sale, not the buyer:
    /// the run-level "wallets with at least one sale" count is built from
    /// these, so it counts analysed wallets.
    pub fn seller_addresses(&self) -> Vec<Address> {
        self.with_status(NftStatus::Sold).map(|e| e.from).collect()
    }

    /// Receiver of each Bought event, in event order. Like
    /// `seller_addresses`, the wallet's own side rather than the seller.
    pub fn buyer_addresses(&self) -> Vec<Address> {
        self.with_status(NftStatus::Bought).map(|e| e.to).collect()
    }
}
