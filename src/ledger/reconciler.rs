//! Per-wallet reconciliation.
//!
//! For one wallet: load its normal transactions into the shared cache,
//! pull its ERC-1155 then ERC-721 transfers, resolve the money transaction
//! behind each transfer and fold the transfer into the NFT it moves.
//!
//! Failure tiers:
//! - malformed records and NFT rule violations are logged and skipped
//! - explorer failures abort this wallet (`ReconcileError::Fetch`)
//! - a transfer whose transaction cannot be found anywhere aborts the
//!   whole run (`ReconcileError::TransactionNotFound`), since the explorer
//!   data is then inconsistent

use crate::explorer::types::{to_hex, MoneyTransaction, RawTokenTransfer, TokenStandard, TransferEvent};
use crate::explorer::{ExplorerApi, ExplorerError};
use crate::ledger::cache::TransactionCache;
use crate::ledger::nft::{ClassificationRules, Nft, NftError, NftKey, NftStatus};
use alloy::primitives::{Address, TxHash, U256};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("explorer fetch failed for {}: {source}", to_hex(.address))]
    Fetch {
        address: Address,
        #[source]
        source: ExplorerError,
    },
    #[error("transaction {} behind a transfer of wallet {} not found in the explorer", to_hex(.hash), to_hex(.wallet))]
    TransactionNotFound { hash: TxHash, wallet: Address },
}

impl ReconcileError {
    /// Fatal errors abort the run; the rest only abort the current wallet.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::TransactionNotFound { .. })
    }
}

/// Transfer bookkeeping for one wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub transfers_seen: usize,
    pub applied: usize,
    pub self_transfers: usize,
    pub malformed: usize,
    pub rejected: usize,
}

/// NFTs discovered while reconciling one wallet.
#[derive(Debug, Clone)]
pub struct AddressLedger {
    wallet: Address,
    nfts: HashMap<NftKey, Nft>,
    stats: LedgerStats,
}

impl AddressLedger {
    pub fn new(wallet: Address) -> Self {
        Self {
            wallet,
            nfts: HashMap::new(),
            stats: LedgerStats::default(),
        }
    }

    pub fn wallet(&self) -> Address {
        self.wallet
    }

    pub fn nfts(&self) -> impl Iterator<Item = &Nft> {
        self.nfts.values()
    }

    pub fn nft(&self, key: &NftKey) -> Option<&Nft> {
        self.nfts.get(key)
    }

    pub fn len(&self) -> usize {
        self.nfts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nfts.is_empty()
    }

    pub fn stats(&self) -> LedgerStats {
        self.stats
    }

    /// Classify `event` into the NFT it moves, from this wallet's side.
    /// The NFT is tracked from its first transfer on, even when that
    /// transfer is rejected; a rejected transfer leaves its events untouched.
    pub fn record(
        &mut self,
        event: &TransferEvent,
        value: U256,
        rules: &ClassificationRules,
    ) -> Result<NftStatus, NftError> {
        let key = NftKey::of(event);
        let outcome = self
            .nfts
            .entry(key)
            .or_insert_with(|| Nft::new(key))
            .apply(self.wallet, event, value, rules);
        match outcome {
            Ok(_) => self.stats.applied += 1,
            Err(_) => self.stats.rejected += 1,
        }
        outcome
    }
}

/// Reconciles one wallet against the explorer.
pub struct AddressReconciler<'a> {
    client: &'a dyn ExplorerApi,
    cache: TransactionCache,
    rules: &'a ClassificationRules,
    ledger: AddressLedger,
}

impl<'a> AddressReconciler<'a> {
    pub fn new(
        client: &'a dyn ExplorerApi,
        cache: TransactionCache,
        rules: &'a ClassificationRules,
        wallet: Address,
    ) -> Self {
        Self {
            client,
            cache,
            rules,
            ledger: AddressLedger::new(wallet),
        }
    }

    pub fn ledger(&self) -> &AddressLedger {
        &self.ledger
    }

    /// Fetch `address`'s normal transactions into the cache. Returns false
    /// when the explorer has none.
    pub async fn load_transaction_history(&self, address: Address) -> Result<bool, ReconcileError> {
        let records = self
            .client
            .normal_transactions(address)
            .await
            .map_err(|source| ReconcileError::Fetch { address, source })?;

        let inserted = self.cache.populate_from_transaction_list(address, &records);
        if records.is_empty() {
            info!(address = %to_hex(address), "no normal transactions");
            return Ok(false);
        }

        info!(
            address = %to_hex(address),
            transactions = records.len(),
            new = inserted,
            "transaction history loaded"
        );
        Ok(true)
    }

    /// Find the money transaction paired with `event`.
    ///
    /// Cache first, then a direct by-hash fetch, then the history of the
    /// counterparty (if not loaded yet).
    pub async fn resolve_transfer_value(&self, event: &TransferEvent) -> Result<MoneyTransaction, ReconcileError> {
        let hash = event.tx_hash;
        if let Some(tx) = self.cache.get(&hash) {
            return Ok(tx);
        }

        info!(tx = %to_hex(hash), "transaction not cached, fetching by hash");
        let fetched = self
            .client
            .transaction_by_hash(hash)
            .await
            .map_err(|source| ReconcileError::Fetch {
                address: self.ledger.wallet,
                source,
            })?;
        if let Some(raw) = fetched {
            match MoneyTransaction::try_from(&raw) {
                Ok(tx) => {
                    self.cache.put(tx);
                }
                Err(e) => warn!(tx = %to_hex(hash), error = %e, "malformed transaction from by-hash fetch"),
            }
            if let Some(tx) = self.cache.get(&hash) {
                return Ok(tx);
            }
        }

        let counterparty = if event.from == self.ledger.wallet {
            event.to
        } else {
            event.from
        };
        if !self.cache.is_loaded(&counterparty) {
            info!(
                tx = %to_hex(hash),
                counterparty = %to_hex(counterparty),
                "transaction still missing, loading counterparty history"
            );
            self.load_transaction_history(counterparty).await?;
        }

        self.cache
            .get(&hash)
            .ok_or(ReconcileError::TransactionNotFound {
                hash,
                wallet: self.ledger.wallet,
            })
    }

    /// Decode, resolve and classify a batch of transfers of one standard.
    pub async fn apply_transfers(
        &mut self,
        standard: TokenStandard,
        records: &[RawTokenTransfer],
    ) -> Result<(), ReconcileError> {
        let wallet = self.ledger.wallet;

        for raw in records {
            self.ledger.stats.transfers_seen += 1;

            let event = match TransferEvent::decode(raw, standard) {
                Ok(event) => event,
                Err(e) => {
                    self.ledger.stats.malformed += 1;
                    warn!(
                        wallet = %to_hex(wallet),
                        standard = %standard,
                        hash = ?raw.hash,
                        error = %e,
                        "skipping malformed transfer record"
                    );
                    continue;
                }
            };

            if event.is_self_transfer() {
                self.ledger.stats.self_transfers += 1;
                debug!(tx = %to_hex(event.tx_hash), "self transfer, likely a test transaction");
                continue;
            }

            let tx = self.resolve_transfer_value(&event).await?;
            let key = NftKey::of(&event);

            match self.ledger.record(&event, tx.value, self.rules) {
                Ok(status) => {
                    debug!(nft = %key, tx = %to_hex(event.tx_hash), status = %status, value = %tx.value, "transfer classified");
                }
                Err(e) => {
                    let history: Vec<String> = self
                        .ledger
                        .nft(&key)
                        .map(|nft| nft.events().iter().map(|ev| to_hex(ev.tx_hash)).collect())
                        .unwrap_or_default();
                    warn!(
                        wallet = %to_hex(wallet),
                        nft = %key,
                        tx = %to_hex(event.tx_hash),
                        history = ?history,
                        error = %e,
                        "transfer rejected"
                    );
                }
            }
        }

        Ok(())
    }

    /// Reconcile the wallet. `Ok(None)` means it has no transaction
    /// history and was skipped.
    pub async fn run(mut self) -> Result<Option<AddressLedger>, ReconcileError> {
        let wallet = self.ledger.wallet;
        if !self.load_transaction_history(wallet).await? {
            info!(wallet = %to_hex(wallet), "wallet inactive, skipping");
            return Ok(None);
        }

        for standard in [TokenStandard::Erc1155, TokenStandard::Erc721] {
            let records = self
                .client
                .token_transfers(standard, wallet)
                .await
                .map_err(|source| ReconcileError::Fetch { address: wallet, source })?;

            if records.is_empty() {
                info!(wallet = %to_hex(wallet), standard = %standard, "no token transfers");
                continue;
            }
            info!(wallet = %to_hex(wallet), standard = %standard, transfers = records.len(), "applying token transfers");
            self.apply_transfers(standard, &records).await?;
        }

        let stats = self.ledger.stats;
        info!(
            wallet = %to_hex(wallet),
            nfts = self.ledger.len(),
            seen = stats.transfers_seen,
            applied = stats.applied,
            self_transfers = stats.self_transfers,
            malformed = stats.malformed,
            rejected = stats.rejected,
            "wallet reconciled"
        );
        Ok(Some(self.ledger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::nft::{GOVERNANCE_TOKEN_NAME, MINT_ADDRESS};
    use alloy::primitives::address;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    const WALLET: Address = address!("5aeda56215b167893e80b4fe645ba6d5bab767de");
    const BUYER: Address = address!("00000000219ab540356cbb839cbe05303d7705fa");
    const CONTRACT: Address = address!("2953399124f0cbb46d2cbacd8a89cf0599974963");

    /// In-memory explorer that records every call it serves.
    #[derive(Default)]
    struct MockExplorer {
        normal: HashMap<Address, Vec<crate::explorer::types::RawTransaction>>,
        by_hash: HashMap<TxHash, crate::explorer::types::RawTransaction>,
        transfers: HashMap<(TokenStandard, Address), Vec<RawTokenTransfer>>,
        fail_transfers: bool,
        calls: Mutex<Vec<String>>,
    }

    impl MockExplorer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExplorerApi for MockExplorer {
        async fn normal_transactions(
            &self,
            address: Address,
        ) -> Result<Vec<crate::explorer::types::RawTransaction>, ExplorerError> {
            self.calls.lock().unwrap().push(format!("txlist {}", to_hex(address)));
            Ok(self.normal.get(&address).cloned().unwrap_or_default())
        }

        async fn transaction_by_hash(
            &self,
            hash: TxHash,
        ) -> Result<Option<crate::explorer::types::RawTransaction>, ExplorerError> {
            self.calls.lock().unwrap().push(format!("byhash {}", to_hex(hash)));
            Ok(self.by_hash.get(&hash).cloned())
        }

        async fn token_transfers(
            &self,
            standard: TokenStandard,
            address: Address,
        ) -> Result<Vec<RawTokenTransfer>, ExplorerError> {
            self.calls.lock().unwrap().push(format!("{} {}", standard, to_hex(address)));
            if self.fail_transfers {
                return Err(ExplorerError::Exhausted {
                    action: standard.action().to_string(),
                    attempts: 5,
                    last_error: "HTTP 502 Bad Gateway".to_string(),
                });
            }
            Ok(self.transfers.get(&(standard, address)).cloned().unwrap_or_default())
        }
    }

    fn money(n: u8, from: Address, to: Address, value: &str) -> crate::explorer::types::RawTransaction {
        serde_json::from_value(json!({
            "hash": to_hex(TxHash::with_last_byte(n)),
            "timeStamp": "1700000000",
            "from": to_hex(from),
            "to": to_hex(to),
            "value": value,
            "methodId": "0x",
        }))
        .unwrap()
    }

    fn nft_transfer(n: u8, from: Address, to: Address, token_id: u64, name: &str) -> RawTokenTransfer {
        serde_json::from_value(json!({
            "hash": to_hex(TxHash::with_last_byte(n)),
            "timeStamp": (1_700_000_000u64 + n as u64).to_string(),
            "from": to_hex(from),
            "to": to_hex(to),
            "contractAddress": to_hex(CONTRACT),
            "tokenID": token_id.to_string(),
            "tokenName": name,
            "tokenValue": "1",
        }))
        .unwrap()
    }

    fn key(token_id: u64) -> NftKey {
        NftKey {
            token_id: U256::from(token_id),
            contract: CONTRACT,
        }
    }

    #[tokio::test]
    async fn test_inactive_wallet_is_skipped() {
        let explorer = MockExplorer::default();
        let rules = ClassificationRules::default();
        let result = AddressReconciler::new(&explorer, TransactionCache::new(), &rules, WALLET)
            .run()
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(explorer.calls(), vec![format!("txlist {}", to_hex(WALLET))]);
    }

    #[tokio::test]
    async fn test_mint_then_sale() {
        let mut explorer = MockExplorer::default();
        explorer.normal.insert(
            WALLET,
            vec![
                money(1, CONTRACT, WALLET, "0"),
                money(2, BUYER, WALLET, "500"),
            ],
        );
        explorer.transfers.insert(
            (TokenStandard::Erc721, WALLET),
            vec![
                nft_transfer(1, MINT_ADDRESS, WALLET, 1, "SomeCollectible"),
                nft_transfer(2, WALLET, BUYER, 1, "SomeCollectible"),
            ],
        );

        let rules = ClassificationRules::default();
        let ledger = AddressReconciler::new(&explorer, TransactionCache::new(), &rules, WALLET)
            .run()
            .await
            .unwrap()
            .unwrap();

        let nft = ledger.nft(&key(1)).unwrap();
        assert_eq!(
            nft.statuses().collect::<Vec<_>>(),
            vec![NftStatus::Created, NftStatus::Sold]
        );
        assert_eq!(nft.ever_created(), Ok(true));
        assert_eq!(nft.total_revenue(), U256::from(500));
        assert_eq!(ledger.stats().applied, 2);
    }

    #[tokio::test]
    async fn test_governance_mint_then_sale_is_rejected() {
        let mut explorer = MockExplorer::default();
        explorer.normal.insert(
            WALLET,
            vec![
                money(1, CONTRACT, WALLET, "0"),
                money(2, BUYER, WALLET, "500"),
            ],
        );
        explorer.transfers.insert(
            (TokenStandard::Erc1155, WALLET),
            vec![
                nft_transfer(1, MINT_ADDRESS, WALLET, 3, GOVERNANCE_TOKEN_NAME),
                nft_transfer(2, WALLET, BUYER, 3, GOVERNANCE_TOKEN_NAME),
            ],
        );

        let rules = ClassificationRules::default();
        let ledger = AddressReconciler::new(&explorer, TransactionCache::new(), &rules, WALLET)
            .run()
            .await
            .unwrap()
            .unwrap();

        let nft = ledger.nft(&key(3)).unwrap();
        assert_eq!(nft.statuses().collect::<Vec<_>>(), vec![NftStatus::Governance]);
        assert!(nft.is_governance());
        assert!(!nft.ever_sold());
        assert_eq!(ledger.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_self_transfer_is_dropped_without_lookup() {
        let mut explorer = MockExplorer::default();
        explorer.normal.insert(WALLET, vec![money(1, WALLET, WALLET, "0")]);
        explorer.transfers.insert(
            (TokenStandard::Erc721, WALLET),
            vec![nft_transfer(9, WALLET, WALLET, 5, "Test")],
        );

        let cache = TransactionCache::new();
        let rules = ClassificationRules::default();
        let ledger = AddressReconciler::new(&explorer, cache.clone(), &rules, WALLET)
            .run()
            .await
            .unwrap()
            .unwrap();

        assert!(ledger.is_empty());
        assert_eq!(ledger.stats().self_transfers, 1);
        assert_eq!(cache.len(), 1);
        assert!(!explorer.calls().iter().any(|c| c.starts_with("byhash")));
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_by_hash_fetch() {
        let mut explorer = MockExplorer::default();
        explorer.by_hash.insert(
            TxHash::with_last_byte(4),
            serde_json::from_value(json!({
                "hash": to_hex(TxHash::with_last_byte(4)),
                "from": to_hex(WALLET),
                "to": to_hex(CONTRACT),
                "value": "0x2a",
                "input": "0x",
            }))
            .unwrap(),
        );

        let cache = TransactionCache::new();
        let rules = ClassificationRules::default();
        let reconciler = AddressReconciler::new(&explorer, cache.clone(), &rules, WALLET);
        let event = TransferEvent::decode(
            &nft_transfer(4, BUYER, WALLET, 8, "x"),
            TokenStandard::Erc721,
        )
        .unwrap();

        let tx = reconciler.resolve_transfer_value(&event).await.unwrap();
        assert_eq!(tx.value, U256::from(42));
        assert!(cache.get(&TxHash::with_last_byte(4)).is_some());
        assert!(!explorer.calls().iter().any(|c| c.starts_with("txlist")));
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_counterparty_history() {
        let mut explorer = MockExplorer::default();
        // The purchase was paid by the wallet through a marketplace, so the
        // money transaction only shows up in the seller's listing.
        explorer.normal.insert(BUYER, vec![money(6, WALLET, BUYER, "750")]);

        let cache = TransactionCache::new();
        let rules = ClassificationRules::default();
        let mut reconciler = AddressReconciler::new(&explorer, cache.clone(), &rules, WALLET);

        reconciler
            .apply_transfers(
                TokenStandard::Erc721,
                &[nft_transfer(6, BUYER, WALLET, 11, "x")],
            )
            .await
            .unwrap();

        let nft = reconciler.ledger().nft(&key(11)).unwrap();
        assert_eq!(nft.statuses().collect::<Vec<_>>(), vec![NftStatus::Bought]);
        assert_eq!(nft.total_cost(), U256::from(750));
        assert!(cache.is_loaded(&BUYER));
        assert_eq!(
            explorer.calls(),
            vec![
                format!("byhash {}", to_hex(TxHash::with_last_byte(6))),
                format!("txlist {}", to_hex(BUYER)),
            ]
        );
    }

    #[tokio::test]
    async fn test_unresolvable_transaction_is_fatal() {
        let explorer = MockExplorer::default();
        let rules = ClassificationRules::default();
        let mut reconciler = AddressReconciler::new(&explorer, TransactionCache::new(), &rules, WALLET);

        let err = reconciler
            .apply_transfers(
                TokenStandard::Erc721,
                &[nft_transfer(13, BUYER, WALLET, 2, "x")],
            )
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(
            err,
            ReconcileError::TransactionNotFound { hash, wallet }
                if hash == TxHash::with_last_byte(13) && wallet == WALLET
        ));
    }

    #[tokio::test]
    async fn test_counterparty_loaded_once() {
        let explorer = MockExplorer::default();
        let cache = TransactionCache::new();
        let rules = ClassificationRules::default();
        let reconciler = AddressReconciler::new(&explorer, cache.clone(), &rules, WALLET);

        // BUYER has an empty history: first miss loads it, second does not.
        let first = TransferEvent::decode(&nft_transfer(20, BUYER, WALLET, 1, "x"), TokenStandard::Erc721).unwrap();
        assert!(reconciler.resolve_transfer_value(&first).await.is_err());
        let second = TransferEvent::decode(&nft_transfer(21, BUYER, WALLET, 1, "x"), TokenStandard::Erc721).unwrap();
        assert!(reconciler.resolve_transfer_value(&second).await.is_err());

        let txlists = explorer.calls().iter().filter(|c| c.starts_with("txlist")).count();
        assert_eq!(txlists, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_not_fatal() {
        let mut explorer = MockExplorer::default();
        explorer.normal.insert(WALLET, vec![money(1, WALLET, BUYER, "1")]);
        explorer.fail_transfers = true;

        let rules = ClassificationRules::default();
        let err = AddressReconciler::new(&explorer, TransactionCache::new(), &rules, WALLET)
            .run()
            .await
            .unwrap_err();

        assert!(!err.is_fatal());
        assert!(matches!(err, ReconcileError::Fetch { address, .. } if address == WALLET));
    }

    #[tokio::test]
    async fn test_rule_violation_does_not_stop_wallet() {
        let mut explorer = MockExplorer::default();
        explorer.normal.insert(
            WALLET,
            vec![
                money(1, BUYER, WALLET, "0"),
                money(2, CONTRACT, WALLET, "0"),
            ],
        );
        explorer.transfers.insert(
            (TokenStandard::Erc721, WALLET),
            vec![
                // Free transfer from another wallet: not a purchase.
                nft_transfer(1, BUYER, WALLET, 1, "x"),
                nft_transfer(2, MINT_ADDRESS, WALLET, 2, "x"),
            ],
        );

        let rules = ClassificationRules::default();
        let ledger = AddressReconciler::new(&explorer, TransactionCache::new(), &rules, WALLET)
            .run()
            .await
            .unwrap()
            .unwrap();

        // Tracked from first sight, with no classified event.
        assert!(ledger.nft(&key(1)).unwrap().events().is_empty());
        assert_eq!(
            ledger.nft(&key(2)).unwrap().statuses().collect::<Vec<_>>(),
            vec![NftStatus::Created]
        );
        assert_eq!(ledger.stats().rejected, 1);
        assert_eq!(ledger.stats().applied, 1);
    }

    #[test]
    fn test_nft_error_names_key() {
        let err = NftError::SoldBeforeAcquired {
            key: key(4),
            tx: TxHash::with_last_byte(1),
        };
        assert!(err.to_string().contains(&key(4).to_string()));
    }
}
