//! Run-wide transaction cache: tx hash → decoded money transaction.
//!
//! Filled lazily from every normal-transaction listing fetched during the
//! run (the analysed wallets and any counterparties pulled in to resolve a
//! transfer), plus single transactions fetched by hash. Entries are
//! first-write-wins and never evicted. Also remembers which addresses
//! already had their history loaded so a counterparty is fetched once.

use crate::explorer::types::{to_hex, MoneyTransaction, RawTransaction};
use alloy::primitives::{Address, TxHash};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Thread-safe, cheaply cloneable handle to the shared cache.
#[derive(Clone, Default)]
pub struct TransactionCache {
    by_hash: Arc<DashMap<TxHash, MoneyTransaction>>,
    loaded: Arc<DashSet<Address>>,
}

impl TransactionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &TxHash) -> Option<MoneyTransaction> {
        self.by_hash.get(hash).map(|e| e.clone())
    }

    /// Insert unless the hash is already known. Returns whether it was new.
    pub fn put(&self, tx: MoneyTransaction) -> bool {
        match self.by_hash.entry(tx.hash) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(tx);
                true
            }
        }
    }

    /// Decode and insert a normal-transaction listing for `address`.
    /// Malformed records are skipped with a warning. Returns the number of
    /// newly cached transactions.
    pub fn populate_from_transaction_list(&self, address: Address, records: &[RawTransaction]) -> usize {
        self.loaded.insert(address);

        let mut inserted = 0;
        for raw in records {
            match MoneyTransaction::try_from(raw) {
                Ok(tx) => {
                    if self.put(tx) {
                        inserted += 1;
                    }
                }
                Err(e) => warn!(
                    address = %to_hex(address),
                    hash = ?raw.hash,
                    error = %e,
                    "skipping malformed transaction record"
                ),
            }
        }

        debug!(
            address = %to_hex(address),
            records = records.len(),
            inserted = inserted,
            cached = self.len(),
            "transaction cache populated"
        );
        inserted
    }

    /// Whether `address`'s normal transactions were already loaded this run.
    pub fn is_loaded(&self, address: &Address) -> bool {
        self.loaded.contains(address)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}
