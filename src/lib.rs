//! NFT trading metrics for wallets, reconstructed from an
//! Etherscan-compatible explorer API.
//!
//! `main.rs` wires these together; the modules are public so the
//! reconciliation core can be driven against any `ExplorerApi`.

pub mod addresses;
pub mod config;
pub mod explorer;
pub mod ledger;
pub mod report;
