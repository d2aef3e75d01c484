pub mod cache;
pub mod nft;
pub mod reconciler;

pub use cache::TransactionCache;
pub use nft::{ClassificationRules, Nft, NftError, NftKey, NftStatus};
pub use reconciler::{AddressLedger, AddressReconciler, LedgerStats, ReconcileError};
