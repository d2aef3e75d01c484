//! Run-level metrics folded from every reconciled wallet.

use crate::explorer::types::to_hex;
use crate::ledger::{AddressLedger, NftError, NftKey};
use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

/// Wei per native token (POL / ETH).
const WEI_PER_NATIVE: u64 = 1_000_000_000_000_000_000;

/// Decimal places shown for averages.
const DISPLAY_DP: u32 = 6;

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("nft {key} of wallet {} has no known status", to_hex(.wallet))]
    UnclassifiedNft { wallet: Address, key: NftKey },
    #[error(transparent)]
    Nft(#[from] NftError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub wallets: usize,
    pub governance_nfts: usize,
    pub purchases: usize,
    pub sales: usize,
    /// Wei received over all sales.
    pub revenue: U256,
    /// Wei paid over all purchases.
    pub cost: U256,
    /// Distinct addresses on the selling side of a sale.
    pub sellers: usize,
    /// Distinct addresses on the buying side of a purchase.
    pub buyers: usize,
}

impl MetricsSummary {
    /// Fold `ledgers` into totals. `wallet_count` is the number of wallets
    /// analysed, including those skipped for having no history.
    pub fn aggregate(wallet_count: usize, ledgers: &[AddressLedger]) -> Result<Self, AggregationError> {
        let mut summary = Self {
            wallets: wallet_count,
            ..Self::default()
        };
        let mut sellers: HashSet<Address> = HashSet::new();
        let mut buyers: HashSet<Address> = HashSet::new();

        for ledger in ledgers {
            for nft in ledger.nfts() {
                if nft.is_governance() {
                    summary.governance_nfts += 1;
                    continue;
                }
                if nft.ever_sold() {
                    summary.sales += nft.sale_count();
                    summary.revenue += nft.total_revenue();
                    sellers.extend(nft.seller_addresses());
                }
                if nft.ever_bought() {
                    summary.purchases += nft.purchase_count();
                    summary.cost += nft.total_cost();
                    buyers.extend(nft.buyer_addresses());
                }
                if !(nft.ever_sold() || nft.ever_bought() || nft.ever_created()?) {
                    return Err(AggregationError::UnclassifiedNft {
                        wallet: ledger.wallet(),
                        key: nft.key(),
                    });
                }
            }
        }

        summary.sellers = sellers.len();
        summary.buyers = buyers.len();
        Ok(summary)
    }

    /// Human-readable report, amounts in `native_symbol` units.
    pub fn render(&self, native_symbol: &str) -> String {
        let wallets = self.wallets;
        let revenue = wei_to_native(self.revenue);
        let cost = wei_to_native(self.cost);
        let mut out = String::new();

        // Writing to a String cannot fail.
        let _ = writeln!(out, "Total wallets: {wallets}");
        let _ = writeln!(out, "Number of sales+purchases: {}", self.sales + self.purchases);
        let _ = writeln!(
            out,
            "Average governance NFTs: {}/{wallets} = {}",
            self.governance_nfts,
            show(ratio(Some(Decimal::from(self.governance_nfts)), wallets))
        );
        let _ = writeln!(
            out,
            "Average times NFTs are bought: {}/{wallets} = {}",
            self.purchases,
            show(ratio(Some(Decimal::from(self.purchases)), wallets))
        );
        let _ = writeln!(
            out,
            "Average times NFTs are sold: {}/{wallets} = {}",
            self.sales,
            show(ratio(Some(Decimal::from(self.sales)), wallets))
        );
        let _ = writeln!(
            out,
            "Percentage sellers with at least one sale: {}/{wallets} = {}",
            self.sellers,
            show_percent(percentage(self.sellers, wallets))
        );
        let _ = writeln!(
            out,
            "Percentage buyers with at least one purchase: {}/{wallets} = {}",
            self.buyers,
            show_percent(percentage(self.buyers, wallets))
        );
        let _ = writeln!(
            out,
            "Sold NFTs: average revenues per wallet ({native_symbol}): {}/{wallets} = {}",
            show(revenue),
            show(ratio(revenue, wallets))
        );
        let _ = writeln!(
            out,
            "Sold NFTs: average revenues per NFT ({native_symbol}): {}/{} = {}",
            show(revenue),
            self.sales,
            show(ratio(revenue, self.sales))
        );
        let _ = writeln!(
            out,
            "Bought NFTs: average price per wallet ({native_symbol}): {}/{wallets} = {}",
            show(cost),
            show(ratio(cost, wallets))
        );
        let _ = write!(
            out,
            "Bought NFTs: average price per NFT ({native_symbol}): {}/{} = {}",
            show(cost),
            self.purchases,
            show(ratio(cost, self.purchases))
        );
        out
    }
}

/// Exact wei to native-unit conversion. `None` if the amount does not fit
/// a `Decimal`.
pub fn wei_to_native(wei: U256) -> Option<Decimal> {
    let unit = U256::from(WEI_PER_NATIVE);
    let whole = Decimal::from_str(&(wei / unit).to_string()).ok()?;
    let frac: u64 = (wei % unit).try_into().ok()?;
    whole
        .checked_add(Decimal::from_i128_with_scale(frac as i128, 18))
        .map(|d| d.normalize())
}

fn ratio(numerator: Option<Decimal>, denominator: usize) -> Option<Decimal> {
    if denominator == 0 {
        return None;
    }
    numerator?
        .checked_div(Decimal::from(denominator))
        .map(|d| d.round_dp(DISPLAY_DP).normalize())
}

fn percentage(count: usize, total: usize) -> Option<Decimal> {
    ratio(Some(Decimal::from(count) * Decimal::ONE_HUNDRED), total).map(|d| d.round_dp(2))
}

fn show(value: Option<Decimal>) -> String {
    value.map_or_else(|| "n/a".to_string(), |d| d.to_string())
}

fn show_percent(value: Option<Decimal>) -> String {
    value.map_or_else(|| "n/a".to_string(), |d| format!("{d}%"))
}
