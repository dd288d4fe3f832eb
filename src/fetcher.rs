// =============================================================================
// Market Snapshot Fetcher — ticker + funding + open-interest join
// =============================================================================
//
// Pulls 24h tickers and the premium/funding index concurrently, joins them by
// symbol, filters to the configured quote asset, sorts by quote volume, then
// fetches open interest for the top-N in small parallel batches. A failure of
// every endpoint in the pool (or of the whole snapshot) yields an empty
// vector — logged, never raised to the scheduler.
// =============================================================================

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::endpoint_pool::EndpointPool;
use crate::types::SymbolObservation;

#[derive(Debug, Deserialize)]
struct Ticker24hr {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "priceChange")]
    price_change: String,
    #[serde(rename = "priceChangePercent")]
    price_change_percent: String,
    volume: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
    #[serde(rename = "highPrice")]
    high_price: String,
    #[serde(rename = "lowPrice")]
    low_price: String,
    count: u64,
    #[serde(rename = "takerBuyBaseAssetVolume")]
    taker_buy_base_asset_volume: String,
}

#[derive(Debug, Deserialize)]
struct PremiumIndexEntry {
    symbol: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: i64,
}

#[derive(Debug, Deserialize)]
struct OpenInterestEntry {
    #[serde(rename = "openInterest")]
    open_interest: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeSymbolInfo {
    symbol: String,
    status: String,
    #[serde(rename = "contractType", default)]
    contract_type: String,
    #[serde(rename = "quoteAsset", default)]
    quote_asset: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeSymbolInfo>,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

/// Produces a `MarketObservation[]` snapshot per invocation using the
/// endpoint pool; retains no state across invocations.
pub struct MarketSnapshotFetcher {
    pool: EndpointPool,
    quote_asset: String,
    top_n: usize,
    batch_size: usize,
    batch_delay_ms: u64,
}

impl MarketSnapshotFetcher {
    pub fn new(config: &Config) -> Self {
        Self {
            pool: EndpointPool::new(config.base_urls.clone(), config.request_timeout_secs),
            quote_asset: config.quote_asset.clone(),
            top_n: config.top_n_symbols,
            batch_size: config.oi_batch_size,
            batch_delay_ms: config.oi_batch_delay_ms,
        }
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    /// Full snapshot: non-empty on success, `[]` iff every endpoint failed
    /// (already logged at the point of failure).
    #[instrument(skip(self))]
    pub async fn snapshot(&self, now: i64) -> Vec<SymbolObservation> {
        let (tickers, premiums, perpetuals) = tokio::join!(
            self.fetch_tickers(),
            self.fetch_premium_index(),
            self.fetch_perpetual_usdt_symbols(),
        );

        let tickers = match tickers {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "24hr ticker fetch failed, snapshot aborted");
                return Vec::new();
            }
        };
        let premiums = match premiums {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "premium index fetch failed, snapshot aborted");
                return Vec::new();
            }
        };
        // exchangeInfo is best-effort: if it fails we fall back to the quote
        // asset naming convention (symbol ends with the quote asset) instead
        // of aborting the whole snapshot.
        let perpetuals = perpetuals.unwrap_or_default();

        let mut joined: Vec<(String, f64, f64, f64, f64, f64, f64, f64, f64, u64, f64, i64)> =
            Vec::new();

        for t in &tickers {
            if !self.is_eligible(&t.symbol, &perpetuals) {
                continue;
            }
            let Some(p) = premiums.get(&t.symbol) else {
                continue;
            };

            let price = parse_f64(&t.last_price);
            let volume = parse_f64(&t.volume);
            let taker_buy = parse_f64(&t.taker_buy_base_asset_volume);
            let cvd = taker_buy - (volume - taker_buy);

            joined.push((
                t.symbol.clone(),
                price,
                parse_f64(&t.price_change),
                parse_f64(&t.price_change_percent),
                volume,
                parse_f64(&t.quote_volume),
                p.last_funding_rate.parse().unwrap_or(0.0),
                parse_f64(&t.high_price),
                parse_f64(&t.low_price),
                t.count,
                cvd,
                p.next_funding_time,
            ));
        }

        joined.sort_by(|a, b| b.5.partial_cmp(&a.5).unwrap_or(std::cmp::Ordering::Equal));
        joined.truncate(self.top_n);

        let symbols: Vec<String> = joined.iter().map(|j| j.0.clone()).collect();
        let oi_by_symbol = self.fetch_open_interest_batched(&symbols).await;

        let mut observations = Vec::with_capacity(joined.len());
        for (symbol, price, chg, chg_pct, volume, quote_volume, funding_rate, high, low, trades, cvd, next_funding) in
            joined
        {
            // A failed OI fetch for this symbol means we have no real value
            // to report; fabricating 0.0 would inject a bogus outlier into
            // the symbol's permanent time series, so the symbol is dropped
            // from this cycle's snapshot entirely (§7 "skip the affected
            // symbol") rather than appended with a fake reading.
            let Some(open_interest) = oi_by_symbol.get(&symbol).copied() else {
                debug!(symbol, "dropping symbol from snapshot, open interest unavailable this cycle");
                continue;
            };
            observations.push(SymbolObservation {
                symbol,
                observation: crate::types::MarketObservation {
                    timestamp: now,
                    price,
                    price_change_24h: chg,
                    price_change_pct_24h: chg_pct,
                    volume,
                    quote_volume,
                    funding_rate,
                    open_interest,
                    open_interest_value: open_interest * price,
                    cvd,
                    high_24h: high,
                    low_24h: low,
                    trades_24h: trades,
                    next_funding_time: next_funding,
                },
            });
        }

        info!(count = observations.len(), "market snapshot built");
        observations
    }

    fn is_eligible(&self, symbol: &str, perpetuals: &HashMap<String, ()>) -> bool {
        if !symbol.ends_with(self.quote_asset.as_str()) {
            return false;
        }
        if perpetuals.is_empty() {
            // exchangeInfo unavailable this cycle: fall back to the naming
            // convention already checked above.
            return true;
        }
        perpetuals.contains_key(symbol)
    }

    async fn fetch_tickers(&self) -> anyhow::Result<Vec<Ticker24hr>> {
        let bytes = self.pool.fetch("/fapi/v1/ticker/24hr", "").await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn fetch_premium_index(&self) -> anyhow::Result<HashMap<String, PremiumIndexEntry>> {
        let bytes = self.pool.fetch("/fapi/v1/premiumIndex", "").await?;
        let entries: Vec<PremiumIndexEntry> = serde_json::from_slice(&bytes)?;
        Ok(entries.into_iter().map(|e| (e.symbol.clone(), e)).collect())
    }

    async fn fetch_perpetual_usdt_symbols(&self) -> anyhow::Result<HashMap<String, ()>> {
        let bytes = self.pool.fetch("/fapi/v1/exchangeInfo", "").await?;
        let info: ExchangeInfo = serde_json::from_slice(&bytes)?;
        Ok(info
            .symbols
            .into_iter()
            .filter(|s| {
                s.status == "TRADING"
                    && s.contract_type == "PERPETUAL"
                    && s.quote_asset == self.quote_asset
            })
            .map(|s| (s.symbol, ()))
            .collect())
    }

    /// Fetch OI for `symbols` in parallel batches of `batch_size`, sleeping
    /// `batch_delay_ms` between batches. A single symbol's failure is logged
    /// and the symbol is simply absent from the returned map — the caller
    /// drops it from this cycle's snapshot rather than substituting `0.0`.
    async fn fetch_open_interest_batched(&self, symbols: &[String]) -> HashMap<String, f64> {
        let mut result = HashMap::with_capacity(symbols.len());

        for chunk in symbols.chunks(self.batch_size.max(1)) {
            let futures = chunk.iter().map(|symbol| async move {
                let query = format!("symbol={symbol}");
                let res = self.pool.fetch("/fapi/v1/openInterest", &query).await;
                (symbol.clone(), res)
            });

            let results = futures_util::future::join_all(futures).await;
            for (symbol, res) in results {
                match res {
                    Ok(bytes) => match serde_json::from_slice::<OpenInterestEntry>(&bytes) {
                        Ok(entry) => {
                            result.insert(symbol, parse_f64(&entry.open_interest));
                        }
                        Err(e) => {
                            warn!(symbol, error = %e, "failed to parse open interest response");
                        }
                    },
                    Err(e) => {
                        debug!(symbol, error = %e, "open interest fetch failed, skipping symbol this cycle");
                    }
                }
            }

            if chunk.len() == self.batch_size.max(1) {
                tokio::time::sleep(std::time::Duration::from_millis(self.batch_delay_ms)).await;
            }
        }

        result
    }
}
