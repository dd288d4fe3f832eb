// =============================================================================
// Confluence Detector — turns time-series state into candidate alerts
// =============================================================================
//
// Stateless beyond the Time-Series Store: every call re-derives its inputs
// from the store and the current snapshot, evaluates the three setup
// templates in fixed order, and returns at most one candidate per symbol.
// Mirrors the teacher's `signals/weighted_score.rs` ladder-scoring shape —
// accumulate points, collect phrases, short-circuit on a failed gate.
// =============================================================================

use tracing::debug;

use crate::config::Config;
use crate::emitter::AlertEmitter;
use crate::timeseries::TimeSeriesStore;
use crate::types::{funding_apr, Alert, AlertPayload, Severity, SetupType, SymbolObservation};

const HOUR_MS: i64 = 3600 * 1000;
const FOUR_HOURS_MS: i64 = 4 * HOUR_MS;
const EIGHT_HOURS_MS: i64 = 8 * HOUR_MS;
const TWENTY_FOUR_HOURS_MS: i64 = 24 * HOUR_MS;

struct Ladder {
    score: i32,
    signals: Vec<String>,
}

impl Ladder {
    fn new() -> Self {
        Self {
            score: 0,
            signals: Vec::new(),
        }
    }

    fn add(&mut self, points: i32, phrase: impl Into<String>) {
        self.score += points;
        self.signals.push(phrase.into());
    }
}

/// Evaluates the three confluence templates against the Time-Series Store;
/// holds only configuration, no mutable state of its own.
pub struct ConfluenceDetector {
    min_volume_quote: f64,
    min_oi_value_quote: f64,
    liquidity_top_n: usize,
    score_threshold: i32,
}

impl ConfluenceDetector {
    pub fn new(config: &Config) -> Self {
        Self {
            min_volume_quote: config.min_volume_quote,
            min_oi_value_quote: config.min_oi_value_quote,
            liquidity_top_n: config.liquidity_top_n,
            score_threshold: config.score_threshold,
        }
    }

    /// One pass over the liquid universe; returns candidates sorted by score
    /// descending, symbol ascending on ties. Per §4.4, a symbol is skipped
    /// before the setup ladder runs if its cooldown is active or it lacks
    /// minimum history — `emitter` is consulted read-only for the former.
    pub fn evaluate(
        &self,
        observations: &[SymbolObservation],
        store: &TimeSeriesStore,
        emitter: &AlertEmitter,
        now: i64,
    ) -> Vec<Alert> {
        let mut liquid: Vec<&SymbolObservation> = observations
            .iter()
            .filter(|o| {
                o.observation.quote_volume > self.min_volume_quote
                    && o.observation.open_interest_value > self.min_oi_value_quote
            })
            .collect();

        liquid.sort_by(|a, b| {
            b.observation
                .open_interest_value
                .partial_cmp(&a.observation.open_interest_value)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        liquid.truncate(self.liquidity_top_n);

        let mut candidates = Vec::new();

        for obs in liquid {
            if emitter.is_cooldown_active(&obs.symbol, now) {
                debug!(symbol = %obs.symbol, "skipping symbol, cooldown active");
                continue;
            }

            if !store.has_minimum_history(&obs.symbol, now) {
                debug!(symbol = %obs.symbol, "skipping symbol, insufficient history");
                continue;
            }

            if let Some(alert) = self.evaluate_symbol(obs, store, now) {
                candidates.push(alert);
            }
        }

        candidates.sort_by(|a, b| {
            b.confluence_score
                .cmp(&a.confluence_score)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        candidates
    }

    fn evaluate_symbol(
        &self,
        obs: &SymbolObservation,
        store: &TimeSeriesStore,
        now: i64,
    ) -> Option<Alert> {
        self.short_squeeze(obs, store, now)
            .or_else(|| self.long_flush(obs, store, now))
            .or_else(|| self.capitulation_reversal(obs, store, now))
    }

    fn build_payload(&self, obs: &SymbolObservation, store: &TimeSeriesStore, now: i64) -> AlertPayload {
        let funding = obs.observation.funding_rate;
        AlertPayload {
            funding,
            funding_apr: funding_apr(funding),
            funding_percentile: store.percentile_of_funding(&obs.symbol, funding, now),
            oi_change_8hr: store.oi_change(&obs.symbol, now, EIGHT_HOURS_MS),
            vdelta_1hr: store.vdelta(&obs.symbol, now, HOUR_MS),
            price_change: store.price_change(&obs.symbol, now, HOUR_MS),
            volume_24h: obs.observation.volume,
        }
    }

    fn make_alert(
        &self,
        obs: &SymbolObservation,
        setup: SetupType,
        ladder: Ladder,
        title: String,
        description: String,
        store: &TimeSeriesStore,
        now: i64,
        force_critical: bool,
    ) -> Option<Alert> {
        if ladder.signals.len() < 3 || ladder.score < self.score_threshold {
            return None;
        }

        let score = ladder.score.min(100);
        let severity = if force_critical {
            Severity::Critical
        } else {
            Severity::from_score(score)
        };

        Some(Alert {
            id: Alert::make_id(&obs.symbol, setup, now),
            symbol: obs.symbol.clone(),
            setup_type: setup,
            severity,
            title,
            description,
            signals: ladder.signals,
            confluence_score: score,
            timestamp: now,
            payload: self.build_payload(obs, store, now),
        })
    }

    /// §4.4.1 — bottom-percentile funding, OI surge, bullish CVD divergence.
    fn short_squeeze(
        &self,
        obs: &SymbolObservation,
        store: &TimeSeriesStore,
        now: i64,
    ) -> Option<Alert> {
        let symbol = &obs.symbol;
        let funding_pct = store.percentile_of_funding(symbol, obs.observation.funding_rate, now);

        if funding_pct > 10.0 {
            return None;
        }

        let mut ladder = Ladder::new();
        ladder.add(30, format!("funding rate in bottom {:.1}% percentile", funding_pct));
        if funding_pct <= 5.0 {
            ladder.add(10, "funding rate in bottom 5% percentile");
        }

        let oi_change_8h = store.oi_change(symbol, now, EIGHT_HOURS_MS);
        if oi_change_8h > 5.0 {
            ladder.add(25, format!("open interest surged {:.1}% over 8h", oi_change_8h));
            if oi_change_8h > 10.0 {
                ladder.add(10, "open interest surge exceeds 10% over 8h");
            }
        }

        let price_change_1h = store.price_change(symbol, now, HOUR_MS);
        let vdelta_1h = store.vdelta(symbol, now, HOUR_MS);
        let vdelta_pct = if obs.observation.volume != 0.0 {
            vdelta_1h / obs.observation.volume * 100.0
        } else {
            0.0
        };
        if price_change_1h < 0.0 && vdelta_1h > 0.0 && vdelta_pct > 3.0 {
            ladder.add(25, format!("bullish CVD divergence against falling price ({:.1}%)", vdelta_pct));
            if vdelta_pct > 10.0 {
                ladder.add(10, "bullish CVD divergence exceeds 10%");
            }
        }

        let momentum = store.funding_momentum(symbol);
        if momentum < -0.00005 {
            ladder.add(10, "funding momentum falling");
        }

        self.make_alert(
            obs,
            SetupType::ShortSqueeze,
            ladder,
            format!("Short Squeeze setup on {symbol}"),
            format!(
                "{symbol} shows funding at the bottom {:.1}% percentile with open interest surging {:.1}% over 8h \
                 while CVD diverges bullishly against price — conditions consistent with a short squeeze.",
                funding_pct, oi_change_8h
            ),
            store,
            now,
            false,
        )
    }

    /// §4.4.2 — top-percentile funding, OI blow-off, bearish CVD divergence.
    fn long_flush(
        &self,
        obs: &SymbolObservation,
        store: &TimeSeriesStore,
        now: i64,
    ) -> Option<Alert> {
        let symbol = &obs.symbol;
        let funding_pct = store.percentile_of_funding(symbol, obs.observation.funding_rate, now);

        if funding_pct < 90.0 {
            return None;
        }

        let mut ladder = Ladder::new();
        ladder.add(30, format!("funding rate in top {:.1}% percentile", funding_pct));
        if funding_pct >= 95.0 {
            ladder.add(10, "funding rate in top 5% percentile");
        }

        let oi_stats = store.oi_stats(symbol, now, EIGHT_HOURS_MS);
        let current_oi_value = obs.observation.open_interest * obs.observation.price;
        let sigma_distance = if oi_stats.stddev != 0.0 {
            (current_oi_value - oi_stats.mean) / oi_stats.stddev
        } else {
            0.0
        };
        if current_oi_value > oi_stats.mean + oi_stats.stddev {
            ladder.add(25, format!("open interest {:.1}σ above its 8h mean", sigma_distance));
            if current_oi_value > oi_stats.mean + 2.0 * oi_stats.stddev {
                ladder.add(10, "open interest exceeds 2σ above its 8h mean");
            }
        }

        let price_change_1h = store.price_change(symbol, now, HOUR_MS);
        let vdelta_1h = store.vdelta(symbol, now, HOUR_MS);
        let vdelta_pct = if obs.observation.volume != 0.0 {
            vdelta_1h.abs() / obs.observation.volume * 100.0
        } else {
            0.0
        };
        if price_change_1h > 0.0 && vdelta_1h <= 0.0 && vdelta_pct > 3.0 {
            ladder.add(25, format!("bearish CVD divergence against rising price ({:.1}%)", vdelta_pct));
            if vdelta_pct > 10.0 {
                ladder.add(10, "bearish CVD divergence exceeds 10%");
            }
        }

        let momentum = store.funding_momentum(symbol);
        if momentum > 0.00005 {
            ladder.add(10, "funding momentum rising");
        }

        self.make_alert(
            obs,
            SetupType::LongFlush,
            ladder,
            format!("Long Flush setup on {symbol}"),
            format!(
                "{symbol} shows funding at the top {:.1}% percentile with open interest {:.1}σ above its 8h mean \
                 while CVD diverges bearishly against price — conditions consistent with a long flush.",
                funding_pct, sigma_distance
            ),
            store,
            now,
            false,
        )
    }

    /// §4.4.3 — sharp OI unwind, neutral funding, bullish CVD divergence on a
    /// deep drawdown. Always CRITICAL when emitted.
    fn capitulation_reversal(
        &self,
        obs: &SymbolObservation,
        store: &TimeSeriesStore,
        now: i64,
    ) -> Option<Alert> {
        let symbol = &obs.symbol;
        let oi_change_24h = store.oi_change(symbol, now, TWENTY_FOUR_HOURS_MS);

        if oi_change_24h >= -10.0 {
            return None;
        }

        let mut ladder = Ladder::new();
        ladder.add(30, format!("open interest unwound {:.1}% over 24h", oi_change_24h));
        if oi_change_24h < -20.0 {
            ladder.add(10, "open interest unwind exceeds 20% over 24h");
        }

        let momentum = store.funding_momentum(symbol);
        let funding_rate = obs.observation.funding_rate;
        if momentum.abs() < 0.00003 && funding_rate.abs() < 0.0003 {
            ladder.add(25, "funding has flattened to neutral");
        }

        let price_change_4h = store.price_change(symbol, now, FOUR_HOURS_MS);
        let vdelta_1h = store.vdelta(symbol, now, HOUR_MS);
        let vdelta_pct = if obs.observation.volume != 0.0 {
            vdelta_1h / obs.observation.volume * 100.0
        } else {
            0.0
        };
        if price_change_4h < -5.0 && vdelta_1h > 0.0 && vdelta_pct > 3.0 {
            ladder.add(30, format!("bullish CVD divergence on a {:.1}% 4h drawdown", price_change_4h));
            if vdelta_pct > 10.0 {
                ladder.add(15, "bullish CVD divergence exceeds 10%");
            }
        }

        self.make_alert(
            obs,
            SetupType::CapitulationReversal,
            ladder,
            format!("Capitulation Reversal setup on {symbol}"),
            format!(
                "{symbol} unwound {:.1}% of open interest over 24h with funding flattened to neutral and CVD \
                 diverging bullishly on a {:.1}% 4h drawdown — conditions consistent with capitulation reversal.",
                oi_change_24h, price_change_4h
            ),
            store,
            now,
            true,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_cooldown_emitter() -> AlertEmitter {
        AlertEmitter::new(4 * 3600, std::sync::Arc::new(parking_lot::RwLock::new(None)))
    }

    fn base_obs(symbol: &str, price: f64, volume: f64, quote_volume: f64, oi: f64, funding: f64) -> SymbolObservation {
        SymbolObservation {
            symbol: symbol.to_string(),
            observation: crate::types::MarketObservation {
                timestamp: 0,
                price,
                price_change_24h: 0.0,
                price_change_pct_24h: 0.0,
                volume,
                quote_volume,
                funding_rate: funding,
                open_interest: oi,
                open_interest_value: oi * price,
                cvd: 0.0,
                high_24h: price,
                low_24h: price,
                trades_24h: 1000,
                next_funding_time: 0,
            },
        }
    }

    fn seed_history(store: &TimeSeriesStore, symbol: &str, now: i64, funding_values: &[f64]) {
        // 8 days of hourly funding history so percentile + minimum-history gates pass.
        let start = now - 8 * 24 * HOUR_MS;
        for (i, rate) in funding_values.iter().enumerate() {
            store.append(
                symbol,
                crate::types::MarketObservation {
                    timestamp: start + i as i64 * HOUR_MS,
                    price: 100.0,
                    price_change_24h: 0.0,
                    price_change_pct_24h: 0.0,
                    volume: 1_000_000.0,
                    quote_volume: 100_000_000.0,
                    funding_rate: *rate,
                    open_interest: 1_000_000.0,
                    open_interest_value: 100_000_000.0,
                    cvd: 0.0,
                    high_24h: 100.0,
                    low_24h: 100.0,
                    trades_24h: 1000,
                    next_funding_time: start + i as i64 * HOUR_MS + 3600_000,
                },
            );
        }
    }

    #[test]
    fn short_squeeze_fires_with_bottom_percentile_funding_and_oi_surge() {
        let now = 20 * 24 * HOUR_MS;
        let store = TimeSeriesStore::new(30, 7, 10 * 60 * 1000);

        // 700 hourly funding readings ranked so the newest value lands near rank 3/700.
        let mut values: Vec<f64> = (0..700).map(|i| i as f64 * 0.00001).collect();
        let start = now - 700 * HOUR_MS;
        for (i, rate) in values.iter().enumerate() {
            store.append(
                "BTCUSDT",
                crate::types::MarketObservation {
                    timestamp: start + i as i64 * HOUR_MS,
                    price: 100.0,
                    price_change_24h: 0.0,
                    price_change_pct_24h: 0.0,
                    volume: 1_000_000.0,
                    quote_volume: 100_000_000.0,
                    funding_rate: *rate,
                    open_interest: 1_000_000.0,
                    open_interest_value: 100_000_000.0 * (1.0 + i as f64 * 0.00001),
                    cvd: i as f64 * 10.0,
                    high_24h: 100.0,
                    low_24h: 100.0,
                    trades_24h: 1000,
                    next_funding_time: 0,
                },
            );
        }
        // Price 1h ago lower OI baseline, now surged; price falling, CVD rising (bullish divergence).
        store.append(
            "BTCUSDT",
            crate::types::MarketObservation {
                timestamp: now - HOUR_MS,
                price: 101.0,
                price_change_24h: 0.0,
                price_change_pct_24h: 0.0,
                volume: 1_000_000.0,
                quote_volume: 100_000_000.0,
                funding_rate: 0.000003,
                open_interest: 1_000_000.0,
                open_interest_value: 100_000_000.0,
                cvd: 0.0,
                high_24h: 101.0,
                low_24h: 101.0,
                trades_24h: 1000,
                next_funding_time: 0,
            },
        );
        store.append(
            "BTCUSDT",
            crate::types::MarketObservation {
                timestamp: now,
                price: 100.0,
                price_change_24h: 0.0,
                price_change_pct_24h: 0.0,
                volume: 1_000_000.0,
                quote_volume: 100_000_000.0,
                funding_rate: 0.000003,
                open_interest: 1_125_000.0,
                open_interest_value: 112_500_000.0,
                cvd: 80_000.0,
                high_24h: 100.0,
                low_24h: 100.0,
                trades_24h: 1000,
                next_funding_time: 0,
            },
        );

        let obs = base_obs("BTCUSDT", 100.0, 1_000_000.0, 100_000_000.0, 1_125_000.0, 0.000003);

        let config = Config::default();
        let detector = ConfluenceDetector::new(&config);
        let alert = detector.short_squeeze(&obs, &store, now);
        assert!(alert.is_some());
        let alert = alert.unwrap();
        assert_eq!(alert.setup_type, SetupType::ShortSqueeze);
        assert!(alert.confluence_score >= 75);
        assert!(alert.signals.len() >= 3);
        let _ = values.pop();
    }

    #[test]
    fn insufficient_history_yields_no_candidates() {
        let now = 6 * 24 * HOUR_MS;
        let store = TimeSeriesStore::new(30, 7, 10 * 60 * 1000);
        seed_history(&store, "BTCUSDT", now, &[0.000001; 10]);
        let obs = base_obs("BTCUSDT", 100.0, 1_000_000.0, 100_000_000.0, 1_000_000.0, 0.0005);

        let config = Config::default();
        let detector = ConfluenceDetector::new(&config);
        let emitter = no_cooldown_emitter();
        let results = detector.evaluate(&[obs], &store, &emitter, now);
        assert!(results.is_empty());
    }

    #[test]
    fn capitulation_reversal_is_always_critical() {
        let now = 30 * 24 * HOUR_MS;
        let store = TimeSeriesStore::new(30, 7, 10 * 60 * 1000);

        store.append(
            "SOLUSDT",
            crate::types::MarketObservation {
                timestamp: now - 8 * 24 * HOUR_MS,
                price: 100.0,
                price_change_24h: 0.0,
                price_change_pct_24h: 0.0,
                volume: 1_000_000.0,
                quote_volume: 100_000_000.0,
                funding_rate: 0.0001,
                open_interest: 1_000_000.0,
                open_interest_value: 100_000_000.0,
                cvd: 0.0,
                high_24h: 100.0,
                low_24h: 100.0,
                trades_24h: 1000,
                next_funding_time: 0,
            },
        );
        store.append(
            "SOLUSDT",
            crate::types::MarketObservation {
                timestamp: now - TWENTY_FOUR_HOURS_MS,
                price: 110.0,
                price_change_24h: 0.0,
                price_change_pct_24h: 0.0,
                volume: 1_000_000.0,
                quote_volume: 100_000_000.0,
                funding_rate: 0.0001,
                open_interest: 1_282_000.0,
                open_interest_value: 141_020_000.0,
                cvd: 0.0,
                high_24h: 110.0,
                low_24h: 110.0,
                trades_24h: 1000,
                next_funding_time: 0,
            },
        );
        store.append(
            "SOLUSDT",
            crate::types::MarketObservation {
                timestamp: now - FOUR_HOURS_MS,
                price: 99.0,
                price_change_24h: 0.0,
                price_change_pct_24h: 0.0,
                volume: 1_000_000.0,
                quote_volume: 100_000_000.0,
                funding_rate: 0.0001,
                open_interest: 1_000_000.0,
                open_interest_value: 99_000_000.0,
                cvd: 0.0,
                high_24h: 99.0,
                low_24h: 99.0,
                trades_24h: 1000,
                next_funding_time: 0,
            },
        );
        store.append(
            "SOLUSDT",
            crate::types::MarketObservation {
                timestamp: now - HOUR_MS,
                price: 90.0,
                price_change_24h: 0.0,
                price_change_pct_24h: 0.0,
                volume: 1_000_000.0,
                quote_volume: 100_000_000.0,
                funding_rate: 0.0001,
                open_interest: 1_000_000.0,
                open_interest_value: 90_000_000.0,
                cvd: 0.0,
                high_24h: 90.0,
                low_24h: 90.0,
                trades_24h: 1000,
                next_funding_time: 0,
            },
        );
        store.append(
            "SOLUSDT",
            crate::types::MarketObservation {
                timestamp: now,
                price: 90.0,
                price_change_24h: 0.0,
                price_change_pct_24h: 0.0,
                volume: 1_000_000.0,
                quote_volume: 100_000_000.0,
                funding_rate: 0.0001,
                open_interest: 1_000_000.0,
                open_interest_value: 90_000_000.0,
                cvd: 110_000.0,
                high_24h: 90.0,
                low_24h: 90.0,
                trades_24h: 1000,
                next_funding_time: 0,
            },
        );

        let obs = base_obs("SOLUSDT", 90.0, 1_000_000.0, 100_000_000.0, 1_000_000.0, 0.0001);
        let config = Config::default();
        let detector = ConfluenceDetector::new(&config);
        let alert = detector.capitulation_reversal(&obs, &store, now);
        assert!(alert.is_some());
        assert_eq!(alert.unwrap().severity, Severity::Critical);
    }

    #[test]
    fn cooldown_active_symbol_is_skipped_before_scoring() {
        let now = 20 * 24 * HOUR_MS;
        let store = TimeSeriesStore::new(30, 7, 10 * 60 * 1000);
        seed_history(&store, "BTCUSDT", now, &[0.000001; 192]);
        let obs = base_obs("BTCUSDT", 100.0, 1_000_000.0, 100_000_000.0, 1_000_000.0, 0.0005);

        let config = Config::default();
        let detector = ConfluenceDetector::new(&config);
        let emitter = no_cooldown_emitter();
        emitter.seed_last_emit_for_test("BTCUSDT", now - 60_000);
        assert!(emitter.is_cooldown_active("BTCUSDT", now));

        let results = detector.evaluate(&[obs], &store, &emitter, now);
        assert!(results.is_empty(), "cooldown-active symbol must be skipped before scoring");
    }
}
