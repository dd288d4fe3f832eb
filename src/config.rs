// =============================================================================
// Configuration — resolved once from the process environment at startup
// =============================================================================
//
// Every tunable named in the spec's Configuration section lives here. Unlike
// the teacher's `runtime_config.rs`, this is not a hot-reloadable JSON file —
// the configuration *loader* is treated as an external collaborator, so this
// module's only job is to resolve `std::env::var` into a typed, defaulted
// struct once, at process start. `RuntimeConfig::load`'s fallback-to-default
// pattern (with a `warn!` on parse failure) is carried over verbatim.
// =============================================================================

use tracing::warn;

/// Upstream base URLs, tried in order, rotated on geo-block/rate-limit.
fn default_base_urls() -> Vec<String> {
    vec![
        "https://fapi.binance.com".to_string(),
        "https://fapi1.binance.com".to_string(),
        "https://fapi2.binance.com".to_string(),
        "https://fapi3.binance.com".to_string(),
    ]
}

/// Process-wide configuration, resolved once in `main` and handed to `Core`
/// as an owned value — not a global singleton.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Upstream ------------------------------------------------------
    pub base_urls: Vec<String>,
    pub quote_asset: String,
    pub top_n_symbols: usize,
    pub oi_batch_size: usize,
    pub oi_batch_delay_ms: u64,
    pub request_timeout_secs: u64,

    // --- Time-series store ----------------------------------------------
    pub lookback_days: i64,
    pub min_history_days: i64,
    pub point_in_past_tolerance_ms: i64,

    // --- Detector --------------------------------------------------------
    pub min_volume_quote: f64,
    pub min_oi_value_quote: f64,
    pub liquidity_top_n: usize,
    pub score_threshold: i32,

    // --- Emitter / retention ----------------------------------------------
    pub alert_cooldown_secs: i64,
    pub retention_hours: i64,

    // --- Scheduler ---------------------------------------------------------
    pub detect_interval_secs: u64,
    pub prune_interval_secs: u64,
    pub shutdown_grace_secs: u64,

    // --- HTTP server ---------------------------------------------------
    pub port: u16,
    pub frontend_url: Option<String>,

    // --- Persistence -----------------------------------------------------
    pub database_url: Option<String>,
    pub require_db_tls: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_urls: default_base_urls(),
            quote_asset: "USDT".to_string(),
            top_n_symbols: 50,
            oi_batch_size: 10,
            oi_batch_delay_ms: 100,
            request_timeout_secs: 10,

            lookback_days: 30,
            min_history_days: 7,
            point_in_past_tolerance_ms: 10 * 60 * 1000,

            min_volume_quote: 50_000_000.0,
            min_oi_value_quote: 10_000_000.0,
            liquidity_top_n: 20,
            score_threshold: 75,

            alert_cooldown_secs: 4 * 3600,
            retention_hours: 48,

            detect_interval_secs: 30,
            prune_interval_secs: 3600,
            shutdown_grace_secs: 5,

            port: 3001,
            frontend_url: None,

            database_url: None,
            require_db_tls: false,
        }
    }
}

impl Config {
    /// Resolve configuration from the process environment. Missing or
    /// unparsable optional values fall back to the default with a `warn!`;
    /// nothing here is a fatal misconfiguration except an explicitly invalid
    /// `DATABASE_URL` scheme, which is caught later at pool-connect time.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(raw) = std::env::var("AURORA_BASE_URLS") {
            let urls: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !urls.is_empty() {
                cfg.base_urls = urls;
            }
        }

        env_usize(&mut cfg.top_n_symbols, "TOP_N_SYMBOLS");
        env_usize(&mut cfg.oi_batch_size, "OI_BATCH_SIZE");
        env_u64(&mut cfg.oi_batch_delay_ms, "OI_BATCH_DELAY_MS");
        env_u64(&mut cfg.request_timeout_secs, "REQUEST_TIMEOUT_SECS");

        env_i64(&mut cfg.lookback_days, "LOOKBACK_DAYS");
        env_i64(&mut cfg.min_history_days, "MIN_HISTORY_DAYS");

        env_f64(&mut cfg.min_volume_quote, "MIN_VOLUME_QUOTE");
        env_f64(&mut cfg.min_oi_value_quote, "MIN_OI_VALUE_QUOTE");
        env_usize(&mut cfg.liquidity_top_n, "LIQUIDITY_TOP_N");
        env_i32(&mut cfg.score_threshold, "SCORE_THRESHOLD");

        env_i64(&mut cfg.alert_cooldown_secs, "ALERT_COOLDOWN_SECS");
        env_i64(&mut cfg.retention_hours, "RETENTION_HOURS");

        env_u64(&mut cfg.detect_interval_secs, "DETECT_INTERVAL_SECS");
        env_u64(&mut cfg.prune_interval_secs, "PRUNE_INTERVAL_SECS");
        env_u64(&mut cfg.shutdown_grace_secs, "SHUTDOWN_GRACE_SECS");

        if let Ok(raw) = std::env::var("PORT") {
            match raw.parse() {
                Ok(v) => cfg.port = v,
                Err(e) => warn!(error = %e, raw, "failed to parse PORT, using default"),
            }
        }

        cfg.frontend_url = std::env::var("FRONTEND_URL").ok();
        cfg.database_url = std::env::var("DATABASE_URL").ok();

        let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        cfg.require_db_tls = app_env.eq_ignore_ascii_case("production");

        cfg
    }
}

fn env_usize(slot: &mut usize, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(e) => warn!(error = %e, key, raw, "failed to parse env override, using default"),
        }
    }
}

fn env_u64(slot: &mut u64, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(e) => warn!(error = %e, key, raw, "failed to parse env override, using default"),
        }
    }
}

fn env_i64(slot: &mut i64, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(e) => warn!(error = %e, key, raw, "failed to parse env override, using default"),
        }
    }
}

fn env_i32(slot: &mut i32, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(e) => warn!(error = %e, key, raw, "failed to parse env override, using default"),
        }
    }
}

fn env_f64(slot: &mut f64, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(e) => warn!(error = %e, key, raw, "failed to parse env override, using default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.base_urls.len(), 4);
        assert_eq!(cfg.quote_asset, "USDT");
        assert_eq!(cfg.top_n_symbols, 50);
        assert_eq!(cfg.score_threshold, 75);
        assert_eq!(cfg.alert_cooldown_secs, 4 * 3600);
        assert_eq!(cfg.retention_hours, 48);
        assert_eq!(cfg.detect_interval_secs, 30);
        assert_eq!(cfg.prune_interval_secs, 3600);
        assert_eq!(cfg.port, 3001);
        assert!(!cfg.require_db_tls);
    }

    #[test]
    fn from_env_falls_back_to_defaults_when_unset() {
        std::env::remove_var("SCORE_THRESHOLD");
        std::env::remove_var("PORT");
        let cfg = Config::from_env();
        assert_eq!(cfg.score_threshold, 75);
        assert_eq!(cfg.port, 3001);
    }
}
