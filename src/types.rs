// =============================================================================
// Core data model — observations and alerts flowing through the pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// One per-symbol reading acquired in a single fetch cycle.
///
/// `symbol` and `timestamp` uniquely identify an observation within a
/// [`crate::timeseries::TimeSeriesStore`]; every numeric field is expected to
/// be finite, `volume` and `open_interest` non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketObservation {
    pub timestamp: i64,
    pub price: f64,
    pub price_change_24h: f64,
    pub price_change_pct_24h: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub funding_rate: f64,
    pub open_interest: f64,
    pub open_interest_value: f64,
    pub cvd: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub trades_24h: u64,
    pub next_funding_time: i64,
}

/// A [`MarketObservation`] paired with the symbol it describes — what the
/// fetcher produces and what callers append to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolObservation {
    pub symbol: String,
    #[serde(flatten)]
    pub observation: MarketObservation,
}

/// Which of the three confluence templates an alert belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetupType {
    ShortSqueeze,
    LongFlush,
    CapitulationReversal,
}

impl SetupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortSqueeze => "SHORT_SQUEEZE",
            Self::LongFlush => "LONG_FLUSH",
            Self::CapitulationReversal => "CAPITULATION_REVERSAL",
        }
    }
}

impl std::fmt::Display for SetupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SetupType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SHORT_SQUEEZE" => Ok(Self::ShortSqueeze),
            "LONG_FLUSH" => Ok(Self::LongFlush),
            "CAPITULATION_REVERSAL" => Ok(Self::CapitulationReversal),
            _ => Err(()),
        }
    }
}

/// Severity band derived from `confluence_score` (see [`Severity::from_score`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// `CRITICAL` iff score >= 90, `HIGH` for 75-89, `MEDIUM` for 50-74,
    /// else `LOW`. The detector only ever emits HIGH/CRITICAL (score >= 75),
    /// the lower bands exist for completeness of the type and for any
    /// future caller scoring below the emit threshold.
    pub fn from_score(score: i32) -> Self {
        if score >= 90 {
            Self::Critical
        } else if score >= 75 {
            Self::High
        } else if score >= 50 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(()),
        }
    }
}

/// Contributing numerics captured at emission time, kept alongside the
/// human-readable `signals` phrases so the alert is self-explanatory without
/// re-querying the time-series store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlertPayload {
    pub funding: f64,
    pub funding_apr: f64,
    pub funding_percentile: f64,
    pub oi_change_8hr: f64,
    pub vdelta_1hr: f64,
    pub price_change: f64,
    pub volume_24h: f64,
}

/// A confluence alert — the unit the emitter persists and the query surface
/// reads back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub symbol: String,
    pub setup_type: SetupType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub signals: Vec<String>,
    pub confluence_score: i32,
    pub timestamp: i64,
    pub payload: AlertPayload,
}

impl Alert {
    /// Deterministic id: `{symbol}-{setup}-{timestamp}`.
    pub fn make_id(symbol: &str, setup: SetupType, timestamp: i64) -> String {
        format!("{symbol}-{}-{timestamp}", setup.as_str())
    }
}

/// Funding rate annualised as a percent: `rate * 3 * 365 * 100`, assuming
/// three funding intervals per day.
pub fn funding_apr(rate: f64) -> f64 {
    rate * 3.0 * 365.0 * 100.0
}
