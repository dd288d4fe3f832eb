// =============================================================================
// Alert Emitter — dedup, cooldown, and delegated persistence
// =============================================================================
//
// Exclusively owns `lastEmit`; the Store is treated as possibly absent (not
// yet connected, or dropped after a mid-flight failure) so the scheduler can
// keep running detection cycles while a background task reconnects. A
// persistence error never updates `lastEmit` — the next cycle gets another
// chance to persist the same candidate.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::store::AlertStore;
use crate::types::Alert;

pub struct AlertEmitter {
    cooldown_ms: i64,
    last_emit: RwLock<HashMap<String, i64>>,
    store: Arc<RwLock<Option<AlertStore>>>,
}

/// What happened to a candidate passed to [`AlertEmitter::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Persisted,
    CooldownActive,
    DuplicateId,
    StoreUnavailable,
    PersistenceError,
}

impl AlertEmitter {
    pub fn new(cooldown_secs: i64, store: Arc<RwLock<Option<AlertStore>>>) -> Self {
        Self {
            cooldown_ms: cooldown_secs * 1000,
            last_emit: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// §4.5 `submit`: cooldown check, persist, update `lastEmit` only on
    /// success. Never propagates a persistence error to the caller — the
    /// scheduler keeps running regardless.
    pub async fn submit(&self, candidate: Alert, now: i64) -> SubmitOutcome {
        {
            let last_emit = self.last_emit.read();
            if let Some(&last) = last_emit.get(&candidate.symbol) {
                if now - last < self.cooldown_ms {
                    debug!(symbol = %candidate.symbol, "alert suppressed by cooldown");
                    return SubmitOutcome::CooldownActive;
                }
            }
        }

        // `AlertStore` clones cheaply (its `PgPool` is `Arc`-backed), so the
        // handle is cloned out from under the lock before the await below —
        // `parking_lot::RwLockReadGuard` must not be held across an `.await`.
        let store = {
            let guard = self.store.read();
            guard.clone()
        };
        let Some(store) = store else {
            return SubmitOutcome::StoreUnavailable;
        };

        match store.insert(&candidate).await {
            Ok(true) => {
                self.last_emit.write().insert(candidate.symbol.clone(), now);
                SubmitOutcome::Persisted
            }
            Ok(false) => {
                debug!(id = %candidate.id, "duplicate alert id, ignored");
                SubmitOutcome::DuplicateId
            }
            Err(e) => {
                warn!(symbol = %candidate.symbol, error = %e, "failed to persist alert, cooldown not updated");
                SubmitOutcome::PersistenceError
            }
        }
    }

    pub fn last_emit_for(&self, symbol: &str) -> Option<i64> {
        self.last_emit.read().get(symbol).copied()
    }

    /// Whether `symbol` is still inside its cooldown window as of `now`.
    /// Lets the Detector skip scoring a symbol whose candidate would be
    /// thrown away by [`AlertEmitter::submit`] anyway (§4.4).
    pub fn is_cooldown_active(&self, symbol: &str, now: i64) -> bool {
        match self.last_emit_for(symbol) {
            Some(last) => now - last < self.cooldown_ms,
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn seed_last_emit_for_test(&self, symbol: &str, timestamp: i64) {
        self.last_emit.write().insert(symbol.to_string(), timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertPayload, Severity, SetupType};

    fn candidate(symbol: &str, timestamp: i64) -> Alert {
        Alert {
            id: Alert::make_id(symbol, SetupType::ShortSqueeze, timestamp),
            symbol: symbol.to_string(),
            setup_type: SetupType::ShortSqueeze,
            severity: Severity::High,
            title: "test".to_string(),
            description: "test".to_string(),
            signals: vec!["a".into(), "b".into(), "c".into()],
            confluence_score: 80,
            timestamp,
            payload: AlertPayload {
                funding: 0.0,
                funding_apr: 0.0,
                funding_percentile: 0.0,
                oi_change_8hr: 0.0,
                vdelta_1hr: 0.0,
                price_change: 0.0,
                volume_24h: 0.0,
            },
        }
    }

    #[tokio::test]
    async fn submit_drops_silently_when_store_unavailable() {
        let store = Arc::new(RwLock::new(None));
        let emitter = AlertEmitter::new(4 * 3600, store);
        let outcome = emitter.submit(candidate("BTCUSDT", 1000), 1000).await;
        assert_eq!(outcome, SubmitOutcome::StoreUnavailable);
        assert!(emitter.last_emit_for("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn cooldown_suppresses_second_submit_within_window() {
        let store = Arc::new(RwLock::new(None));
        let emitter = AlertEmitter::new(4 * 3600, store.clone());

        // Manually seed lastEmit by simulating a successful first submit's
        // bookkeeping effect, since no live Postgres is available in tests.
        emitter.last_emit.write().insert("BTCUSDT".to_string(), 0);

        let outcome = emitter.submit(candidate("BTCUSDT", 1000), 1000).await;
        assert_eq!(outcome, SubmitOutcome::CooldownActive);
    }

    #[tokio::test]
    async fn cooldown_elapsed_allows_retry_of_next_candidate() {
        let store = Arc::new(RwLock::new(None));
        let emitter = AlertEmitter::new(3600, store);
        emitter.last_emit.write().insert("BTCUSDT".to_string(), 0);

        // Past the 1h cooldown: falls through to the store-unavailable path,
        // not the cooldown path.
        let outcome = emitter.submit(candidate("BTCUSDT", 3_600_001), 3_600_001).await;
        assert_eq!(outcome, SubmitOutcome::StoreUnavailable);
    }

    #[test]
    fn is_cooldown_active_reflects_last_emit_window() {
        let store = Arc::new(RwLock::new(None));
        let emitter = AlertEmitter::new(3600, store);
        assert!(!emitter.is_cooldown_active("BTCUSDT", 0));

        emitter.last_emit.write().insert("BTCUSDT".to_string(), 0);
        assert!(emitter.is_cooldown_active("BTCUSDT", 1000));
        assert!(!emitter.is_cooldown_active("BTCUSDT", 3_600_001));
    }
}
