// =============================================================================
// Alert Store — durable persistence over `confluence_alerts`
// =============================================================================
//
// Thin wrapper around `sqlx::PgPool`. Every write is "insert, ignore on
// primary-key conflict" — never read-then-write — so a duplicate `submit`
// is a noop at the database layer, not just at the emitter's cooldown check.
// Connection errors at startup are logged and retried in the background by
// the scheduler; this module itself never panics on a connection failure.
// =============================================================================

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::Row;
use tracing::{info, instrument};

use crate::types::{Alert, AlertPayload, Severity, SetupType};

const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS confluence_alerts (
    id               TEXT PRIMARY KEY,
    symbol           TEXT NOT NULL,
    setup_type       TEXT NOT NULL,
    severity         TEXT NOT NULL,
    title            TEXT NOT NULL,
    description      TEXT NOT NULL,
    signals          JSONB NOT NULL,
    confluence_score INTEGER NOT NULL,
    timestamp        BIGINT NOT NULL,
    data             JSONB NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_confluence_alerts_symbol ON confluence_alerts (symbol);
CREATE INDEX IF NOT EXISTS idx_confluence_alerts_timestamp ON confluence_alerts (timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_confluence_alerts_severity ON confluence_alerts (severity);
CREATE INDEX IF NOT EXISTS idx_confluence_alerts_setup_type ON confluence_alerts (setup_type);
"#;

/// Aggregate counts for [`AlertStore::stats`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AlertStats {
    pub total_alerts: i64,
    pub by_severity: std::collections::HashMap<String, i64>,
    pub by_setup_type: std::collections::HashMap<String, i64>,
}

#[derive(Clone)]
pub struct AlertStore {
    pool: sqlx::PgPool,
}

impl AlertStore {
    /// Connects with TLS mode derived from `require_tls` (the spec's
    /// production/development split via `APP_ENV`) and runs the schema
    /// migration. Returns an error rather than panicking; the caller decides
    /// whether to retry in the background.
    pub async fn connect(database_url: &str, require_tls: bool) -> Result<Self> {
        let mut opts: PgConnectOptions = database_url
            .parse()
            .context("parsing DATABASE_URL")?;
        opts = opts.ssl_mode(if require_tls {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        });

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(opts)
            .await
            .context("connecting to persistent alert store")?;

        sqlx::query(MIGRATION_SQL)
            .execute(&pool)
            .await
            .context("running confluence_alerts schema migration")?;

        info!("connected to persistent alert store");
        Ok(Self { pool })
    }

    /// `INSERT ... ON CONFLICT (id) DO NOTHING`; returns whether a row was
    /// actually inserted (false means the id already existed).
    #[instrument(skip(self, alert), fields(symbol = %alert.symbol, id = %alert.id))]
    pub async fn insert(&self, alert: &Alert) -> Result<bool> {
        let signals_json = serde_json::to_value(&alert.signals)?;
        let data_json = serde_json::to_value(&alert.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO confluence_alerts
                (id, symbol, setup_type, severity, title, description, signals, confluence_score, timestamp, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.symbol)
        .bind(alert.setup_type.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.description)
        .bind(&signals_json)
        .bind(alert.confluence_score)
        .bind(alert.timestamp)
        .bind(&data_json)
        .execute(&self.pool)
        .await
        .context("inserting alert")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_all(&self, since: i64) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM confluence_alerts WHERE timestamp >= $1 ORDER BY timestamp DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("listing alerts")?;
        rows.iter().map(row_to_alert).collect()
    }

    pub async fn list_by_symbol(&self, symbol: &str, since: i64) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM confluence_alerts WHERE symbol = $1 AND timestamp >= $2 ORDER BY timestamp DESC",
        )
        .bind(symbol)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("listing alerts by symbol")?;
        rows.iter().map(row_to_alert).collect()
    }

    pub async fn list_by_severity(&self, severity: &str, since: i64) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM confluence_alerts WHERE severity = $1 AND timestamp >= $2 ORDER BY timestamp DESC",
        )
        .bind(severity)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("listing alerts by severity")?;
        rows.iter().map(row_to_alert).collect()
    }

    pub async fn stats(&self, since: i64) -> Result<AlertStats> {
        let rows = sqlx::query(
            "SELECT severity, setup_type FROM confluence_alerts WHERE timestamp >= $1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("computing alert stats")?;

        let mut stats = AlertStats {
            total_alerts: rows.len() as i64,
            ..Default::default()
        };
        for row in &rows {
            let severity: String = row.try_get("severity")?;
            let setup_type: String = row.try_get("setup_type")?;
            *stats.by_severity.entry(severity).or_insert(0) += 1;
            *stats.by_setup_type.entry(setup_type).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Deletes rows with `timestamp < now - retention`; returns the number
    /// of deleted rows.
    #[instrument(skip(self))]
    pub async fn prune(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM confluence_alerts WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("pruning expired alerts")?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "pruned expired alerts");
        }
        Ok(deleted)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_alert(row: &sqlx::postgres::PgRow) -> Result<Alert> {
    let setup_type: String = row.try_get("setup_type")?;
    let severity: String = row.try_get("severity")?;
    let signals: serde_json::Value = row.try_get("signals")?;
    let data: serde_json::Value = row.try_get("data")?;

    Ok(Alert {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        setup_type: setup_type.parse::<SetupType>().map_err(|_| {
            anyhow::anyhow!("unrecognised setup_type in database row: {setup_type}")
        })?,
        severity: severity
            .parse::<Severity>()
            .map_err(|_| anyhow::anyhow!("unrecognised severity in database row: {severity}"))?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        signals: serde_json::from_value(signals)?,
        confluence_score: row.try_get("confluence_score")?,
        timestamp: row.try_get("timestamp")?,
        payload: serde_json::from_value::<AlertPayload>(data)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_sql_creates_expected_table() {
        assert!(MIGRATION_SQL.contains("CREATE TABLE IF NOT EXISTS confluence_alerts"));
        assert!(MIGRATION_SQL.contains("PRIMARY KEY"));
    }
}
