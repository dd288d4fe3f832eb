// =============================================================================
// Endpoint Pool — hides upstream endpoint volatility behind a single `fetch`
// =============================================================================
//
// Maintains an ordered list of functionally equivalent base URLs and a
// current-index cursor. A response classified as geo-block (403/451) or
// rate-limit (429/418) advances the cursor (mod pool size) and the request is
// retried against the next base URL. Any other error propagates to the
// caller. Transient network errors are not retried here — the scheduler's
// next tick retries the whole cycle.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use crate::error::PoolError;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

fn is_geo_block_or_rate_limit(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::FORBIDDEN
            | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::IM_A_TEAPOT
    )
}

/// Rotates across functionally equivalent upstream base URLs on
/// geo-block/rate-limit, mutated only by its own failover logic.
pub struct EndpointPool {
    base_urls: Vec<String>,
    cursor: AtomicUsize,
    client: reqwest::Client,
}

impl EndpointPool {
    pub fn new(base_urls: Vec<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_urls,
            cursor: AtomicUsize::new(0),
            client,
        }
    }

    /// Index of the base URL the next call will start from. Readers tolerate
    /// a stale value — only the failover path in [`Self::fetch`] mutates it.
    pub fn current_index(&self) -> usize {
        self.cursor.load(Ordering::Relaxed) % self.base_urls.len()
    }

    fn advance_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.base_urls.len()
    }

    /// GET `{base}{path}?{query}` against the pool, starting from the
    /// current cursor. On geo-block/rate-limit, advances the cursor and
    /// tries the next base URL. Fails with
    /// [`PoolError::AllEndpointsUnavailable`] if every endpoint in one
    /// round-trip is geo-blocked or rate-limited.
    #[instrument(skip(self, query), fields(path))]
    pub async fn fetch(&self, path: &str, query: &str) -> Result<bytes::Bytes, PoolError> {
        let n = self.base_urls.len();
        let start = self.current_index();

        for attempt in 0..n {
            let idx = (start + attempt) % n;
            let base = &self.base_urls[idx];
            let url = if query.is_empty() {
                format!("{base}{path}")
            } else {
                format!("{base}{path}?{query}")
            };

            let resp = match self.client.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url, error = %e, "transient network error, not retrying within this call");
                    return Err(PoolError::Transport(anyhow::anyhow!(e).context(format!(
                        "GET {url} failed"
                    ))));
                }
            };

            let status = resp.status();
            if is_geo_block_or_rate_limit(status) {
                warn!(url, %status, "endpoint geo-blocked/rate-limited, rotating cursor");
                self.advance_cursor();
                continue;
            }

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(PoolError::Transport(anyhow::anyhow!(
                    "GET {url} returned {status}: {body}"
                )));
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| PoolError::Transport(anyhow::anyhow!(e).context("reading response body")))?;

            debug!(url, %status, "endpoint fetch succeeded");
            return Ok(bytes);
        }

        Err(PoolError::AllEndpointsUnavailable(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    async fn spawn_server(status: StatusCode, body: &'static str) -> String {
        let counter = Arc::new(StdAtomicUsize::new(0));
        let app = Router::new().route(
            "/ping",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (status, body)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetch_succeeds_against_healthy_endpoint() {
        let base = spawn_server(StatusCode::OK, "ok-body").await;
        let pool = EndpointPool::new(vec![base], 5);
        let result = pool.fetch("/ping", "").await.unwrap();
        assert_eq!(result.as_ref(), b"ok-body");
    }

    #[tokio::test]
    async fn all_endpoints_geo_blocked_raises_all_endpoints_unavailable() {
        let a = spawn_server(StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS, "blocked").await;
        let b = spawn_server(StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS, "blocked").await;
        let pool = EndpointPool::new(vec![a, b], 5);
        let err = pool.fetch("/ping", "").await.unwrap_err();
        assert!(matches!(err, PoolError::AllEndpointsUnavailable(2)));
    }

    #[tokio::test]
    async fn failover_advances_cursor_past_blocked_endpoints() {
        let a = spawn_server(StatusCode::FORBIDDEN, "blocked").await;
        let b = spawn_server(StatusCode::FORBIDDEN, "blocked").await;
        let c = spawn_server(StatusCode::OK, "healthy").await;
        let d = spawn_server(StatusCode::OK, "healthy").await;
        let pool = EndpointPool::new(vec![a, b, c, d], 5);

        let result = pool.fetch("/ping", "").await.unwrap();
        assert_eq!(result.as_ref(), b"healthy");
        assert!(pool.current_index() >= 2);

        // Subsequent call starts from the new cursor, skipping the blocked pair.
        let result2 = pool.fetch("/ping", "").await.unwrap();
        assert_eq!(result2.as_ref(), b"healthy");
    }
}
