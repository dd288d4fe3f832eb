// =============================================================================
// Domain errors — small, matchable variants for boundaries callers branch on
// =============================================================================
//
// Everything else in this codebase propagates via `anyhow::Result` with
// `.context(...)`, matching the teacher's HTTP-client style. These two
// variants exist because the scheduler and fetcher genuinely need to match
// on *which* failure occurred rather than just log and move on.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Every endpoint in the pool returned geo-block or rate-limit for this
    /// call, in a single round-trip starting from the current cursor.
    #[error("all {0} endpoint(s) returned geo-block or rate-limit responses")]
    AllEndpointsUnavailable(usize),

    /// A non-geo-block, non-rate-limit error from the last endpoint tried;
    /// wraps the underlying transport/parse error.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
