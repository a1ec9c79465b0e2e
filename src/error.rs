//! Error taxonomy for the analysis pipeline.
//!
//! Three classes of failure exist at the library boundary:
//! - `ValidationError`: bad request parameters, rejected before any fetch.
//! - `FetchError`: a provider call that failed after bounded retries.
//! - `AnalyzeError`: the union surfaced by [`crate::analyze::Analyzer`].
//!
//! Computation degeneracies (zero variance, too-small groups) are not errors;
//! every statistic carries an `Option` sentinel instead.

use chrono::NaiveDate;
use thiserror::Error;

/// Request validation failures. Never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("invalid ticker symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("date range is inverted: {start} is after {end}")]
    InvertedDateRange { start: NaiveDate, end: NaiveDate },

    #[error("unsupported rolling window {0} (expected 7, 14, or 30)")]
    UnsupportedWindow(usize),

    #[error("latitude {0} outside [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// A provider fetch that failed after retries were exhausted.
///
/// `Clone` so the cache can hand the same failure to every coalesced waiter.
#[derive(Debug, Clone, Error)]
#[error("{provider}: fetch failed after {attempts} attempt(s): {cause}")]
pub struct FetchError {
    pub provider: String,
    pub attempts: u32,
    pub cause: String,
}

impl FetchError {
    pub fn new(provider: impl Into<String>, attempts: u32, cause: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            attempts,
            cause: cause.into(),
        }
    }

    /// The in-flight fetch this caller was waiting on went away without an
    /// outcome (leader cancelled). The key is immediately retryable.
    pub fn aborted(key: &str) -> Self {
        Self::new(key, 0, "in-flight fetch was abandoned before completing")
    }
}

/// Everything `analyze` can fail with.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The pipeline could not produce any statistic at all, e.g. the price
    /// and lunar series share no calendar dates.
    #[error("computation failed: {0}")]
    Computation(String),

    /// A newer request was issued while this one was in flight; its result
    /// must not reach a now-stale consumer.
    #[error("request superseded by a newer analysis")]
    Superseded,
}
