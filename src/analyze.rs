//! The analysis pipeline: validate, fetch, align, derive, test, narrate.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::align::align;
use crate::cache::{Clock, SystemClock};
use crate::error::AnalyzeError;
use crate::insight::{detect_anomalies, generate_insights, DEFAULT_ANOMALY_K};
use crate::metrics::{enrich, full_moon_dates};
use crate::model::AnalysisResult;
use crate::source::{AstronomyProvider, DataSource, MarketDataProvider, SourceConfig};
use crate::stats::{correlation_summary, phase_aggregates, volatility_test, MIN_PHASE_SAMPLES};
use crate::validate::{
    validate_date_range, validate_location, validate_symbol, validate_window,
};

/// Observer coordinates for the astronomy provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for Location {
    /// New York City, matching the exchange whose calendar the price data
    /// follows.
    fn default() -> Self {
        Self {
            latitude: 40.7128,
            longitude: -74.0060,
        }
    }
}

/// One analysis request as received from the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub rolling_window: usize,
    pub location: Location,
}

/// Pipeline tuning. `from_env` overrides the defaults from the environment,
/// falling back silently on anything absent or unparseable.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Multiplier on rolling volatility for anomaly detection.
    pub anomaly_k: f64,
    /// Fewest samples a phase needs before its aggregates are reported.
    pub min_phase_samples: usize,
    pub source: SourceConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            anomaly_k: DEFAULT_ANOMALY_K,
            min_phase_samples: MIN_PHASE_SAMPLES,
            source: SourceConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut source = defaults.source.clone();
        source.price_ttl = Duration::from_secs(env_or(
            "LUNACORR_PRICE_TTL_SECS",
            source.price_ttl.as_secs(),
        ));
        source.lunar_ttl = Duration::from_secs(env_or(
            "LUNACORR_LUNAR_TTL_SECS",
            source.lunar_ttl.as_secs(),
        ));
        source.call_timeout = Duration::from_secs(env_or(
            "LUNACORR_CALL_TIMEOUT_SECS",
            source.call_timeout.as_secs(),
        ));
        source.retry.max_retries = env_or("LUNACORR_MAX_RETRIES", source.retry.max_retries);

        Self {
            anomaly_k: env_or("LUNACORR_ANOMALY_K", defaults.anomaly_k),
            min_phase_samples: env_or("LUNACORR_MIN_PHASE_SAMPLES", defaults.min_phase_samples),
            source,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Owns the data source and runs the full pipeline. Cheap to share behind an
/// `Arc`; every method takes `&self`. Concurrent `analyze` calls are fully
/// independent apart from the shared cache; per-consumer last-request-wins
/// lives in [`Session`].
pub struct Analyzer {
    source: DataSource,
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(
        market: Arc<dyn MarketDataProvider>,
        astronomy: Arc<dyn AstronomyProvider>,
        config: AnalysisConfig,
    ) -> Self {
        Self::with_clock(market, astronomy, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        market: Arc<dyn MarketDataProvider>,
        astronomy: Arc<dyn AstronomyProvider>,
        clock: Arc<dyn Clock>,
        config: AnalysisConfig,
    ) -> Self {
        let source = DataSource::new(market, astronomy, clock, config.source.clone());
        Self { source, config }
    }

    pub fn data_source(&self) -> &DataSource {
        &self.source
    }

    /// Run the full pipeline for one request.
    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalyzeError> {
        let symbol = validate_symbol(&request.symbol)?;
        validate_date_range(request.start, request.end)?;
        validate_window(request.rolling_window)?;
        validate_location(request.location.latitude, request.location.longitude)?;

        info!(%symbol, start = %request.start, end = %request.end,
              window = request.rolling_window, "starting analysis");

        let (prices, lunar) = tokio::join!(
            self.source.prices(&symbol, request.start, request.end),
            self.source.lunar(
                request.location.latitude,
                request.location.longitude,
                request.start,
                request.end,
            ),
        );
        let prices = prices?;
        let lunar = lunar?;

        let (joined, gap_count) = align(&prices, &lunar);
        if joined.is_empty() {
            return Err(AnalyzeError::Computation(format!(
                "no overlapping dates between {} price rows and {} lunar rows",
                prices.len(),
                lunar.len()
            )));
        }

        // Events come from the raw lunar series so weekend peaks are kept.
        let events = full_moon_dates(&lunar);
        let records = enrich(&joined, request.rolling_window, &events);

        let correlations = correlation_summary(&records);
        let phase_metrics = phase_aggregates(&records, self.config.min_phase_samples);
        let volatility = volatility_test(&records);
        let anomalies = detect_anomalies(&records, self.config.anomaly_k);
        let insights = generate_insights(
            &records,
            gap_count,
            &correlations,
            &phase_metrics,
            volatility.as_ref(),
            &anomalies,
        );

        info!(%symbol, records = records.len(), gaps = gap_count,
              anomalies = anomalies.len(), "analysis complete");
        Ok(AnalysisResult {
            symbol,
            start: request.start,
            end: request.end,
            rolling_window: request.rolling_window,
            records,
            correlations,
            phase_metrics,
            volatility_test: volatility,
            anomalies,
            insights,
            alignment_gap_count: gap_count,
        })
    }
}

/// One consumer's view of the analyzer, with last-request-wins semantics:
/// issuing a new request through a session supersedes the session's own
/// in-flight one, which then returns [`AnalyzeError::Superseded`] instead of
/// a stale result. Other sessions and bare [`Analyzer::analyze`] calls are
/// unaffected, and the superseded request's fetches still land in the shared
/// cache for the successor to reuse.
pub struct Session {
    analyzer: Arc<Analyzer>,
    /// Monotone ticket counter; only the newest ticket's result is released.
    latest: AtomicU64,
}

impl Session {
    pub fn new(analyzer: Arc<Analyzer>) -> Self {
        Self {
            analyzer,
            latest: AtomicU64::new(0),
        }
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    /// Run the pipeline for this session's most recent request.
    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalyzeError> {
        let ticket = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.analyzer.analyze(request).await;
        if self.latest.load(Ordering::SeqCst) != ticket {
            debug!(ticket, "request superseded within its session");
            return Err(AnalyzeError::Superseded);
        }
        result
    }
}
