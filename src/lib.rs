//! lunacorr: stock-return x lunar-phase correlation analysis.
//!
//! The pipeline takes a ticker symbol, a date range, a rolling-volatility
//! window, and an observer location, and produces an [`AnalysisResult`]:
//! per-day aligned records with derived metrics, correlation estimates with
//! two-tailed p-values, per-phase aggregates, a full-moon volatility test,
//! return anomalies, and a template-bound set of narrative insights.
//!
//! Providers are trait objects ([`MarketDataProvider`], [`AstronomyProvider`]);
//! the crate supplies the caching, retry, alignment, and statistics in front
//! of them. Entry point: [`Analyzer::analyze`].

pub mod align;
pub mod analyze;
pub mod cache;
pub mod error;
pub mod insight;
pub mod metrics;
pub mod model;
pub mod retry;
pub mod source;
pub mod stats;
pub mod validate;

pub use analyze::{AnalysisConfig, AnalysisRequest, Analyzer, Location, Session};
pub use error::{AnalyzeError, FetchError, ValidationError};
pub use insight::{InsightKind, Significance};
pub use model::{
    AlignedRecord, AnalysisResult, AnomalyEvent, Correlation, CorrelationPair,
    CorrelationSummary, EffectSize, MoonPhase, PhaseMetric, RawLunarPoint, RawPricePoint,
    VolatilityTest,
};
pub use source::{AstronomyProvider, DataSource, MarketDataProvider, SourceConfig};
