//! Core data model: raw provider points, the aligned record, and the
//! immutable analysis result returned to the presentation layer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One trading day of OHLCV data as delivered by the market-data provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPricePoint {
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// One calendar day of lunar data as delivered by the astronomy provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLunarPoint {
    pub date: DateTime<Utc>,
    /// Percentage of the visible surface lit, 0-100.
    pub illumination: f64,
    /// True between new moon and full moon.
    pub waxing: bool,
}

/// 8-bucket lunar cycle classification, codes 0-7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoonPhase {
    New,
    WaxingCrescent,
    FirstQuarter,
    WaxingGibbous,
    Full,
    WaningGibbous,
    LastQuarter,
    WaningCrescent,
}

pub const ALL_PHASES: [MoonPhase; 8] = [
    MoonPhase::New,
    MoonPhase::WaxingCrescent,
    MoonPhase::FirstQuarter,
    MoonPhase::WaxingGibbous,
    MoonPhase::Full,
    MoonPhase::WaningGibbous,
    MoonPhase::LastQuarter,
    MoonPhase::WaningCrescent,
];

impl MoonPhase {
    pub fn code(self) -> u8 {
        match self {
            MoonPhase::New => 0,
            MoonPhase::WaxingCrescent => 1,
            MoonPhase::FirstQuarter => 2,
            MoonPhase::WaxingGibbous => 3,
            MoonPhase::Full => 4,
            MoonPhase::WaningGibbous => 5,
            MoonPhase::LastQuarter => 6,
            MoonPhase::WaningCrescent => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        ALL_PHASES.get(code as usize).copied()
    }

    /// Classify from illumination percentage and the waxing flag.
    ///
    /// Boundary table: the 0-100 range splits at 12.5 / 37.5 / 62.5 / 87.5,
    /// with the waxing flag disambiguating the symmetric middle buckets
    /// (50% waxing = First Quarter, 50% waning = Last Quarter).
    pub fn classify(illumination: f64, waxing: bool) -> Self {
        let illum = illumination.clamp(0.0, 100.0);
        if illum <= 12.5 {
            MoonPhase::New
        } else if illum <= 37.5 {
            if waxing {
                MoonPhase::WaxingCrescent
            } else {
                MoonPhase::WaningCrescent
            }
        } else if illum <= 62.5 {
            if waxing {
                MoonPhase::FirstQuarter
            } else {
                MoonPhase::LastQuarter
            }
        } else if illum <= 87.5 {
            if waxing {
                MoonPhase::WaxingGibbous
            } else {
                MoonPhase::WaningGibbous
            }
        } else {
            MoonPhase::Full
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MoonPhase::New => "New Moon",
            MoonPhase::WaxingCrescent => "Waxing Crescent",
            MoonPhase::FirstQuarter => "First Quarter",
            MoonPhase::WaxingGibbous => "Waxing Gibbous",
            MoonPhase::Full => "Full Moon",
            MoonPhase::WaningGibbous => "Waning Gibbous",
            MoonPhase::LastQuarter => "Last Quarter",
            MoonPhase::WaningCrescent => "Waning Crescent",
        }
    }
}

/// One trading day with price and lunar data joined and all derived metrics
/// filled in. Created once by the aligner/metrics pair, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedRecord {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub illumination: f64,
    pub phase: MoonPhase,
    /// Signed calendar-day distance to the nearest full-moon event.
    /// Positive before the event, negative after.
    pub days_from_full_moon: i32,
    pub is_full_moon_window: bool,
    /// Fractional close-to-close change; None for the first record.
    pub daily_return: Option<f64>,
    pub abs_return: Option<f64>,
    /// Trailing sample stdev of daily returns; None until the window fills.
    pub rolling_volatility: Option<f64>,
}

/// A single correlation estimate over n non-null pairs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub r: f64,
    /// Two-tailed p-value from the t-distribution approximation.
    pub p_value: f64,
    pub n: usize,
    /// 95% confidence interval for r via the Fisher z-transform. Degrades to
    /// the full [-1, 1] interval when n is too small to bound it.
    pub ci_low: f64,
    pub ci_high: f64,
}

/// Pearson and Spearman estimates for one lunar metric vs daily returns.
/// `None` means not computable (fewer than 3 pairs or zero variance).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CorrelationPair {
    pub pearson: Option<Correlation>,
    pub spearman: Option<Correlation>,
}

/// Correlations of daily returns against each lunar metric.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CorrelationSummary {
    pub illumination: CorrelationPair,
    pub days_from_full_moon: CorrelationPair,
}

/// Aggregates for one of the eight moon phases. Metric fields are `None`
/// when the phase holds fewer samples than the configured minimum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetric {
    pub phase: MoonPhase,
    pub sample_count: usize,
    pub mean_volatility: Option<f64>,
    /// Percentage of days in this phase with a positive daily return.
    pub positive_day_pct: Option<f64>,
    pub mean_return: Option<f64>,
}

/// Conventional Cohen's d magnitude bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectSize {
    /// |d| < 0.2
    Negligible,
    /// 0.2 <= |d| < 0.5
    Small,
    /// 0.5 <= |d| < 0.8
    Medium,
    /// |d| >= 0.8
    Large,
}

impl EffectSize {
    pub fn from_d(d: f64) -> Self {
        match d.abs() {
            a if a < 0.2 => EffectSize::Negligible,
            a if a < 0.5 => EffectSize::Small,
            a if a < 0.8 => EffectSize::Medium,
            _ => EffectSize::Large,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EffectSize::Negligible => "negligible",
            EffectSize::Small => "small",
            EffectSize::Medium => "medium",
            EffectSize::Large => "large",
        }
    }
}

/// Two-sample t-test of rolling volatility inside vs outside the full-moon
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolatilityTest {
    pub full_moon_mean: f64,
    pub baseline_mean: f64,
    pub full_moon_n: usize,
    pub baseline_n: usize,
    pub t_statistic: f64,
    /// Two-tailed.
    pub p_value: f64,
    /// Cohen's d with pooled standard deviation.
    pub effect_size: f64,
    pub effect_size_band: EffectSize,
}

/// A day whose absolute return exceeded k x rolling volatility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub date: NaiveDate,
    pub daily_return: f64,
    pub abs_return: f64,
    /// The k x volatility bound the return exceeded.
    pub threshold: f64,
    pub phase: MoonPhase,
    pub illumination: f64,
    pub in_full_moon_window: bool,
}

/// Immutable result of one `analyze` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub rolling_window: usize,
    pub records: Vec<AlignedRecord>,
    pub correlations: CorrelationSummary,
    pub phase_metrics: Vec<PhaseMetric>,
    pub volatility_test: Option<VolatilityTest>,
    pub anomalies: Vec<AnomalyEvent>,
    pub insights: Vec<crate::insight::InsightKind>,
    /// Trading days dropped for lack of a lunar sample, plus duplicate-date
    /// conflicts in either input.
    pub alignment_gap_count: u32,
}
