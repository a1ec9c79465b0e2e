//! Anomaly detection and the narrative insight layer.
//!
//! Insights are a closed set of template-rendered findings. Every claim of
//! statistical significance is gated on the p-value of the statistic it
//! reports, so the narrative can never outrun the numbers.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::model::{
    AlignedRecord, AnomalyEvent, Correlation, CorrelationSummary, EffectSize, PhaseMetric,
    VolatilityTest,
};

/// Multiplier on rolling volatility above which a day's absolute return is
/// anomalous.
pub const DEFAULT_ANOMALY_K: f64 = 2.0;

/// Fewest anomalies before clustering is worth reporting.
const MIN_CLUSTER_ANOMALIES: usize = 3;

/// Observed in-window anomaly fraction must be at least this multiple of the
/// expected fraction to count as clustering.
const CLUSTER_RATIO: f64 = 2.0;

/// Two-tier significance gate applied to every p-value-bearing insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    /// p < 0.05
    Significant,
    /// 0.05 <= p < 0.10
    Suggestive,
    NotSignificant,
}

impl Significance {
    pub fn from_p(p: f64) -> Self {
        if p < 0.05 {
            Significance::Significant
        } else if p < 0.10 {
            Significance::Suggestive
        } else {
            Significance::NotSignificant
        }
    }
}

/// Which lunar metric a correlation insight refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationTarget {
    Illumination,
    DaysFromFullMoon,
}

impl CorrelationTarget {
    fn label(self) -> &'static str {
        match self {
            CorrelationTarget::Illumination => "moon illumination",
            CorrelationTarget::DaysFromFullMoon => "days from full moon",
        }
    }
}

/// The closed set of findings the engine can report. Rendering lives in the
/// `Display` impl; consumers that want structure read the fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InsightKind {
    DataCoverage {
        aligned_days: usize,
        gap_count: u32,
    },
    Correlation {
        target: CorrelationTarget,
        r: f64,
        p_value: f64,
        significance: Significance,
    },
    CorrelationUnavailable {
        target: CorrelationTarget,
    },
    PhaseVolatilityExtremes {
        calmest: String,
        calmest_volatility: f64,
        most_volatile: String,
        most_volatile_volatility: f64,
    },
    FullMoonVolatility {
        full_moon_mean: f64,
        baseline_mean: f64,
        p_value: f64,
        effect_size: f64,
        significance: Significance,
    },
    FullMoonVolatilityUnavailable,
    AnomalyClustering {
        anomaly_count: usize,
        in_window_count: usize,
        observed_fraction: f64,
        expected_fraction: f64,
    },
}

impl fmt::Display for InsightKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsightKind::DataCoverage {
                aligned_days,
                gap_count,
            } => write!(
                f,
                "Analyzed {aligned_days} aligned trading days ({gap_count} alignment gaps)."
            ),
            InsightKind::Correlation {
                target,
                r,
                p_value,
                significance,
            } => {
                let strength = match r.abs() {
                    a if a >= 0.5 => "strong",
                    a if a >= 0.3 => "moderate",
                    a if a >= 0.1 => "weak",
                    _ => "negligible",
                };
                let direction = if *r >= 0.0 { "positive" } else { "negative" };
                let verdict = match significance {
                    Significance::Significant => "statistically significant",
                    Significance::Suggestive => "suggestive but not significant",
                    Significance::NotSignificant => "not statistically significant",
                };
                write!(
                    f,
                    "{} {} correlation between {} and daily returns \
                     (r = {:.3}, p = {:.3}); {}.",
                    strength_title(strength),
                    direction,
                    target.label(),
                    r,
                    p_value,
                    verdict
                )
            }
            InsightKind::CorrelationUnavailable { target } => write!(
                f,
                "Correlation between {} and daily returns could not be computed \
                 (too few usable days or a degenerate series).",
                target.label()
            ),
            InsightKind::PhaseVolatilityExtremes {
                calmest,
                calmest_volatility,
                most_volatile,
                most_volatile_volatility,
            } => write!(
                f,
                "Volatility peaked during {} ({:.4}) and bottomed during {} ({:.4}).",
                most_volatile, most_volatile_volatility, calmest, calmest_volatility
            ),
            InsightKind::FullMoonVolatility {
                full_moon_mean,
                baseline_mean,
                p_value,
                effect_size,
                significance,
            } => {
                let comparative = if full_moon_mean > baseline_mean {
                    "higher"
                } else {
                    "lower"
                };
                let verdict = match significance {
                    Significance::Significant => "the difference is statistically significant",
                    Significance::Suggestive => "the difference is suggestive but not significant",
                    Significance::NotSignificant => {
                        "the difference is not statistically significant"
                    }
                };
                write!(
                    f,
                    "Volatility near full moons was {} than baseline \
                     ({:.4} vs {:.4}, p = {:.3}, d = {:.2}, {} effect); {}.",
                    comparative,
                    full_moon_mean,
                    baseline_mean,
                    p_value,
                    effect_size,
                    EffectSize::from_d(*effect_size).label(),
                    verdict
                )
            }
            InsightKind::FullMoonVolatilityUnavailable => write!(
                f,
                "Full-moon volatility comparison unavailable: too few days in one of the groups."
            ),
            InsightKind::AnomalyClustering {
                anomaly_count,
                in_window_count,
                observed_fraction,
                expected_fraction,
            } => write!(
                f,
                "{} of {} anomalous days fell inside the full-moon window \
                 ({:.0}% observed vs {:.0}% expected).",
                in_window_count,
                anomaly_count,
                observed_fraction * 100.0,
                expected_fraction * 100.0
            ),
        }
    }
}

fn strength_title(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    if let Some(first) = chars.next() {
        out.extend(first.to_uppercase());
    }
    out.push_str(chars.as_str());
    out
}

/// Days whose absolute return exceeded `k` times that day's rolling
/// volatility. Days without a defined return or a positive volatility are
/// skipped. Sorted by absolute return, largest first.
pub fn detect_anomalies(records: &[AlignedRecord], k: f64) -> Vec<AnomalyEvent> {
    let mut events: Vec<AnomalyEvent> = records
        .iter()
        .filter_map(|record| {
            let ret = record.daily_return?;
            let abs = record.abs_return?;
            let vol = record.rolling_volatility?;
            if vol <= 0.0 {
                return None;
            }
            let threshold = k * vol;
            (abs > threshold).then(|| AnomalyEvent {
                date: record.date,
                daily_return: ret,
                abs_return: abs,
                threshold,
                phase: record.phase,
                illumination: record.illumination,
                in_full_moon_window: record.is_full_moon_window,
            })
        })
        .collect();

    events.sort_by(|a, b| {
        b.abs_return
            .partial_cmp(&a.abs_return)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    debug!(anomalies = events.len(), "detected return anomalies");
    events
}

/// Check whether anomalies cluster inside the full-moon window: the observed
/// in-window fraction must be at least twice the expected fraction (the share
/// of all eligible days that are in-window). None when there are too few
/// anomalies or no in-window days at all.
fn clustering(records: &[AlignedRecord], anomalies: &[AnomalyEvent]) -> Option<InsightKind> {
    if anomalies.len() < MIN_CLUSTER_ANOMALIES {
        return None;
    }

    let eligible: Vec<&AlignedRecord> = records
        .iter()
        .filter(|r| r.daily_return.is_some() && r.rolling_volatility.is_some())
        .collect();
    if eligible.is_empty() {
        return None;
    }

    let expected_fraction = eligible.iter().filter(|r| r.is_full_moon_window).count() as f64
        / eligible.len() as f64;
    if expected_fraction <= 0.0 {
        return None;
    }

    let in_window_count = anomalies.iter().filter(|a| a.in_full_moon_window).count();
    let observed_fraction = in_window_count as f64 / anomalies.len() as f64;
    if observed_fraction < CLUSTER_RATIO * expected_fraction {
        return None;
    }

    Some(InsightKind::AnomalyClustering {
        anomaly_count: anomalies.len(),
        in_window_count,
        observed_fraction,
        expected_fraction,
    })
}

fn correlation_insight(target: CorrelationTarget, estimate: Option<Correlation>) -> InsightKind {
    match estimate {
        Some(c) => InsightKind::Correlation {
            target,
            r: c.r,
            p_value: c.p_value,
            significance: Significance::from_p(c.p_value),
        },
        None => InsightKind::CorrelationUnavailable { target },
    }
}

fn phase_extremes(phase_metrics: &[PhaseMetric]) -> Option<InsightKind> {
    let reported: Vec<(&PhaseMetric, f64)> = phase_metrics
        .iter()
        .filter_map(|m| m.mean_volatility.map(|v| (m, v)))
        .collect();
    if reported.len() < 2 {
        return None;
    }

    let calmest = reported
        .iter()
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    let most_volatile = reported
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    if calmest.0.phase == most_volatile.0.phase {
        return None;
    }

    Some(InsightKind::PhaseVolatilityExtremes {
        calmest: calmest.0.phase.name().to_string(),
        calmest_volatility: calmest.1,
        most_volatile: most_volatile.0.phase.name().to_string(),
        most_volatile_volatility: most_volatile.1,
    })
}

/// Assemble the insight list from the computed statistics. Order is stable:
/// coverage, correlations, phase extremes, full-moon test, clustering.
pub fn generate_insights(
    records: &[AlignedRecord],
    gap_count: u32,
    correlations: &CorrelationSummary,
    phase_metrics: &[PhaseMetric],
    volatility_test: Option<&VolatilityTest>,
    anomalies: &[AnomalyEvent],
) -> Vec<InsightKind> {
    let mut insights = vec![InsightKind::DataCoverage {
        aligned_days: records.len(),
        gap_count,
    }];

    insights.push(correlation_insight(
        CorrelationTarget::Illumination,
        correlations.illumination.pearson,
    ));
    insights.push(correlation_insight(
        CorrelationTarget::DaysFromFullMoon,
        correlations.days_from_full_moon.pearson,
    ));

    if let Some(extremes) = phase_extremes(phase_metrics) {
        insights.push(extremes);
    }

    match volatility_test {
        Some(test) => insights.push(InsightKind::FullMoonVolatility {
            full_moon_mean: test.full_moon_mean,
            baseline_mean: test.baseline_mean,
            p_value: test.p_value,
            effect_size: test.effect_size,
            significance: Significance::from_p(test.p_value),
        }),
        None => insights.push(InsightKind::FullMoonVolatilityUnavailable),
    }

    if let Some(cluster) = clustering(records, anomalies) {
        insights.push(cluster);
    }

    insights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MoonPhase;
    use chrono::NaiveDate;

    fn record(offset: i64, daily_return: Option<f64>, vol: Option<f64>, in_window: bool) -> AlignedRecord {
        AlignedRecord {
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(offset),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0,
            volume: 1_000,
            illumination: 50.0,
            phase: MoonPhase::FirstQuarter,
            days_from_full_moon: if in_window { 0 } else { 10 },
            is_full_moon_window: in_window,
            daily_return,
            abs_return: daily_return.map(f64::abs),
            rolling_volatility: vol,
        }
    }

    #[test]
    fn significance_gates_on_p_thresholds() {
        assert_eq!(Significance::from_p(0.049), Significance::Significant);
        assert_eq!(Significance::from_p(0.05), Significance::Suggestive);
        assert_eq!(Significance::from_p(0.099), Significance::Suggestive);
        assert_eq!(Significance::from_p(0.10), Significance::NotSignificant);
    }

    #[test]
    fn planted_outliers_are_the_only_anomalies() {
        let mut records: Vec<AlignedRecord> = (0..20)
            .map(|i| record(i, Some(0.005), Some(0.01), false))
            .collect();
        // Two planted outliers well past 2 x vol.
        records[5] = record(5, Some(0.08), Some(0.01), false);
        records[12] = record(12, Some(-0.05), Some(0.01), true);

        let anomalies = detect_anomalies(&records, 2.0);
        assert_eq!(anomalies.len(), 2);
        // Largest magnitude first.
        assert!((anomalies[0].abs_return - 0.08).abs() < 1e-12);
        assert!((anomalies[1].abs_return - 0.05).abs() < 1e-12);
        assert!(anomalies[1].in_full_moon_window);
        assert!((anomalies[0].threshold - 0.02).abs() < 1e-12);
    }

    #[test]
    fn days_without_volatility_never_flag() {
        let records = vec![
            record(0, Some(0.5), None, false),
            record(1, None, Some(0.01), false),
            record(2, Some(0.5), Some(0.0), false),
        ];
        assert!(detect_anomalies(&records, 2.0).is_empty());
    }

    #[test]
    fn clustering_requires_enough_anomalies_and_excess() {
        // 20 eligible days, 5 in-window (expected fraction 0.25).
        let records: Vec<AlignedRecord> = (0..20)
            .map(|i| record(i, Some(0.001), Some(0.01), i < 5))
            .collect();

        // Three anomalies, two in-window: observed 0.667 >= 2 x 0.25.
        let anomalies: Vec<AnomalyEvent> = detect_anomalies(
            &{
                let mut r = records.clone();
                r[0] = record(0, Some(0.09), Some(0.01), true);
                r[1] = record(1, Some(0.08), Some(0.01), true);
                r[10] = record(10, Some(0.07), Some(0.01), false);
                r
            },
            2.0,
        );
        assert_eq!(anomalies.len(), 3);
        let hit = clustering(&records, &anomalies);
        assert!(matches!(
            hit,
            Some(InsightKind::AnomalyClustering { in_window_count: 2, .. })
        ));

        // Only two anomalies: below the reporting floor.
        assert!(clustering(&records, &anomalies[..2]).is_none());
    }

    #[test]
    fn clustering_silent_when_no_window_days_exist() {
        let records: Vec<AlignedRecord> = (0..20)
            .map(|i| record(i, Some(0.001), Some(0.01), false))
            .collect();
        let anomalies: Vec<AnomalyEvent> = (0..3)
            .map(|i| AnomalyEvent {
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i),
                daily_return: 0.09,
                abs_return: 0.09,
                threshold: 0.02,
                phase: MoonPhase::Full,
                illumination: 99.0,
                in_full_moon_window: false,
            })
            .collect();
        assert!(clustering(&records, &anomalies).is_none());
    }

    #[test]
    fn insight_list_has_stable_order_and_gating() {
        let records: Vec<AlignedRecord> = (0..10)
            .map(|i| record(i, Some(0.001), Some(0.01), false))
            .collect();
        let correlations = CorrelationSummary::default();
        let insights = generate_insights(&records, 2, &correlations, &[], None, &[]);

        assert!(matches!(
            insights[0],
            InsightKind::DataCoverage { aligned_days: 10, gap_count: 2 }
        ));
        assert!(matches!(
            insights[1],
            InsightKind::CorrelationUnavailable { target: CorrelationTarget::Illumination }
        ));
        assert!(matches!(
            insights[2],
            InsightKind::CorrelationUnavailable { target: CorrelationTarget::DaysFromFullMoon }
        ));
        assert!(matches!(insights[3], InsightKind::FullMoonVolatilityUnavailable));
        assert_eq!(insights.len(), 4);
    }

    #[test]
    fn full_moon_narrative_names_the_effect_band() {
        let insight = InsightKind::FullMoonVolatility {
            full_moon_mean: 0.02,
            baseline_mean: 0.015,
            p_value: 0.03,
            effect_size: 0.65,
            significance: Significance::from_p(0.03),
        };
        let text = insight.to_string();
        assert!(text.contains("higher"), "got: {text}");
        assert!(text.contains("medium effect"), "got: {text}");
        assert!(text.contains("statistically significant"));
    }

    #[test]
    fn rendered_text_reflects_significance() {
        let significant = InsightKind::Correlation {
            target: CorrelationTarget::Illumination,
            r: 0.42,
            p_value: 0.01,
            significance: Significance::from_p(0.01),
        };
        let text = significant.to_string();
        assert!(text.contains("moon illumination"));
        assert!(text.contains("statistically significant"));
        assert!(!text.contains("not statistically significant"));

        let weak = InsightKind::Correlation {
            target: CorrelationTarget::DaysFromFullMoon,
            r: -0.05,
            p_value: 0.7,
            significance: Significance::from_p(0.7),
        };
        let text = weak.to_string();
        assert!(text.contains("negative"));
        assert!(text.contains("not statistically significant"));
    }
}
