//! Correlation, phase aggregation, and the full-moon significance test.
//!
//! Special functions (ln-gamma, regularized incomplete beta, Student-t CDF)
//! are implemented here from first principles; two-tailed p-values for both
//! the correlation coefficients and the two-sample t-test come from the same
//! t-distribution machinery.
//!
//! Degenerate input never panics: every statistic that cannot be computed
//! (too few pairs, zero variance, empty group) reports `None`.

use tracing::debug;

use crate::model::{
    AlignedRecord, Correlation, CorrelationPair, CorrelationSummary, EffectSize, MoonPhase,
    PhaseMetric, VolatilityTest, ALL_PHASES,
};

/// Fewest usable pairs for which a correlation is reported.
pub const MIN_CORRELATION_PAIRS: usize = 3;

/// Fewest samples a phase needs before its aggregates are reported.
pub const MIN_PHASE_SAMPLES: usize = 5;

/// Fewest samples per group for the two-sample t-test.
pub const MIN_GROUP_SAMPLES: usize = 2;

// ---------------------------------------------------------------------------
// Special functions
// ---------------------------------------------------------------------------

/// ln(Gamma(x)) via the Lanczos approximation (g = 7, 9 coefficients).
fn ln_gamma(x: f64) -> f64 {
    #[allow(clippy::excessive_precision)]
    const LANCZOS: [f64; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    const G: f64 = 7.0;

    if x < 0.5 {
        // Reflection: Gamma(x) Gamma(1-x) = pi / sin(pi x)
        let sin_pix = (std::f64::consts::PI * x).sin();
        if sin_pix.abs() < 1e-300 {
            return f64::INFINITY;
        }
        return std::f64::consts::PI.ln() - sin_pix.abs().ln() - ln_gamma(1.0 - x);
    }

    let z = x - 1.0;
    let mut acc = LANCZOS[0];
    for (i, &c) in LANCZOS.iter().enumerate().skip(1) {
        acc += c / (z + i as f64);
    }
    let t = z + G + 0.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (z + 0.5) * t.ln() - t + acc.ln()
}

/// Regularized incomplete beta I_x(a, b), continued fraction per modified
/// Lentz. Switches to the symmetric form when x is past the pivot for
/// convergence.
fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if !(0.0..=1.0).contains(&x) {
        return f64::NAN;
    }
    if x == 0.0 {
        return 0.0;
    }
    if x == 1.0 {
        return 1.0;
    }
    if x > (a + 1.0) / (a + b + 2.0) {
        return 1.0 - incomplete_beta(b, a, 1.0 - x);
    }

    let ln_front =
        a * x.ln() + b * (1.0 - x).ln() + ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) - a.ln();
    let front = ln_front.exp();

    const MAX_ITER: usize = 200;
    const EPS: f64 = 1e-14;
    const TINY: f64 = 1e-30;

    let mut c = 1.0_f64;
    let mut d = 1.0 - (a + b) * x / (a + 1.0);
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut value = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;

        let even = m * (b - m) * x / ((a + 2.0 * m - 1.0) * (a + 2.0 * m));
        d = 1.0 + even * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + even / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        value *= c * d;

        let odd = -((a + m) * (a + b + m) * x) / ((a + 2.0 * m) * (a + 2.0 * m + 1.0));
        d = 1.0 + odd * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + odd / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let step = c * d;
        value *= step;

        if (step - 1.0).abs() < EPS {
            break;
        }
    }

    front * value
}

/// Student-t CDF: P(T <= t) with df degrees of freedom.
pub fn t_cdf(t: f64, df: f64) -> f64 {
    if df <= 0.0 {
        return f64::NAN;
    }
    if t == 0.0 {
        return 0.5;
    }
    let x = df / (df + t * t);
    let ib = incomplete_beta(df / 2.0, 0.5, x);
    if t > 0.0 {
        1.0 - 0.5 * ib
    } else {
        0.5 * ib
    }
}

/// Two-tailed p-value for a t-statistic.
pub fn two_tailed_p(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    (2.0 * (1.0 - t_cdf(t.abs(), df))).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// 95% confidence interval for r via the Fisher z-transform (z = atanh(r),
/// se = 1/sqrt(n-3)). With n <= 3 the standard error is unbounded, so the
/// interval is the full [-1, 1]; tanh squashes the |r| = 1 edge back to +-1.
fn fisher_ci(r: f64, n: usize) -> (f64, f64) {
    if n <= 3 {
        return (-1.0, 1.0);
    }
    let z = r.atanh();
    let se = 1.0 / ((n - 3) as f64).sqrt();
    ((z - 1.96 * se).tanh(), (z + 1.96 * se).tanh())
}

/// Pearson correlation with a two-tailed p-value via the t-distribution
/// (t = r sqrt((n-2)/(1-r^2))). None with fewer than three pairs or when
/// either series has zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<Correlation> {
    let n = x.len();
    if n != y.len() || n < MIN_CORRELATION_PAIRS {
        return None;
    }

    let mx = mean(x);
    let my = mean(y);
    let mut sxx = 0.0;
    let mut syy = 0.0;
    let mut sxy = 0.0;
    for i in 0..n {
        let dx = x[i] - mx;
        let dy = y[i] - my;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }

    let r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);
    let df = (n - 2) as f64;
    let p_value = if 1.0 - r * r < 1e-12 {
        0.0
    } else {
        let t = r * (df / (1.0 - r * r)).sqrt();
        two_tailed_p(t, df)
    };
    let (ci_low, ci_high) = fisher_ci(r, n);

    Some(Correlation {
        r,
        p_value,
        n,
        ci_low,
        ci_high,
    })
}

/// Average ranks (1-based), ties share the mean of their rank run.
fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let shared = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            out[order[k]] = shared;
        }
        i = j + 1;
    }
    out
}

/// Spearman rank correlation: average-rank transform, then Pearson.
pub fn spearman(x: &[f64], y: &[f64]) -> Option<Correlation> {
    if x.len() != y.len() || x.len() < MIN_CORRELATION_PAIRS {
        return None;
    }
    pearson(&ranks(x), &ranks(y))
}

fn correlation_pair(x: &[f64], y: &[f64]) -> CorrelationPair {
    CorrelationPair {
        pearson: pearson(x, y),
        spearman: spearman(x, y),
    }
}

/// Correlate daily returns against both lunar metrics over the non-null
/// pairs.
pub fn correlation_summary(records: &[AlignedRecord]) -> CorrelationSummary {
    let mut illumination = Vec::new();
    let mut days_from_full = Vec::new();
    let mut returns = Vec::new();
    for record in records {
        if let Some(ret) = record.daily_return {
            if ret.is_finite() && record.illumination.is_finite() {
                illumination.push(record.illumination);
                days_from_full.push(record.days_from_full_moon as f64);
                returns.push(ret);
            }
        }
    }

    debug!(pairs = returns.len(), "computing correlations");
    CorrelationSummary {
        illumination: correlation_pair(&illumination, &returns),
        days_from_full_moon: correlation_pair(&days_from_full, &returns),
    }
}

// ---------------------------------------------------------------------------
// Phase aggregation
// ---------------------------------------------------------------------------

/// Aggregates per phase code, in code order 0..=7. Metrics are None for
/// phases holding fewer than `min_samples` records.
pub fn phase_aggregates(records: &[AlignedRecord], min_samples: usize) -> Vec<PhaseMetric> {
    ALL_PHASES
        .iter()
        .map(|&phase| aggregate_phase(records, phase, min_samples))
        .collect()
}

fn aggregate_phase(records: &[AlignedRecord], phase: MoonPhase, min_samples: usize) -> PhaseMetric {
    let in_phase: Vec<&AlignedRecord> = records.iter().filter(|r| r.phase == phase).collect();
    let sample_count = in_phase.len();

    if sample_count < min_samples {
        return PhaseMetric {
            phase,
            sample_count,
            mean_volatility: None,
            positive_day_pct: None,
            mean_return: None,
        };
    }

    let vols: Vec<f64> = in_phase.iter().filter_map(|r| r.rolling_volatility).collect();
    let rets: Vec<f64> = in_phase.iter().filter_map(|r| r.daily_return).collect();

    let positive_day_pct = (!rets.is_empty()).then(|| {
        let positive = rets.iter().filter(|&&r| r > 0.0).count();
        positive as f64 / rets.len() as f64 * 100.0
    });

    PhaseMetric {
        phase,
        sample_count,
        mean_volatility: (!vols.is_empty()).then(|| mean(&vols)),
        positive_day_pct,
        mean_return: (!rets.is_empty()).then(|| mean(&rets)),
    }
}

// ---------------------------------------------------------------------------
// Two-sample t-test
// ---------------------------------------------------------------------------

/// Pooled-variance two-sample t-test plus Cohen's d.
///
/// None when either group is smaller than two, or when the pooled variance
/// is zero with unequal means (no defined scale for the difference). Equal
/// constant groups report t = 0, p = 1, d = 0.
pub fn two_sample_t_test(a: &[f64], b: &[f64]) -> Option<(f64, f64, f64)> {
    let (na, nb) = (a.len(), b.len());
    if na < MIN_GROUP_SAMPLES || nb < MIN_GROUP_SAMPLES {
        return None;
    }

    let (ma, mb) = (mean(a), mean(b));
    let var = |values: &[f64], m: f64| {
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
    };
    let (va, vb) = (var(a, ma), var(b, mb));

    let df = (na + nb - 2) as f64;
    let pooled_var = ((na - 1) as f64 * va + (nb - 1) as f64 * vb) / df;

    if pooled_var <= 0.0 {
        return if (ma - mb).abs() < 1e-12 {
            Some((0.0, 1.0, 0.0))
        } else {
            None
        };
    }

    let se = (pooled_var * (1.0 / na as f64 + 1.0 / nb as f64)).sqrt();
    let t = (ma - mb) / se;
    let p = two_tailed_p(t, df);
    let d = (ma - mb) / pooled_var.sqrt();

    Some((t, p, d))
}

/// Contrast rolling volatility inside vs outside the full-moon window.
pub fn volatility_test(records: &[AlignedRecord]) -> Option<VolatilityTest> {
    let mut full_moon = Vec::new();
    let mut baseline = Vec::new();
    for record in records {
        if let Some(vol) = record.rolling_volatility {
            if record.is_full_moon_window {
                full_moon.push(vol);
            } else {
                baseline.push(vol);
            }
        }
    }

    let (t_statistic, p_value, effect_size) = two_sample_t_test(&full_moon, &baseline)?;
    Some(VolatilityTest {
        full_moon_mean: mean(&full_moon),
        baseline_mean: mean(&baseline),
        full_moon_n: full_moon.len(),
        baseline_n: baseline.len(),
        t_statistic,
        p_value,
        effect_size,
        effect_size_band: EffectSize::from_d(effect_size),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ----- special functions -----

    #[test]
    fn ln_gamma_known_values() {
        assert!(ln_gamma(1.0).abs() < 1e-10);
        assert!(ln_gamma(2.0).abs() < 1e-10);
        assert!((ln_gamma(5.0) - 24.0_f64.ln()).abs() < 1e-10);
        assert!((ln_gamma(0.5) - std::f64::consts::PI.sqrt().ln()).abs() < 1e-10);
    }

    #[test]
    fn t_cdf_center_symmetry_and_tails() {
        assert!((t_cdf(0.0, 5.0) - 0.5).abs() < 1e-12);
        for &t in &[0.5, 1.0, 2.0, 3.0] {
            assert!((t_cdf(-t, 10.0) + t_cdf(t, 10.0) - 1.0).abs() < 1e-10);
        }
        // df=1 is Cauchy: CDF(1) = 0.75.
        assert!((t_cdf(1.0, 1.0) - 0.75).abs() < 1e-6);
        // Large df approaches the normal distribution.
        assert!((t_cdf(1.96, 1000.0) - 0.975).abs() < 0.005);
        assert!(t_cdf(100.0, 5.0) > 0.999);
    }

    #[test]
    fn two_tailed_p_of_zero_is_one() {
        assert!((two_tailed_p(0.0, 10.0) - 1.0).abs() < 1e-12);
        assert!(two_tailed_p(50.0, 10.0) < 1e-6);
    }

    // ----- correlation -----

    #[test]
    fn pearson_perfect_linear_relation() {
        let x: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let c = pearson(&x, &y).unwrap();
        assert!((c.r - 1.0).abs() < 1e-9);
        assert!(c.p_value < 1e-9);
        assert_eq!(c.n, 30);
    }

    #[test]
    fn pearson_near_linear_with_tiny_noise() {
        // dailyReturn = 2 x illumination + noise ~ 0.
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 2.0).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, v)| 2.0 * v + if i % 2 == 0 { 1e-7 } else { -1e-7 })
            .collect();
        let c = pearson(&x, &y).unwrap();
        assert!(c.r > 0.999999);
        assert!(c.p_value < 1e-9);
    }

    #[test]
    fn pearson_sign_follows_slope() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [10.0, 8.0, 6.0, 4.0, 2.0];
        let c = pearson(&x, &y).unwrap();
        assert!((c.r + 1.0).abs() < 1e-9);
    }

    #[test]
    fn pearson_degenerate_inputs_are_not_computable() {
        assert!(pearson(&[1.0, 2.0], &[1.0, 2.0]).is_none(), "too few pairs");
        let flat = [3.0, 3.0, 3.0, 3.0];
        let vary = [1.0, 2.0, 3.0, 4.0];
        assert!(pearson(&flat, &vary).is_none(), "zero variance in x");
        assert!(pearson(&vary, &flat).is_none(), "zero variance in y");
    }

    #[test]
    fn spearman_is_rank_invariant_under_monotone_maps() {
        let x: [f64; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        // Monotone but nonlinear in x.
        let y: Vec<f64> = x.iter().map(|v| v.exp()).collect();
        let s = spearman(&x, &y).unwrap();
        assert!((s.r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fisher_interval_brackets_r_and_narrows_with_n() {
        fn noisy(n: usize) -> (Vec<f64>, Vec<f64>) {
            let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
            let y: Vec<f64> = x
                .iter()
                .enumerate()
                .map(|(i, v)| v + if i % 2 == 0 { 3.0 } else { -3.0 })
                .collect();
            (x, y)
        }

        let (x, y) = noisy(10);
        let small = pearson(&x, &y).unwrap();
        let (x, y) = noisy(40);
        let large = pearson(&x, &y).unwrap();

        for c in [small, large] {
            assert!(c.ci_low <= c.r && c.r <= c.ci_high);
            assert!((-1.0..=1.0).contains(&c.ci_low));
            assert!((-1.0..=1.0).contains(&c.ci_high));
        }
        assert!(
            large.ci_high - large.ci_low < small.ci_high - small.ci_low,
            "more pairs tighten the interval"
        );
    }

    #[test]
    fn minimum_pair_count_gives_the_unbounded_interval() {
        let c = pearson(&[1.0, 2.0, 3.0], &[1.0, 3.0, 2.0]).unwrap();
        assert_eq!((c.ci_low, c.ci_high), (-1.0, 1.0));
    }

    #[test]
    fn rank_ties_share_average_rank() {
        let r = ranks(&[10.0, 20.0, 20.0, 30.0]);
        assert_eq!(r, vec![1.0, 2.5, 2.5, 4.0]);
    }

    // ----- t-test -----

    #[test]
    fn identical_distributions_give_t_zero_p_one() {
        let a = [0.01, 0.02, 0.03, 0.04, 0.05];
        let (t, p, d) = two_sample_t_test(&a, &a).unwrap();
        assert!(t.abs() < 1e-12);
        assert!((p - 1.0).abs() < 1e-9);
        assert!(d.abs() < 1e-12);
    }

    #[test]
    fn separated_groups_give_small_p_and_large_effect() {
        let a = [10.0, 10.5, 11.0, 10.2, 10.8];
        let b = [1.0, 1.5, 2.0, 1.2, 1.8];
        let (t, p, d) = two_sample_t_test(&a, &b).unwrap();
        assert!(t > 10.0);
        assert!(p < 1e-6);
        assert!(d > 5.0);
        assert_eq!(EffectSize::from_d(d), EffectSize::Large);
    }

    #[test]
    fn tiny_or_constant_groups_are_not_computable() {
        assert!(two_sample_t_test(&[1.0], &[1.0, 2.0]).is_none());
        assert!(two_sample_t_test(&[2.0, 2.0], &[3.0, 3.0]).is_none());
        // Equal constants are a defined degenerate case.
        let (t, p, d) = two_sample_t_test(&[2.0, 2.0], &[2.0, 2.0]).unwrap();
        assert_eq!((t, p, d), (0.0, 1.0, 0.0));
    }
}
