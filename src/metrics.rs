//! Derived per-day metrics: returns, rolling volatility, phase
//! classification, and distance to the nearest full-moon event.

use chrono::NaiveDate;
use tracing::debug;

use crate::align::JoinedDay;
use crate::model::{AlignedRecord, MoonPhase, RawLunarPoint};

/// Days on either side of a full-moon event that count as "in window".
pub const FULL_MOON_WINDOW_DAYS: i32 = 2;

/// Minimum illumination for a local maximum to count as a full-moon event.
/// Keeps minor wiggles in noisy provider data from registering as peaks.
const PEAK_MIN_ILLUMINATION: f64 = 95.0;

/// Sample standard deviation (ddof = 1). None for fewer than two values.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let ss = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
    Some((ss / (n - 1) as f64).sqrt())
}

/// Dates of full-moon events in the raw lunar series.
///
/// Scans the daily series (before alignment, so weekend peaks are kept) for
/// local illumination maxima at or above the peak threshold. Plateaus count
/// once, at their first day. If nothing reaches the threshold — short ranges
/// can miss a full moon entirely — the brightest day stands in as the single
/// event so the distance metric stays defined.
pub fn full_moon_dates(lunar: &[RawLunarPoint]) -> Vec<NaiveDate> {
    if lunar.is_empty() {
        return Vec::new();
    }

    let mut samples: Vec<(NaiveDate, f64)> = lunar
        .iter()
        .map(|p| (p.date.date_naive(), p.illumination))
        .collect();
    samples.sort_by_key(|(date, _)| *date);
    samples.dedup_by_key(|(date, _)| *date);

    let illum: Vec<f64> = samples.iter().map(|(_, i)| *i).collect();
    let mut peaks = Vec::new();

    for t in 0..illum.len() {
        if illum[t] < PEAK_MIN_ILLUMINATION {
            continue;
        }
        let rises_into = t == 0 || illum[t] > illum[t - 1];
        if !rises_into {
            continue;
        }
        // Walk any plateau of equal values; the run is a peak if it ends in
        // a drop or at the end of the series.
        let mut end = t;
        while end + 1 < illum.len() && illum[end + 1] == illum[t] {
            end += 1;
        }
        let drops_after = end + 1 >= illum.len() || illum[end + 1] < illum[t];
        if drops_after {
            peaks.push(samples[t].0);
        }
    }

    if peaks.is_empty() {
        // Fall back to the brightest day in range.
        if let Some((date, _)) = samples
            .iter()
            .cloned()
            .reduce(|best, cur| if cur.1 > best.1 { cur } else { best })
        {
            peaks.push(date);
        }
    }

    debug!(events = peaks.len(), "detected full-moon events");
    peaks
}

/// Signed calendar-day distance from `date` to the nearest event: positive
/// before an upcoming full moon, negative after one. Ties between an
/// upcoming and a past event resolve toward the upcoming one.
fn days_from_nearest(date: NaiveDate, events: &[NaiveDate]) -> i32 {
    events
        .iter()
        .map(|event| (*event - date).num_days() as i32)
        .min_by_key(|d| (d.unsigned_abs(), *d < 0))
        .unwrap_or(0)
}

/// Fill in all derived metrics over the aligned days.
///
/// `window` is the rolling-volatility window W: the volatility at index t is
/// the sample stdev of the trailing W daily returns, defined only once W
/// non-null returns exist (so the first Some appears at index W).
pub fn enrich(joined: &[JoinedDay], window: usize, events: &[NaiveDate]) -> Vec<AlignedRecord> {
    let mut returns: Vec<Option<f64>> = Vec::with_capacity(joined.len());
    for (t, day) in joined.iter().enumerate() {
        let ret = if t == 0 {
            None
        } else {
            let prev_close = joined[t - 1].close;
            // A non-positive prior close has no meaningful return.
            (prev_close > 0.0).then(|| (day.close - prev_close) / prev_close)
        };
        returns.push(ret);
    }

    let mut records = Vec::with_capacity(joined.len());
    for (t, day) in joined.iter().enumerate() {
        let rolling_volatility = if t >= window {
            let tail: Vec<f64> = returns[t + 1 - window..=t]
                .iter()
                .copied()
                .flatten()
                .collect();
            if tail.len() == window {
                sample_std(&tail)
            } else {
                None
            }
        } else {
            None
        };

        let days_from_full_moon = days_from_nearest(day.date, events);

        records.push(AlignedRecord {
            date: day.date,
            open: day.open,
            high: day.high,
            low: day.low,
            close: day.close,
            volume: day.volume,
            illumination: day.illumination,
            phase: MoonPhase::classify(day.illumination, day.waxing),
            days_from_full_moon,
            is_full_moon_window: !events.is_empty()
                && days_from_full_moon.abs() <= FULL_MOON_WINDOW_DAYS,
            daily_return: returns[t],
            abs_return: returns[t].map(f64::abs),
            rolling_volatility,
        });
    }

    records
}
