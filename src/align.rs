//! Calendar-date alignment of the price and lunar series.
//!
//! The join is on exact date equality only. Lunar data is expected to cover
//! every calendar day, so a trading day without a matching lunar sample is a
//! data-quality signal: the day is dropped from the output and counted in
//! `gap_count` rather than silently discarded. Duplicate dates in either
//! input keep the first occurrence and also count as a conflict.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::model::{RawLunarPoint, RawPricePoint};

/// A trading day joined with its same-date lunar sample. Derived metrics are
/// filled in by the metrics engine.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedDay {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub illumination: f64,
    pub waxing: bool,
}

/// Join the two series on calendar date. Returns the aligned days in
/// ascending date order plus the gap count (dropped trading days and
/// duplicate-date conflicts).
pub fn align(prices: &[RawPricePoint], lunar: &[RawLunarPoint]) -> (Vec<JoinedDay>, u32) {
    let mut gap_count = 0u32;

    // Normalize to the canonical calendar date, first occurrence wins.
    let mut price_by_date: BTreeMap<NaiveDate, &RawPricePoint> = BTreeMap::new();
    for point in prices {
        let date = point.date.date_naive();
        if price_by_date.contains_key(&date) {
            warn!(%date, "duplicate price date; keeping first occurrence");
            gap_count += 1;
        } else {
            price_by_date.insert(date, point);
        }
    }

    let mut lunar_by_date: BTreeMap<NaiveDate, &RawLunarPoint> = BTreeMap::new();
    for point in lunar {
        let date = point.date.date_naive();
        if lunar_by_date.contains_key(&date) {
            warn!(%date, "duplicate lunar date; keeping first occurrence");
            gap_count += 1;
        } else {
            lunar_by_date.insert(date, point);
        }
    }

    let mut joined = Vec::with_capacity(price_by_date.len());
    for (date, price) in &price_by_date {
        match lunar_by_date.get(date) {
            Some(moon) => joined.push(JoinedDay {
                date: *date,
                open: price.open,
                high: price.high,
                low: price.low,
                close: price.close,
                volume: price.volume,
                illumination: moon.illumination,
                waxing: moon.waxing,
            }),
            None => {
                warn!(%date, "trading day has no lunar sample; dropping");
                gap_count += 1;
            }
        }
    }

    debug!(
        aligned = joined.len(),
        gaps = gap_count,
        "aligned price and lunar series"
    );
    (joined, gap_count)
}
