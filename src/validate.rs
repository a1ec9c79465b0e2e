//! Request validation. Everything here runs before any network fetch.

use chrono::NaiveDate;

use crate::error::ValidationError;

/// Rolling windows the metrics engine accepts.
pub const SUPPORTED_WINDOWS: [usize; 3] = [7, 14, 30];

/// Validate and normalize a ticker symbol: 1-5 ASCII letters, optionally
/// followed by a dot and 1-3 letters (class suffixes like "BRK.B").
/// Returns the uppercased form.
pub fn validate_symbol(raw: &str) -> Result<String, ValidationError> {
    let cleaned = raw.trim().to_ascii_uppercase();
    let invalid = || ValidationError::InvalidSymbol(raw.to_string());

    let (base, suffix) = match cleaned.split_once('.') {
        Some((base, suffix)) => (base, Some(suffix)),
        None => (cleaned.as_str(), None),
    };

    let all_letters = |s: &str| s.chars().all(|c| c.is_ascii_uppercase());
    if base.is_empty() || base.len() > 5 || !all_letters(base) {
        return Err(invalid());
    }
    if let Some(suffix) = suffix {
        if suffix.is_empty() || suffix.len() > 3 || !all_letters(suffix) {
            return Err(invalid());
        }
    }

    Ok(cleaned)
}

/// Reject inverted or empty date ranges.
pub fn validate_date_range(start: NaiveDate, end: NaiveDate) -> Result<(), ValidationError> {
    if start > end {
        return Err(ValidationError::InvertedDateRange { start, end });
    }
    Ok(())
}

pub fn validate_window(window: usize) -> Result<(), ValidationError> {
    if SUPPORTED_WINDOWS.contains(&window) {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedWindow(window))
    }
}

pub fn validate_location(latitude: f64, longitude: f64) -> Result<(), ValidationError> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(ValidationError::LatitudeOutOfRange(latitude));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(ValidationError::LongitudeOutOfRange(longitude));
    }
    Ok(())
}
