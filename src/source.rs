//! Provider traits and the cached, retried data source in front of them.
//!
//! The raw network clients live outside this crate; the core sees them only
//! as async trait objects. `DataSource` is the single path to provider data:
//! every call goes through the cache, and cache misses run the provider call
//! under a per-call timeout and bounded backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::time::timeout;
use tracing::debug;

use crate::cache::{cache_key, CacheStore, Clock};
use crate::error::FetchError;
use crate::model::{RawLunarPoint, RawPricePoint};
use crate::retry::{retry_async, RetryConfig};

/// Supplies daily OHLCV points for a symbol and date range.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_prices(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> anyhow::Result<Vec<RawPricePoint>>;
}

/// Supplies daily lunar illumination samples for a location and date range.
#[async_trait]
pub trait AstronomyProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_lunar(
        &self,
        latitude: f64,
        longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> anyhow::Result<Vec<RawLunarPoint>>;
}

/// Tuning for the fetch layer. TTL defaults follow the upstream data's rate
/// of change: prices move intraday, lunar ephemerides do not.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub price_ttl: Duration,
    pub lunar_ttl: Duration,
    pub call_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            price_ttl: Duration::from_secs(30 * 60),
            lunar_ttl: Duration::from_secs(24 * 60 * 60),
            call_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Cached front for the two providers. Shared across concurrent analyses.
pub struct DataSource {
    market: Arc<dyn MarketDataProvider>,
    astronomy: Arc<dyn AstronomyProvider>,
    price_cache: CacheStore<Arc<Vec<RawPricePoint>>>,
    lunar_cache: CacheStore<Arc<Vec<RawLunarPoint>>>,
    config: SourceConfig,
}

impl DataSource {
    pub fn new(
        market: Arc<dyn MarketDataProvider>,
        astronomy: Arc<dyn AstronomyProvider>,
        clock: Arc<dyn Clock>,
        config: SourceConfig,
    ) -> Self {
        Self {
            market,
            astronomy,
            price_cache: CacheStore::new(clock.clone()),
            lunar_cache: CacheStore::new(clock),
            config,
        }
    }

    pub async fn prices(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Arc<Vec<RawPricePoint>>, FetchError> {
        let key = cache_key(
            self.market.name(),
            &[
                ("symbol", symbol.to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
            ],
        );
        let provider = self.market.clone();
        let name = provider.name().to_string();
        let cfg = &self.config;
        let symbol = symbol.to_string();

        self.price_cache
            .get_or_fetch(&key, cfg.price_ttl, || async {
                let points = self
                    .with_retries(&name, || provider.fetch_prices(&symbol, start, end))
                    .await?;
                debug!(provider = %name, %symbol, rows = points.len(), "fetched price series");
                Ok(Arc::new(points))
            })
            .await
    }

    pub async fn lunar(
        &self,
        latitude: f64,
        longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Arc<Vec<RawLunarPoint>>, FetchError> {
        let key = cache_key(
            self.astronomy.name(),
            &[
                ("lat", format!("{latitude:.4}")),
                ("lon", format!("{longitude:.4}")),
                ("start", start.to_string()),
                ("end", end.to_string()),
            ],
        );
        let provider = self.astronomy.clone();
        let name = provider.name().to_string();
        let cfg = &self.config;

        self.lunar_cache
            .get_or_fetch(&key, cfg.lunar_ttl, || async {
                let points = self
                    .with_retries(&name, || {
                        provider.fetch_lunar(latitude, longitude, start, end)
                    })
                    .await?;
                debug!(provider = %name, rows = points.len(), "fetched lunar series");
                Ok(Arc::new(points))
            })
            .await
    }

    pub fn price_cache_stats(&self) -> crate::cache::CacheStats {
        self.price_cache.stats()
    }

    pub fn lunar_cache_stats(&self) -> crate::cache::CacheStats {
        self.lunar_cache.stats()
    }

    /// Run one provider call under the per-call timeout, retrying transient
    /// failures. Exhaustion maps to a `FetchError` carrying the last cause.
    async fn with_retries<T, F, Fut>(&self, provider: &str, mut call: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let cfg = &self.config;
        retry_async(&cfg.retry, provider, || {
            let fut = call();
            async move {
                match timeout(cfg.call_timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "timed out after {:?}",
                        cfg.call_timeout
                    )),
                }
            }
        })
        .await
        .map_err(|e| FetchError::new(provider, cfg.retry.attempts(), format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingMarket {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl MarketDataProvider for CountingMarket {
        fn name(&self) -> &str {
            "counting-market"
        }

        async fn fetch_prices(
            &self,
            _symbol: &str,
            start: NaiveDate,
            _end: NaiveDate,
        ) -> anyhow::Result<Vec<RawPricePoint>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient outage #{n}");
            }
            Ok(vec![RawPricePoint {
                date: Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0).unwrap()),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 1_000,
            }])
        }
    }

    struct NullAstronomy;

    #[async_trait]
    impl AstronomyProvider for NullAstronomy {
        fn name(&self) -> &str {
            "null-astronomy"
        }

        async fn fetch_lunar(
            &self,
            _latitude: f64,
            _longitude: f64,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> anyhow::Result<Vec<RawLunarPoint>> {
            Ok(Vec::new())
        }
    }

    fn source(market: Arc<CountingMarket>) -> DataSource {
        let config = SourceConfig {
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        DataSource::new(
            market,
            Arc::new(NullAstronomy),
            Arc::new(crate::cache::SystemClock),
            config,
        )
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn repeated_requests_fetch_once() {
        let market = Arc::new(CountingMarket {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let src = source(market.clone());

        let a = src.prices("SPY", date(2024, 1, 1), date(2024, 1, 31)).await.unwrap();
        let b = src.prices("SPY", date(2024, 1, 1), date(2024, 1, 31)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(market.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_one_request() {
        let market = Arc::new(CountingMarket {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let src = source(market.clone());

        let points = src
            .prices("SPY", date(2024, 1, 1), date(2024, 1, 31))
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(market.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_cause() {
        let market = Arc::new(CountingMarket {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let src = source(market.clone());

        let err = src
            .prices("SPY", date(2024, 1, 1), date(2024, 1, 31))
            .await
            .unwrap_err();
        assert_eq!(err.provider, "counting-market");
        assert_eq!(err.attempts, 3);
        assert!(err.cause.contains("transient outage #2"), "got: {}", err.cause);
        // The failure was not cached; a later call tries the provider again.
        let _ = src.prices("SPY", date(2024, 1, 1), date(2024, 1, 31)).await;
        assert!(market.calls.load(Ordering::SeqCst) > 3);
    }
}
