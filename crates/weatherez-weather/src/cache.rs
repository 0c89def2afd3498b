//! Cache-aside weather resolution.
//!
//! Every value observed in the store is checked against the staleness window.
//! Fresh values are emitted as-is; stale or missing ones trigger a single
//! fetch whose result is written back and emitted. A failed fetch falls back
//! to whatever the store held, and only surfaces as an error when the store
//! held nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use weatherez_core::{Units, WeatherError};

use crate::provider::WeatherSource;
use crate::store::WeatherStore;
use crate::types::WeatherRecord;

/// Age after which a cached record is refetched.
pub const STALE_WINDOW: Duration = Duration::from_secs(10 * 60);

const RESOLUTION_BUFFER: usize = 8;

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Orchestrates a [`WeatherStore`] and a [`WeatherSource`] under a staleness policy.
#[derive(Clone)]
pub struct WeatherCache {
    store: Arc<dyn WeatherStore>,
    source: Arc<dyn WeatherSource>,
    clock: Arc<dyn Clock>,
    units: Units,
    api_key: Arc<str>,
    stale_window_ms: i64,
}

impl WeatherCache {
    pub fn new(
        store: Arc<dyn WeatherStore>,
        source: Arc<dyn WeatherSource>,
        units: Units,
        api_key: &str,
    ) -> Self {
        Self {
            store,
            source,
            clock: Arc::new(SystemClock),
            units,
            api_key: Arc::from(api_key),
            stale_window_ms: STALE_WINDOW.as_millis() as i64,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_stale_window(mut self, window: Duration) -> Self {
        self.stale_window_ms = window.as_millis() as i64;
        self
    }

    /// Whether `cached` must be refetched at `now_ms`.
    pub fn is_stale(&self, cached: Option<&WeatherRecord>, now_ms: i64) -> bool {
        match cached {
            None => true,
            Some(record) => record.age_ms(now_ms) > self.stale_window_ms,
        }
    }

    /// Start resolving `key`.
    ///
    /// Must be called from within a tokio runtime. The returned stream stays
    /// open and re-emits whenever the stored record changes; it ends after an
    /// error, on [`Resolution::cancel`], or when dropped.
    pub fn resolve(&self, key: &str) -> Resolution {
        let (tx, rx) = mpsc::channel(RESOLUTION_BUFFER);
        let token = CancellationToken::new();

        let cache = self.clone();
        let key = key.to_string();
        let task_token = token.clone();
        tokio::spawn(async move {
            cache.run(key, tx, task_token).await;
        });

        Resolution {
            rx,
            _guard: token.clone().drop_guard(),
            token,
        }
    }

    async fn run(
        self,
        key: String,
        tx: mpsc::Sender<Result<WeatherRecord, WeatherError>>,
        token: CancellationToken,
    ) {
        let mut subscription = match self.store.observe(&key) {
            Ok(sub) => sub,
            Err(e) => {
                tracing::error!("Failed to observe weather for {}: {}", key, e);
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        let mut last_emitted: Option<WeatherRecord> = None;

        loop {
            let cached = tokio::select! {
                _ = token.cancelled() => break,
                next = subscription.next() => match next {
                    Some(cached) => cached,
                    None => break,
                },
            };

            // Our own write-back comes around again through the subscription.
            if cached.is_some() && cached == last_emitted {
                continue;
            }

            let outcome = tokio::select! {
                _ = token.cancelled() => break,
                outcome = self.settle(&key, cached) => outcome,
            };

            match outcome {
                Ok(record) => {
                    last_emitted = Some(record.clone());
                    if tx.send(Ok(record)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }

        tracing::debug!("Resolution for {} finished", key);
    }

    /// Decide what to emit for one observed store value.
    async fn settle(
        &self,
        key: &str,
        cached: Option<WeatherRecord>,
    ) -> Result<WeatherRecord, WeatherError> {
        let now = self.clock.now_ms();
        match cached {
            Some(record) if !self.is_stale(Some(&record), now) => {
                tracing::debug!("Serving cached weather for {}", key);
                Ok(record)
            }
            cached => {
                tracing::debug!("Fetching weather for {}", key);
                match self.source.fetch(key, self.units, &self.api_key).await {
                    Ok(payload) => {
                        let record =
                            WeatherRecord::from_payload(key, &payload, self.clock.now_ms());
                        self.store.upsert(&record)?;
                        tracing::info!("Fetched fresh weather for {}", key);
                        Ok(record)
                    }
                    Err(e) => match cached {
                        Some(stale) => {
                            tracing::warn!(
                                "Fetch for {} failed, serving cached data: {}",
                                key,
                                e
                            );
                            Ok(stale)
                        }
                        None => {
                            tracing::warn!("Fetch for {} failed with nothing cached: {}", key, e);
                            Err(e.into())
                        }
                    },
                }
            }
        }
    }
}

/// Stream of records produced by [`WeatherCache::resolve`].
pub struct Resolution {
    rx: mpsc::Receiver<Result<WeatherRecord, WeatherError>>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl Resolution {
    /// Wait for the next record. `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<WeatherRecord, WeatherError>> {
        self.rx.recv().await
    }

    /// Stop producing emissions.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::store::SqliteWeatherStore;
    use crate::testing::{payload, record, FailingStore, ManualClock, ScriptedSource, MINUTE_MS};
    use weatherez_core::DatabaseError;
    use weatherez_core::FetchError;

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        store: Arc<SqliteWeatherStore>,
        source: Arc<ScriptedSource>,
        clock: Arc<ManualClock>,
        cache: WeatherCache,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteWeatherStore::in_memory().unwrap());
        let source = Arc::new(ScriptedSource::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let cache = WeatherCache::new(store.clone(), source.clone(), Units::Metric, "key")
            .with_clock(clock.clone());
        Fixture {
            store,
            source,
            clock,
            cache,
        }
    }

    async fn assert_quiet(resolution: &mut Resolution) {
        let next = tokio::time::timeout(Duration::from_millis(50), resolution.next()).await;
        assert!(next.is_err(), "expected no further emission, got {:?}", next);
    }

    #[tokio::test]
    async fn test_empty_cache_fetches_and_stores() {
        let f = fixture();
        f.source.push_ok(payload(18.5, 60, Some(("Clouds", "04d"))));

        let mut resolution = f.cache.resolve("Tokyo");
        let emitted = resolution.next().await.unwrap().unwrap();

        let expected = WeatherRecord {
            key: "Tokyo".to_string(),
            temperature: 18.5,
            humidity: 60,
            condition: "Clouds".to_string(),
            icon: "04d".to_string(),
            last_updated: NOW,
        };
        assert_eq!(emitted, expected);
        assert_eq!(f.store.get("Tokyo").unwrap(), Some(expected));
        assert_eq!(f.source.calls(), vec!["Tokyo".to_string()]);
        assert_quiet(&mut resolution).await;
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_network() {
        let f = fixture();
        let cached = record("Tokyo", 15.0, NOW - 5 * MINUTE_MS);
        f.store.upsert(&cached).unwrap();

        let mut resolution = f.cache.resolve("Tokyo");
        assert_eq!(resolution.next().await.unwrap().unwrap(), cached);
        assert!(f.source.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exactly_ten_minutes_old_is_fresh() {
        let f = fixture();
        let cached = record("Tokyo", 15.0, NOW - 10 * MINUTE_MS);
        f.store.upsert(&cached).unwrap();

        let mut resolution = f.cache.resolve("Tokyo");
        assert_eq!(resolution.next().await.unwrap().unwrap(), cached);
        assert!(f.source.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stale_cache_refetches_and_advances_timestamp() {
        let f = fixture();
        let cached = record("Tokyo", 15.0, NOW - 20 * MINUTE_MS);
        f.store.upsert(&cached).unwrap();
        f.source.push_ok(payload(19.0, 55, Some(("Clear", "01d"))));

        let mut resolution = f.cache.resolve("Tokyo");
        let emitted = resolution.next().await.unwrap().unwrap();

        assert_eq!(emitted.temperature, 19.0);
        assert_eq!(emitted.last_updated, NOW);
        assert!(emitted.last_updated > cached.last_updated);
        assert_eq!(f.store.get("Tokyo").unwrap(), Some(emitted));
        assert_eq!(f.source.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_survives_fetch_failure() {
        let f = fixture();
        let cached = record("Tokyo", 15.0, NOW - 20 * MINUTE_MS);
        f.store.upsert(&cached).unwrap();
        f.source.push_err(FetchError::InvalidApiKey);

        let mut resolution = f.cache.resolve("Tokyo");
        assert_eq!(resolution.next().await.unwrap().unwrap(), cached);
        assert_eq!(f.store.get("Tokyo").unwrap(), Some(cached));
        assert_quiet(&mut resolution).await;
    }

    #[tokio::test]
    async fn test_empty_cache_and_fetch_failure_is_an_error() {
        let f = fixture();
        f.source.push_err(FetchError::NotFound("city not found".into()));

        let mut resolution = f.cache.resolve("Atlantis");
        match resolution.next().await {
            Some(Err(WeatherError::Fetch(FetchError::NotFound(_)))) => {}
            other => panic!("expected fetch error, got {:?}", other),
        }
        assert!(resolution.next().await.is_none());
        assert!(f.store.get("Atlantis").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_condition_list() {
        let f = fixture();
        f.source.push_ok(payload(3.0, 90, None));

        let mut resolution = f.cache.resolve("Reykjavik");
        let emitted = resolution.next().await.unwrap().unwrap();
        assert_eq!(emitted.condition, "");
        assert_eq!(emitted.icon, "");
    }

    #[tokio::test]
    async fn test_second_resolve_within_window_does_not_fetch() {
        let f = fixture();
        f.source.push_ok(payload(18.5, 60, Some(("Clouds", "04d"))));

        let mut first = f.cache.resolve("Tokyo");
        let fetched = first.next().await.unwrap().unwrap();
        drop(first);

        f.clock.advance(MINUTE_MS);
        let mut second = f.cache.resolve("Tokyo");
        assert_eq!(second.next().await.unwrap().unwrap(), fetched);
        assert_eq!(f.source.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_external_write_is_pushed_to_open_resolution() {
        let f = fixture();
        let cached = record("Tokyo", 15.0, NOW - MINUTE_MS);
        f.store.upsert(&cached).unwrap();

        let mut resolution = f.cache.resolve("Tokyo");
        assert_eq!(resolution.next().await.unwrap().unwrap(), cached);

        let newer = record("Tokyo", 16.0, NOW);
        f.store.upsert(&newer).unwrap();
        assert_eq!(resolution.next().await.unwrap().unwrap(), newer);
        assert!(f.source.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_while_open_triggers_refetch() {
        let f = fixture();
        let cached = record("Tokyo", 15.0, NOW - MINUTE_MS);
        f.store.upsert(&cached).unwrap();

        let mut resolution = f.cache.resolve("Tokyo");
        resolution.next().await.unwrap().unwrap();

        f.source.push_ok(payload(17.0, 40, Some(("Rain", "10d"))));
        f.store.delete("Tokyo").unwrap();
        let refetched = resolution.next().await.unwrap().unwrap();
        assert_eq!(refetched.condition, "Rain");
        assert_eq!(f.source.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let f = fixture();
        let cached = record("Tokyo", 15.0, NOW - MINUTE_MS);
        f.store.upsert(&cached).unwrap();

        let mut resolution = f.cache.resolve("Tokyo");
        resolution.next().await.unwrap().unwrap();

        resolution.cancel();
        assert!(resolution.next().await.is_none());
    }

    fn cache_over(store: Arc<FailingStore>, source: Arc<ScriptedSource>) -> WeatherCache {
        WeatherCache::new(store, source, Units::Metric, "key")
            .with_clock(Arc::new(ManualClock::new(NOW)))
    }

    #[tokio::test]
    async fn test_failed_write_is_fatal_even_with_stale_cache() {
        let store = Arc::new(FailingStore::failing_writes());
        store.seed(&record("Tokyo", 15.0, NOW - 20 * MINUTE_MS));
        let source = Arc::new(ScriptedSource::new());
        source.push_ok(payload(19.0, 55, Some(("Clear", "01d"))));

        let mut resolution = cache_over(store, source.clone()).resolve("Tokyo");
        match resolution.next().await {
            Some(Err(WeatherError::Storage(DatabaseError::QueryFailed(msg)))) => {
                assert_eq!(msg, "disk full")
            }
            other => panic!("expected storage fault, got {:?}", other),
        }
        assert!(resolution.next().await.is_none());
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_observe_ends_stream() {
        let store = Arc::new(FailingStore::failing_observe());
        let source = Arc::new(ScriptedSource::new());

        let mut resolution = cache_over(store, source.clone()).resolve("Tokyo");
        assert!(matches!(
            resolution.next().await,
            Some(Err(WeatherError::Storage(_)))
        ));
        assert!(resolution.next().await.is_none());
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn test_custom_stale_window() {
        let f = fixture();
        let cache = f.cache.clone().with_stale_window(Duration::from_secs(60));
        let cached = record("Tokyo", 15.0, NOW - 2 * MINUTE_MS);
        assert!(cache.is_stale(Some(&cached), NOW));
        assert!(!f.cache.is_stale(Some(&cached), NOW));
        assert!(cache.is_stale(None, NOW));
    }
}
