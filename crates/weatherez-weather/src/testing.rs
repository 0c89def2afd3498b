//! Test doubles shared by the cache and session tests.
#![allow(clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use weatherez_core::{DatabaseError, FetchError, Units};

use crate::cache::Clock;
use crate::provider::WeatherSource;
use crate::store::{RecordSubscription, SqliteWeatherStore, StoreResult, WeatherStore};
use crate::types::{ConditionEntry, MainReadings, WeatherPayload, WeatherRecord};

pub const MINUTE_MS: i64 = 60 * 1000;

/// Clock that only moves when told to.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Source that replays queued responses in order and records every query.
///
/// With nothing queued, a fetch waits until a response is pushed.
pub struct ScriptedSource {
    responses: Mutex<VecDeque<Result<WeatherPayload, FetchError>>>,
    calls: Mutex<Vec<String>>,
    pushed: Notify,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            pushed: Notify::new(),
        }
    }

    pub fn push_ok(&self, payload: WeatherPayload) {
        self.responses.lock().push_back(Ok(payload));
        self.pushed.notify_waiters();
    }

    pub fn push_err(&self, err: FetchError) {
        self.responses.lock().push_back(Err(err));
        self.pushed.notify_waiters();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WeatherSource for ScriptedSource {
    async fn fetch(
        &self,
        query: &str,
        _units: Units,
        _api_key: &str,
    ) -> Result<WeatherPayload, FetchError> {
        self.calls.lock().push(query.to_string());
        loop {
            let pushed = self.pushed.notified();
            if let Some(response) = self.responses.lock().pop_front() {
                return response;
            }
            pushed.await;
        }
    }
}

/// Store whose writes always fail, optionally refusing subscriptions too.
///
/// Reads and deletes go to a real in-memory store so tests can seed it.
pub struct FailingStore {
    inner: SqliteWeatherStore,
    fail_observe: bool,
}

impl FailingStore {
    pub fn failing_writes() -> Self {
        Self::build(false)
    }

    pub fn failing_observe() -> Self {
        Self::build(true)
    }

    fn build(fail_observe: bool) -> Self {
        Self {
            inner: SqliteWeatherStore::in_memory().expect("in-memory store"),
            fail_observe,
        }
    }

    /// Write past the failure, for seeding.
    pub fn seed(&self, record: &WeatherRecord) {
        self.inner.upsert(record).expect("seed record");
    }
}

fn disk_full() -> DatabaseError {
    DatabaseError::QueryFailed("disk full".to_string())
}

impl WeatherStore for FailingStore {
    fn observe(&self, key: &str) -> StoreResult<RecordSubscription> {
        if self.fail_observe {
            return Err(disk_full());
        }
        self.inner.observe(key)
    }

    fn upsert(&self, _record: &WeatherRecord) -> StoreResult<()> {
        Err(disk_full())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key)
    }

    fn get(&self, key: &str) -> StoreResult<Option<WeatherRecord>> {
        self.inner.get(key)
    }
}

pub fn payload(temp: f64, humidity: i32, condition: Option<(&str, &str)>) -> WeatherPayload {
    WeatherPayload {
        name: String::new(),
        main: MainReadings { temp, humidity },
        weather: condition
            .map(|(main, icon)| {
                vec![ConditionEntry {
                    id: 0,
                    main: main.to_string(),
                    description: String::new(),
                    icon: icon.to_string(),
                }]
            })
            .unwrap_or_default(),
        dt: 0,
    }
}

pub fn record(key: &str, temperature: f64, last_updated: i64) -> WeatherRecord {
    WeatherRecord {
        key: key.to_string(),
        temperature,
        humidity: 50,
        condition: "Clouds".to_string(),
        icon: "04d".to_string(),
        last_updated,
    }
}
