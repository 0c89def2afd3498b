//! Screen-level controller: turns user actions into [`UiState`] transitions.
//!
//! Only the most recently issued load may publish state. Starting a new load
//! aborts the previous one, and any emission that slips through from a
//! superseded load is discarded.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use weatherez_core::WeatherError;

use crate::cache::WeatherCache;
use crate::location::LocationProvider;
use crate::types::UiState;

/// Maximum number of remembered queries.
pub const RECENT_LIMIT: usize = 5;

const FALLBACK_ERROR: &str = "Failed to load weather data";
const EMPTY_CITY_ERROR: &str = "Please enter a city name";
const LOCATION_UNAVAILABLE: &str = "Location not available";

/// Distinct recent queries, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecentQueries {
    entries: VecDeque<String>,
}

impl RecentQueries {
    /// Move `query` to the front, dropping the oldest entry past the limit.
    pub fn push(&mut self, query: &str) {
        self.entries.retain(|q| q != query);
        self.entries.push_front(query.to_string());
        self.entries.truncate(RECENT_LIMIT);
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recent queries followed by `catalog`, without duplicates.
    pub fn suggestions(&self, catalog: &[&str]) -> Vec<String> {
        let mut merged: Vec<String> = Vec::with_capacity(self.entries.len() + catalog.len());
        for candidate in self.entries.iter().map(String::as_str).chain(catalog.iter().copied()) {
            if !merged.iter().any(|m| m == candidate) {
                merged.push(candidate.to_string());
            }
        }
        merged
    }
}

struct SessionInner {
    cache: WeatherCache,
    location: Arc<dyn LocationProvider>,
    state_tx: watch::Sender<UiState>,
    recent_tx: watch::Sender<RecentQueries>,
    generation: Mutex<u64>,
}

impl SessionInner {
    /// Supersede any running load and show Loading.
    fn begin(&self) -> u64 {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.state_tx.send_replace(UiState::Loading);
        *generation
    }

    /// Publish `state` if `generation` is still the latest load.
    fn publish(&self, generation: u64, state: UiState) -> bool {
        let current = self.generation.lock();
        if *current != generation {
            return false;
        }
        self.state_tx.send_replace(state);
        true
    }

    fn remember(&self, query: &str) {
        self.recent_tx.send_modify(|recent| recent.push(query));
    }

    async fn drive(&self, generation: u64, query: String) {
        let mut resolution = self.cache.resolve(&query);
        while let Some(result) = resolution.next().await {
            let state = match result {
                Ok(record) => UiState::Success(record),
                Err(e) => {
                    tracing::warn!("Weather for {} unavailable: {}", query, e);
                    UiState::Error(error_message(&e))
                }
            };
            if !self.publish(generation, state) {
                break;
            }
        }
    }

    async fn locate(&self, generation: u64) {
        match self.location.current_location().await {
            Ok(Some(coordinate)) => {
                let query = coordinate.query();
                tracing::info!("Got location: {}", query);
                if *self.generation.lock() != generation {
                    return;
                }
                self.remember(&query);
                self.drive(generation, query).await;
            }
            Ok(None) => {
                self.publish(generation, UiState::Error(LOCATION_UNAVAILABLE.to_string()));
            }
            Err(e) => {
                tracing::warn!("Location lookup failed: {}", e);
                let e = WeatherError::from(e);
                self.publish(generation, UiState::Error(error_message(&e)));
            }
        }
    }
}

fn error_message(e: &WeatherError) -> String {
    let message = match e {
        WeatherError::Location(inner) => format!("Location error: {}", inner),
        other => other.to_string(),
    };
    if message.trim().is_empty() {
        FALLBACK_ERROR.to_string()
    } else {
        message
    }
}

/// Holds the current [`UiState`] and recent queries for one screen.
pub struct WeatherSession {
    inner: Arc<SessionInner>,
    current: Mutex<Option<AbortHandle>>,
}

impl WeatherSession {
    pub fn new(cache: WeatherCache, location: Arc<dyn LocationProvider>) -> Self {
        let (state_tx, _) = watch::channel(UiState::Loading);
        let (recent_tx, _) = watch::channel(RecentQueries::default());
        Self {
            inner: Arc::new(SessionInner {
                cache,
                location,
                state_tx,
                recent_tx,
                generation: Mutex::new(0),
            }),
            current: Mutex::new(None),
        }
    }

    /// Show weather for `city`, replacing any load in flight.
    ///
    /// Must be called from within a tokio runtime.
    pub fn load_weather(&self, city: &str) {
        let city = city.trim().to_string();
        let generation = self.inner.begin();

        if city.is_empty() {
            self.abort_current();
            self.inner
                .publish(generation, UiState::Error(EMPTY_CITY_ERROR.to_string()));
            return;
        }

        self.inner.remember(&city);
        tracing::info!("Loading weather for {}", city);

        let inner = self.inner.clone();
        self.replace_task(tokio::spawn(async move {
            inner.drive(generation, city).await;
        }));
    }

    /// Show weather for the device location, replacing any load in flight.
    ///
    /// A missing or failed location ends in an error state; there is no
    /// fallback city at this level.
    pub fn load_current_location_weather(&self) {
        let generation = self.inner.begin();
        tracing::info!("Loading weather for current location");

        let inner = self.inner.clone();
        self.replace_task(tokio::spawn(async move {
            inner.locate(generation).await;
        }));
    }

    /// Stop the load in flight, if any. The current state is left as is.
    pub fn cancel(&self) {
        self.abort_current();
    }

    pub fn state(&self) -> UiState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UiState> {
        self.inner.state_tx.subscribe()
    }

    pub fn recent_queries(&self) -> Vec<String> {
        self.inner.recent_tx.borrow().to_vec()
    }

    pub fn subscribe_recent(&self) -> watch::Receiver<RecentQueries> {
        self.inner.recent_tx.subscribe()
    }

    /// Autocomplete entries: recent queries first, then `catalog`.
    pub fn suggestions(&self, catalog: &[&str]) -> Vec<String> {
        self.inner.recent_tx.borrow().suggestions(catalog)
    }

    fn replace_task(&self, handle: tokio::task::JoinHandle<()>) {
        let previous = self.current.lock().replace(handle.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn abort_current(&self) {
        if let Some(previous) = self.current.lock().take() {
            previous.abort();
        }
    }
}

impl Drop for WeatherSession {
    fn drop(&mut self) {
        self.abort_current();
    }
}
