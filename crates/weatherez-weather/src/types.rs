use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

/// Cached weather for one lookup key.
///
/// The key is either a city name or a `"lat,lon"` composite query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub key: String,
    pub temperature: f64,
    pub humidity: i32,
    pub condition: String,
    pub icon: String,
    /// Epoch milliseconds of the fetch that produced this record
    pub last_updated: i64,
}

impl WeatherRecord {
    /// Build a record from an API payload.
    ///
    /// Only the first condition entry is used; an empty list yields empty
    /// condition and icon strings.
    pub fn from_payload(key: &str, payload: &WeatherPayload, now_ms: i64) -> Self {
        let first = payload.weather.first();
        Self {
            key: key.to_string(),
            temperature: payload.main.temp,
            humidity: payload.main.humidity,
            condition: first.map(|w| w.main.clone()).unwrap_or_default(),
            icon: first.map(|w| w.icon.clone()).unwrap_or_default(),
            last_updated: now_ms,
        }
    }

    /// Age of the record relative to `now_ms`, in milliseconds
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_updated)
    }

    /// Local wall-clock time of the last update as `HH:MM`
    pub fn updated_at_hhmm(&self) -> String {
        match Local.timestamp_millis_opt(self.last_updated).single() {
            Some(dt) => dt.format("%H:%M").to_string(),
            None => String::new(),
        }
    }

    /// URL of the condition icon
    pub fn icon_url(&self) -> String {
        icon_url(&self.icon)
    }
}

/// URL of the 2x PNG for an OpenWeatherMap icon code
pub fn icon_url(icon_code: &str) -> String {
    format!("https://openweathermap.org/img/wn/{}@2x.png", icon_code)
}

/// Response body of `GET /weather`
#[derive(Debug, Clone, Deserialize)]
pub struct WeatherPayload {
    pub name: String,
    pub main: MainReadings,
    #[serde(default)]
    pub weather: Vec<ConditionEntry>,
    pub dt: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainReadings {
    pub temp: f64,
    pub humidity: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionEntry {
    #[serde(default)]
    pub id: i32,
    pub main: String,
    #[serde(default)]
    pub description: String,
    pub icon: String,
}

/// Geographic coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Composite `"lat,lon"` query used as both API query and cache key
    pub fn query(&self) -> String {
        format!("{},{}", self.latitude, self.longitude)
    }
}

/// What the presentation layer should show
#[derive(Debug, Clone, PartialEq)]
pub enum UiState {
    Loading,
    Success(WeatherRecord),
    Error(String),
}

impl UiState {
    pub fn is_loading(&self) -> bool {
        matches!(self, UiState::Loading)
    }

    pub fn record(&self) -> Option<&WeatherRecord> {
        match self {
            UiState::Success(record) => Some(record),
            _ => None,
        }
    }
}
