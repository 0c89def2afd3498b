//! Application wiring and the default-city policy.

use std::sync::Arc;

use weatherez_core::{AppError, Config, ConfigError, WeatherError};

use crate::cache::WeatherCache;
use crate::location::{LocationProvider, TimeoutLocation};
use crate::provider::OpenWeatherClient;
use crate::session::WeatherSession;
use crate::store::SqliteWeatherStore;

/// Wires configuration, storage, network and location into one session.
pub struct WeatherApp {
    session: WeatherSession,
    default_city: String,
}

impl WeatherApp {
    /// Build the application from `config`, opening the on-disk store.
    pub fn from_config(
        config: &Config,
        location: Arc<dyn LocationProvider>,
    ) -> Result<Self, AppError> {
        let validation = config.validate();
        if !validation.is_valid() {
            return Err(ConfigError::Invalid(validation.error_summary()).into());
        }

        std::fs::create_dir_all(&config.config_dir)?;
        let database_path = config.database_path();
        tracing::info!("Opening weather store at {}", database_path.display());
        let store = Arc::new(SqliteWeatherStore::open(&database_path)?);

        let weather = &config.weather;
        let api_key = weather.resolved_api_key()?;
        let client = OpenWeatherClient::with_base_url(&weather.base_url, weather.request_timeout())
            .map_err(|e| AppError::Weather(WeatherError::Fetch(e)))?;

        let cache = WeatherCache::new(store, Arc::new(client), weather.units, &api_key)
            .with_stale_window(weather.stale_window());
        let location: Arc<dyn LocationProvider> =
            Arc::new(TimeoutLocation::new(location, weather.location_timeout()));

        Ok(Self::new(
            WeatherSession::new(cache, location),
            &weather.default_city,
        ))
    }

    pub fn new(session: WeatherSession, default_city: &str) -> Self {
        Self {
            session,
            default_city: default_city.to_string(),
        }
    }

    pub fn session(&self) -> &WeatherSession {
        &self.session
    }

    pub fn default_city(&self) -> &str {
        &self.default_city
    }

    /// First launch: without location permission, show the default city.
    pub fn on_cold_start(&self, has_permission: bool) {
        if !has_permission {
            tracing::info!("No location permission, showing {}", self.default_city);
            self.session.load_weather(&self.default_city);
        }
    }

    /// Outcome of the permission prompt.
    pub fn on_permission_result(&self, granted: bool) {
        if granted {
            self.session.load_current_location_weather();
        } else {
            tracing::info!("Location permission denied, showing {}", self.default_city);
            self.session.load_weather(&self.default_city);
        }
    }
}
