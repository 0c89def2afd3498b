//! Weather data layer for WeatherEZ
//!
//! Current conditions from OpenWeatherMap, cached in SQLite and served
//! cache-aside with a ten minute staleness window.

pub mod app;
pub mod cache;
pub mod location;
pub mod provider;
pub mod session;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use app::WeatherApp;
pub use cache::{Clock, Resolution, SystemClock, WeatherCache, STALE_WINDOW};
pub use location::{FixedLocation, LocationProvider, TimeoutLocation};
pub use provider::{OpenWeatherClient, WeatherSource};
pub use session::{RecentQueries, WeatherSession, RECENT_LIMIT};
pub use store::{RecordSubscription, SqliteWeatherStore, WeatherStore};
pub use types::*;
