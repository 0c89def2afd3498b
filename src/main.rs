use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use weatherez_core::Config;
use weatherez_weather::{FixedLocation, UiState, WeatherApp};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize core
    weatherez_core::init()?;

    let (config, _) = Config::load_validated()?;

    // No location services on the command line.
    let app = WeatherApp::from_config(&config, Arc::new(FixedLocation::default()))
        .map_err(|e| anyhow::anyhow!("{} ({})", e.user_message(), e))?;

    tracing::info!("WeatherEZ started");

    let city = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if city.trim().is_empty() {
        app.on_cold_start(false);
    } else {
        app.session().load_weather(&city);
    }

    let mut states = app.session().subscribe();
    let timeout = config.weather.request_timeout() + Duration::from_secs(5);
    let state = tokio::time::timeout(timeout, states.wait_for(|s| !s.is_loading()))
        .await
        .context("Timed out waiting for weather")?
        .context("Weather session closed")?
        .clone();

    match state {
        UiState::Success(record) => {
            println!("{}", record.key);
            println!("  Temperature: {:.1}°", record.temperature);
            println!("  Humidity:    {}%", record.humidity);
            println!("  Conditions:  {}", record.condition);
            println!("  Icon:        {}", record.icon_url());
            println!("  Updated:     {}", record.updated_at_hhmm());
        }
        UiState::Error(message) => anyhow::bail!(message),
        UiState::Loading => {}
    }

    Ok(())
}
