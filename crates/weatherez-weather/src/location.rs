//! Device location lookup.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use weatherez_core::LocationError;

use crate::types::Coordinate;

/// Supplies the device's current coordinate.
///
/// `Ok(None)` means no fix was available; it is not an error.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> Result<Option<Coordinate>, LocationError>;
}

#[async_trait]
impl<T: LocationProvider + ?Sized> LocationProvider for Arc<T> {
    async fn current_location(&self) -> Result<Option<Coordinate>, LocationError> {
        (**self).current_location().await
    }
}

/// Bounds another provider by a timeout. An elapsed lookup reports no location.
pub struct TimeoutLocation<P> {
    inner: P,
    timeout: Duration,
}

impl<P: LocationProvider> TimeoutLocation<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<P: LocationProvider> LocationProvider for TimeoutLocation<P> {
    async fn current_location(&self) -> Result<Option<Coordinate>, LocationError> {
        match tokio::time::timeout(self.timeout, self.inner.current_location()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Location lookup timed out after {:?}", self.timeout);
                Ok(None)
            }
        }
    }
}

/// Provider that always answers with the same coordinate (or none).
#[derive(Debug, Clone, Default)]
pub struct FixedLocation {
    coordinate: Option<Coordinate>,
}

impl FixedLocation {
    pub fn new(coordinate: Option<Coordinate>) -> Self {
        Self { coordinate }
    }
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> Result<Option<Coordinate>, LocationError> {
        Ok(self.coordinate)
    }
}
