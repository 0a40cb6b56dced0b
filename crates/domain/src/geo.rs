use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::geolocation::GeolocationSource;

pub const DEFAULT_MAX_SAMPLE_AGE_MS: i64 = 2 * 60 * 1000;
pub const DEFAULT_MAX_FUTURE_SKEW_MS: i64 = 30 * 1000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(DomainError::Validation(
                "latitude must be between -90 and 90".into(),
            ));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(DomainError::Validation(
                "longitude must be between -180 and 180".into(),
            ));
        }
        Ok(())
    }
}

/// A fix produced by the device. Immutable once attached to a request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub sampled_at_ms: i64,
}

impl LocationSample {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Short reference used in out-of-band alerts.
    pub fn maps_reference(&self) -> String {
        format!(
            "https://maps.google.com/?q={:.6},{:.6}",
            self.latitude, self.longitude
        )
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GeolocationFailure {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("location sampling timed out")]
    Timeout,
}

impl GeolocationFailure {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "permission_denied" => Some(Self::PermissionDenied),
            "position_unavailable" | "unavailable" => Some(Self::PositionUnavailable),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LocationPolicy {
    pub max_age_ms: i64,
    pub max_future_skew_ms: i64,
}

impl Default for LocationPolicy {
    fn default() -> Self {
        Self {
            max_age_ms: DEFAULT_MAX_SAMPLE_AGE_MS,
            max_future_skew_ms: DEFAULT_MAX_FUTURE_SKEW_MS,
        }
    }
}

impl LocationPolicy {
    /// Rejects fixes that cannot be trusted to locate the subject right now.
    /// Every rejection is reported as `LocationUnavailable` so the caller
    /// blocks instead of creating a request at a wrong place.
    pub fn check(&self, sample: &LocationSample, now_ms: i64) -> DomainResult<LocationSample> {
        sample
            .point()
            .validate()
            .map_err(|err| DomainError::LocationUnavailable(err.to_string()))?;
        if sample.sampled_at_ms > now_ms.saturating_add(self.max_future_skew_ms) {
            return Err(DomainError::LocationUnavailable(
                "location sample is timestamped in the future".into(),
            ));
        }
        if self.max_age_ms > 0 && now_ms.saturating_sub(sample.sampled_at_ms) > self.max_age_ms {
            return Err(DomainError::LocationUnavailable(
                "location sample is too old".into(),
            ));
        }
        Ok(*sample)
    }
}

/// Samples the source and validates the fix. Never falls back to a default
/// position.
pub async fn sample_location(
    source: &dyn GeolocationSource,
    policy: &LocationPolicy,
    now_ms: i64,
) -> DomainResult<LocationSample> {
    let sample = source.sample().await.map_err(|failure| {
        tracing::warn!(error = %failure, "geolocation sample failed");
        DomainError::LocationUnavailable(failure.to_string())
    })?;
    policy.check(&sample, now_ms)
}
