use crate::geo::{GeolocationFailure, LocationSample};
use crate::ports::BoxFuture;

pub trait GeolocationSource: Send + Sync {
    fn sample(&self) -> BoxFuture<'_, Result<LocationSample, GeolocationFailure>>;
}
