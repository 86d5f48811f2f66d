use crate::errors::FetchError;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Current weather conditions as reported by the weather source.
///
/// Replaced wholesale on every successful refresh; never edited in place.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeatherSnapshot {
    /// Air temperature in degrees Celsius.
    pub temperature: f64,
    /// Wind speed in km/h.
    pub wind_speed: f64,
    /// Wind direction in degrees, `0..360`.
    pub wind_direction: f64,
    /// Time of the observation, milliseconds since the UNIX epoch.
    pub observed_at: u64,
}

/// Exchange rates against the local currency.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurrencySnapshot {
    /// US dollar.
    pub usd: f64,
    /// Euro.
    pub eur: f64,
    /// Pound sterling.
    pub gbp: f64,
    /// One gram of gold.
    pub gold_gram: f64,
    /// Bitcoin.
    pub btc: f64,
    /// Time of the observation, milliseconds since the UNIX epoch.
    pub observed_at: u64,
}

/// A snapshot type that can travel inside a `WTH`/`CUR` frame.
///
/// The wire form is JSON. Decoding is a strict schema check: unknown
/// fields, missing fields and non-numeric values are all rejected, and
/// nothing in the payload is ever interpreted beyond that.
pub trait WirePayload: Sized + Serialize + for<'de> Deserialize<'de> {
    /// Serializes the snapshot for a frame field.
    fn to_payload(&self) -> String {
        // Plain structs of numbers always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decodes a snapshot from a frame field.
    fn from_payload(raw: &str) -> Result<Self, FetchError> {
        serde_json::from_str(raw).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

impl WirePayload for WeatherSnapshot {}
impl WirePayload for CurrencySnapshot {}

/// Holder of the latest value of a snapshot.
///
/// Readers get an `Arc` to an immutable value; writers swap the whole
/// value under a short write lock.
#[derive(Debug, Default)]
pub struct SnapshotStore<T> {
    current: RwLock<Arc<T>>,
}

impl<T> SnapshotStore<T> {
    /// Returns the latest snapshot.
    pub fn get(&self) -> Arc<T> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replaces the snapshot and returns the shared handle to the new value.
    pub fn replace(&self, value: T) -> Arc<T> {
        self.replace_shared(Arc::new(value))
    }

    /// Replaces the snapshot with an already shared value.
    pub fn replace_shared(&self, value: Arc<T>) -> Arc<T> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::clone(&value);
        value
    }
}
