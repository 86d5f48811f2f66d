use crate::errors::{ConfigError, FetchError};
use crate::snapshot::{CurrencySnapshot, WeatherSnapshot};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, LogNormal, Normal};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// External provider of weather and currency data.
///
/// Both calls may block on network I/O; they are only ever invoked from
/// the refresher threads, never from a session.
pub trait DataSource: Send + Sync {
    /// Pulls the current weather.
    fn fetch_weather(&self) -> Result<WeatherSnapshot, FetchError>;

    /// Pulls the current exchange rates.
    fn fetch_currency(&self) -> Result<CurrencySnapshot, FetchError>;
}

/// Random-walk data source for demos and local runs.
///
/// Weather drifts by normally distributed steps; every exchange rate is
/// multiplied by a log-normal factor on each fetch, so rates stay positive.
#[derive(Debug)]
pub struct SimulatedFeed {
    volatility: f64,
    state: Mutex<(WeatherSnapshot, CurrencySnapshot)>,
}

impl SimulatedFeed {
    /// Creates a feed starting from typical values.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] if `volatility` is outside `(0, 1]`.
    pub fn new(volatility: f64) -> Result<Self, ConfigError> {
        if !(volatility > 0.0 && volatility <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "feed volatility must be in (0, 1], got {}",
                volatility
            )));
        }

        let weather = WeatherSnapshot {
            temperature: 18.0,
            wind_speed: 10.0,
            wind_direction: 180.0,
            observed_at: now_millis(),
        };
        let currency = CurrencySnapshot {
            usd: 32.5,
            eur: 35.1,
            gbp: 41.0,
            gold_gram: 2450.0,
            btc: 2_100_000.0,
            observed_at: now_millis(),
        };

        Ok(Self {
            volatility,
            state: Mutex::new((weather, currency)),
        })
    }
}

impl DataSource for SimulatedFeed {
    fn fetch_weather(&self) -> Result<WeatherSnapshot, FetchError> {
        let step = Normal::new(0.0, self.volatility * 10.0)
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        let mut rng = StdRng::from_entropy();

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let weather = &mut state.0;
        weather.temperature = (weather.temperature + step.sample(&mut rng)).clamp(-30.0, 50.0);
        weather.wind_speed = (weather.wind_speed + step.sample(&mut rng)).max(0.0);
        weather.wind_direction =
            (weather.wind_direction + step.sample(&mut rng) * 5.0).rem_euclid(360.0);
        weather.observed_at = now_millis();

        Ok(weather.clone())
    }

    fn fetch_currency(&self) -> Result<CurrencySnapshot, FetchError> {
        let factor = LogNormal::new(0.0, self.volatility / 10.0)
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        let mut rng = StdRng::from_entropy();

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let currency = &mut state.1;
        for rate in [
            &mut currency.usd,
            &mut currency.eur,
            &mut currency.gbp,
            &mut currency.gold_gram,
            &mut currency.btc,
        ] {
            *rate = round4(*rate * factor.sample(&mut rng));
        }
        currency.observed_at = now_millis();

        Ok(currency.clone())
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
