use crate::defs::{MAX_UPDATE_INTERVAL_SEC, MIN_UPDATE_INTERVAL_SEC};
use crate::errors::ServerError;
use crate::events::{EventSink, ServerEvent};
use crate::feed::DataSource;
use crate::registry::ConnectionRegistry;
use crate::session::Session;
use crate::snapshot::{CurrencySnapshot, SnapshotStore, WeatherSnapshot};

use crossbeam_channel::{Receiver, Sender, select};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Which of the two periodic data feeds a refresher thread serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feed {
    /// Weather conditions.
    Weather,
    /// Exchange rates.
    Currency,
}

impl Feed {
    fn name(self) -> &'static str {
        match self {
            Feed::Weather => "weather",
            Feed::Currency => "currency",
        }
    }
}

/// Periodically pulls weather and currency data and pushes it into every
/// live session.
///
/// Each feed runs on its own thread: wait one interval, fetch, publish. A
/// failed fetch keeps the previous snapshot and is retried on the next
/// tick. Changing the interval restarts the current wait, so the next fetch
/// happens one full new interval after the change.
pub struct DataRefresher {
    source: Arc<dyn DataSource>,
    registry: Arc<ConnectionRegistry<Session>>,
    events: Arc<dyn EventSink>,
    weather: SnapshotStore<WeatherSnapshot>,
    currency: SnapshotStore<CurrencySnapshot>,
    interval_ms: AtomicU64,
    reschedule: Mutex<Vec<Sender<()>>>,
}

impl DataRefresher {
    /// Creates a refresher with an interval of `interval_secs` seconds.
    ///
    /// # Errors
    /// [`ServerError::InvalidUpdateRate`] if the interval is out of range.
    pub fn new(
        source: Arc<dyn DataSource>,
        registry: Arc<ConnectionRegistry<Session>>,
        events: Arc<dyn EventSink>,
        interval_secs: u64,
    ) -> Result<Self, ServerError> {
        validate_interval(interval_secs)?;
        Ok(Self::with_interval(
            source,
            registry,
            events,
            Duration::from_secs(interval_secs),
        ))
    }

    /// Creates a refresher with an arbitrary interval, bypassing the minimum.
    pub(crate) fn with_interval(
        source: Arc<dyn DataSource>,
        registry: Arc<ConnectionRegistry<Session>>,
        events: Arc<dyn EventSink>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            registry,
            events,
            weather: SnapshotStore::default(),
            currency: SnapshotStore::default(),
            interval_ms: AtomicU64::new(
                u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            ),
            reschedule: Mutex::new(Vec::new()),
        }
    }

    /// Latest weather snapshot, used to seed new sessions.
    pub fn latest_weather(&self) -> Arc<WeatherSnapshot> {
        self.weather.get()
    }

    /// Latest currency snapshot, used to seed new sessions.
    pub fn latest_currency(&self) -> Arc<CurrencySnapshot> {
        self.currency.get()
    }

    /// Current refresh interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    /// Changes the refresh interval and restarts both waits.
    ///
    /// # Errors
    /// [`ServerError::InvalidUpdateRate`] if `secs` is out of range; the
    /// previous interval stays in effect.
    pub fn change_update_rate(&self, secs: u64) -> Result<(), ServerError> {
        validate_interval(secs)?;
        self.interval_ms.store(secs * 1000, Ordering::SeqCst);

        let controls = self.reschedule.lock().unwrap_or_else(|p| p.into_inner());
        for control in controls.iter() {
            let _ = control.try_send(());
        }
        self.events.report(ServerEvent::UpdateRateChanged(secs));
        Ok(())
    }

    /// Fetches once from the source and publishes the result.
    ///
    /// Returns `true` if new data was published.
    pub fn refresh(&self, feed: Feed) -> bool {
        let result = match feed {
            Feed::Weather => self.source.fetch_weather().map(|weather| {
                let shared = self.weather.replace(weather);
                for session in self.registry.snapshot() {
                    session.update_weather(Arc::clone(&shared));
                }
                ServerEvent::WeatherUpdated
            }),
            Feed::Currency => self.source.fetch_currency().map(|currency| {
                let shared = self.currency.replace(currency);
                for session in self.registry.snapshot() {
                    session.update_currency(Arc::clone(&shared));
                }
                ServerEvent::CurrencyUpdated
            }),
        };

        match result {
            Ok(event) => {
                self.events.report(event);
                true
            }
            Err(e) => {
                self.events.report(ServerEvent::FetchFailed {
                    source: feed.name(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Starts one thread per feed.
    ///
    /// Each thread fetches immediately, then once per interval, until
    /// `stop` is signalled (its sender dropped).
    pub fn start(self: &Arc<Self>, stop: &Receiver<()>) -> Result<Vec<JoinHandle<()>>, ServerError> {
        [Feed::Weather, Feed::Currency]
            .into_iter()
            .map(|feed| {
                let (control_tx, control_rx) = crossbeam_channel::bounded(1);
                self.reschedule
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(control_tx);

                let refresher = Arc::clone(self);
                let stop = stop.clone();
                thread::Builder::new()
                    .name(format!("{}-refresher", feed.name()))
                    .spawn(move || refresher.run(feed, &control_rx, &stop))
                    .map_err(|e| ServerError::ThreadSpawn(e.to_string()))
            })
            .collect()
    }

    fn run(&self, feed: Feed, control: &Receiver<()>, stop: &Receiver<()>) {
        log::info!("{} refresher started, interval {:?}", feed.name(), self.interval());
        self.refresh(feed);

        loop {
            let wait = self.interval();
            select! {
                recv(stop) -> _ => break,
                recv(control) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    log::debug!("{} refresher rescheduled to {:?}", feed.name(), self.interval());
                }
                default(wait) => {
                    self.refresh(feed);
                }
            }
        }
        log::info!("{} refresher stopped", feed.name());
    }
}

/// Checks `secs` against the accepted refresh interval range.
pub(crate) fn validate_interval(secs: u64) -> Result<(), ServerError> {
    if !(MIN_UPDATE_INTERVAL_SEC..=MAX_UPDATE_INTERVAL_SEC).contains(&secs) {
        return Err(ServerError::InvalidUpdateRate(secs));
    }
    Ok(())
}
