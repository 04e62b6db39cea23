//! Simulated tank backend.
//!
//! Sensor values are a pure function of `(sensor_id, sequence)`: a daily
//! cycle around a per-metric baseline plus deterministic noise. Live
//! sessions and history pages therefore always agree, across restarts too,
//! and the sequence number of a reading is its slot since the epoch.
//!
//! Faults are injected with the configured probabilities: live readings
//! that are never delivered, dropped sessions and failing history pages.

use std::f64::consts::TAU;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tracing::debug;

use tanksync_core::{
    Credential, Error, FeedEvent, FeedStream, HistorySource, IdentityProvider, LiveFeed, Page,
    PageCursor, PageRequest, Result, infer_metric,
};
use tanksync_types::{Metric, Reading, Timestamp};

use crate::config::SimulationConfig;

const DAY_MS: i64 = 86_400_000;

/// Baseline, daily amplitude and noise for a metric.
fn profile(metric: Option<Metric>) -> (f64, f64, f64) {
    match metric {
        Some(Metric::Temperature) => (25.0, 3.4, 0.2),
        Some(Metric::Ph) => (7.0, 0.45, 0.05),
        Some(Metric::Oxygen) => (8.0, 3.5, 0.3),
        Some(Metric::WaterLevel) => (92.0, 6.0, 0.5),
        _ => (0.0, 1.0, 0.1),
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// FNV-1a over the sensor id.
fn sensor_seed(sensor_id: &str) -> u64 {
    sensor_id.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn chance(probability: f64) -> bool {
    probability > 0.0 && rand::random::<f64>() < probability
}

/// Backend serving every sensor id from one synthetic model.
#[derive(Debug, Clone)]
pub struct TankSimulator {
    config: SimulationConfig,
}

impl TankSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    fn interval_ms(&self) -> i64 {
        i64::try_from(self.config.interval_ms).unwrap_or(i64::MAX).max(1)
    }

    /// Sequence of the newest reading produced at or before `ts`.
    pub fn sequence_at(&self, ts: Timestamp) -> u64 {
        u64::try_from(ts.as_millis().div_euclid(self.interval_ms())).unwrap_or(0)
    }

    /// Sequence of the newest reading produced so far.
    pub fn current_sequence(&self) -> u64 {
        self.sequence_at(Timestamp::now())
    }

    /// When reading `sequence` is produced.
    pub fn timestamp_of(&self, sequence: u64) -> Timestamp {
        let seq = i64::try_from(sequence).unwrap_or(i64::MAX);
        Timestamp::from_millis(seq.saturating_mul(self.interval_ms()))
    }

    /// The reading a sensor reports at `sequence`.
    pub fn reading(&self, sensor_id: &str, sequence: u64) -> Reading {
        let timestamp = self.timestamp_of(sequence);
        let seed = sensor_seed(sensor_id);
        let (baseline, amplitude, noise) = profile(infer_metric(sensor_id));

        let phase = (seed % 1_000) as f64 / 1_000.0 * TAU;
        let day = timestamp.as_millis().rem_euclid(DAY_MS) as f64 / DAY_MS as f64;
        let jitter = (splitmix64(seed ^ sequence) >> 11) as f64 / (1u64 << 53) as f64;

        let value = baseline + amplitude * (day * TAU + phase).sin() + noise * (jitter * 2.0 - 1.0);
        Reading::new(sensor_id, sequence, timestamp, (value * 100.0).round() / 100.0)
    }

    fn check(&self, credential: &Credential) -> Result<()> {
        if credential.expose() == self.config.token {
            Ok(())
        } else {
            Err(Error::unauthorized("token rejected by simulator"))
        }
    }

    async fn next_event(&self, sensor_id: &str, mut sequence: u64) -> Option<(Result<FeedEvent>, Option<u64>)> {
        loop {
            let wait = self.timestamp_of(sequence).as_millis() - Timestamp::now().as_millis();
            if wait > 0 {
                tokio::time::sleep(Duration::from_millis(wait as u64)).await;
            }
            if chance(self.config.disconnect_probability) {
                debug!(sensor = %sensor_id, sequence, "Simulating disconnect");
                let error = Error::transient("live feed", "simulated disconnect");
                return Some((Err(error), None));
            }
            if chance(self.config.drop_probability) {
                debug!(sensor = %sensor_id, sequence, "Simulating lost reading");
                sequence += 1;
                continue;
            }
            let reading = self.reading(sensor_id, sequence);
            return Some((Ok(FeedEvent::Reading(reading)), Some(sequence + 1)));
        }
    }
}

#[async_trait]
impl LiveFeed for TankSimulator {
    async fn subscribe(&self, sensor_id: &str, credential: &Credential) -> Result<FeedStream> {
        self.check(credential)?;

        let simulator = self.clone();
        let sensor_id = sensor_id.to_string();
        let start = self.current_sequence() + 1;

        let readings = stream::unfold(Some(start), move |next| {
            let simulator = simulator.clone();
            let sensor_id = sensor_id.clone();
            async move { simulator.next_event(&sensor_id, next?).await }
        });
        Ok(stream::once(async { Ok(FeedEvent::CaughtUp) })
            .chain(readings)
            .boxed())
    }
}

#[async_trait]
impl HistorySource for TankSimulator {
    async fn fetch_page(
        &self,
        sensor_id: &str,
        request: PageRequest,
        credential: &Credential,
    ) -> Result<Page> {
        self.check(credential)?;
        if chance(self.config.history_failure_probability) {
            return Err(Error::transient("fetch_page", "simulated backend timeout"));
        }

        let from = match &request.cursor {
            Some(cursor) => cursor
                .as_str()
                .parse::<u64>()
                .map_err(|_| Error::invalid_range(format!("bad page cursor '{}'", cursor.as_str())))?,
            None => request.range.first,
        };
        let end = request.range.last.min(self.current_sequence());
        if from > end {
            return Ok(Page::default());
        }

        let page_size = self.config.page_size.max(1) as u64;
        let upto = end.min(from.saturating_add(page_size - 1));
        let readings = (from..=upto).map(|seq| self.reading(sensor_id, seq)).collect();
        let next = (upto < end).then(|| PageCursor::new((upto + 1).to_string()));

        Ok(Page { readings, next })
    }
}

#[async_trait]
impl IdentityProvider for TankSimulator {
    async fn credential(&self) -> Result<Credential> {
        Ok(Credential::new(self.config.token.clone()))
    }
}
