// ambient_wx_exporter - Prometheus metrics exporter for the Ambient Weather API
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::client::{ClientError, DeviceRecord, DeviceSource};
use crate::metrics::ExporterMetrics;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Level};

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Result of a single request for device records, classified by what the
/// poll loop should do about it.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(Vec<DeviceRecord>),
    Transient(ClientError),
    Fatal(ClientError),
}

impl From<Result<Vec<DeviceRecord>, ClientError>> for FetchOutcome {
    fn from(res: Result<Vec<DeviceRecord>, ClientError>) -> Self {
        match res {
            Ok(devices) => FetchOutcome::Success(devices),
            Err(e) if e.is_transient() => FetchOutcome::Transient(e),
            Err(e) => FetchOutcome::Fatal(e),
        }
    }
}

/// Periodically fetch records for every device and update their metrics.
///
/// Cycles start on a fixed period. A transient error from the API is retried
/// once after a short backoff, any other error abandons the cycle. Gauges keep
/// their previous values when a cycle is abandoned.
pub struct PollLoop<S> {
    source: S,
    metrics: Arc<ExporterMetrics>,
    period: Duration,
    start: Option<Instant>,
}

impl<S> PollLoop<S>
where
    S: DeviceSource,
{
    pub fn new(source: S, metrics: Arc<ExporterMetrics>, period: Duration) -> Self {
        PollLoop {
            source,
            metrics,
            period,
            start: None,
        }
    }

    /// Wait one full period before the first cycle instead of starting immediately.
    pub fn delay_first_cycle(mut self) -> Self {
        self.start = Some(Instant::now() + self.period);
        self
    }

    /// Run cycles until `shutdown` completes.
    ///
    /// # Panics
    ///
    /// If the period is zero.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let start = self.start.unwrap_or_else(Instant::now);
        let mut interval = tokio::time::interval_at(start, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(message = "device polling started", period_secs = self.period.as_secs());

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                res = self.cycle().instrument(tracing::span!(Level::DEBUG, "ambient_devices")) => match res {
                    Ok(n) => tracing::info!(message = "recorded device metrics", devices = n),
                    Err(e) => tracing::error!(
                        message = "unrecoverable error from Ambient API, skipping cycle",
                        error = %e,
                    ),
                },
            }
        }

        tracing::info!("device polling stopped");
    }

    /// Fetch records for every device, retrying once if needed, and record them.
    ///
    /// Returns the number of devices recorded.
    pub async fn cycle(&self) -> Result<usize, ClientError> {
        let devices = self.fetch().await?;
        self.metrics.record_all(&devices, Utc::now());
        Ok(devices.len())
    }

    async fn fetch(&self) -> Result<Vec<DeviceRecord>, ClientError> {
        match FetchOutcome::from(self.source.devices().await) {
            FetchOutcome::Success(devices) => Ok(devices),
            FetchOutcome::Fatal(e) => Err(e),
            FetchOutcome::Transient(e) => {
                tracing::warn!(
                    message = "transient error from Ambient API, retrying",
                    error = %e,
                    backoff_ms = RETRY_BACKOFF.as_millis() as u64,
                );

                tokio::time::sleep(RETRY_BACKOFF).await;
                self.source.devices().await
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{FetchOutcome, PollLoop, RETRY_BACKOFF};
    use crate::client::{ClientError, DeviceRecord, DeviceSource};
    use crate::config::{Config, DeviceConfig, GaugeConfig};
    use crate::metrics::{ExporterMetrics, MetricOptions};
    use prometheus_client::registry::Registry;
    use reqwest::StatusCode;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;

    struct FakeSource {
        responses: Mutex<VecDeque<Result<Vec<DeviceRecord>, ClientError>>>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(responses: Vec<Result<Vec<DeviceRecord>, ClientError>>) -> Self {
            FakeSource {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DeviceSource for Arc<FakeSource> {
        async fn devices(&self) -> Result<Vec<DeviceRecord>, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or(Err(ClientError::Status(StatusCode::INTERNAL_SERVER_ERROR)))
        }
    }

    fn devices(tempf: f64) -> Vec<DeviceRecord> {
        vec![serde_json::from_value(json!({
            "macAddress": "AA:BB:CC",
            "lastData": {"tempf": tempf, "humidity": 55},
        }))
        .unwrap()]
    }

    fn status(code: StatusCode) -> Result<Vec<DeviceRecord>, ClientError> {
        Err(ClientError::Status(code))
    }

    fn metrics() -> Arc<ExporterMetrics> {
        let config = Config {
            devices: vec![DeviceConfig {
                mac_address: "AA:BB:CC".to_owned(),
                gauges: vec![GaugeConfig {
                    api_name: "tempf".to_owned(),
                    name: "outdoor_temp".to_owned(),
                    labels: [("unit".to_owned(), "F".to_owned())].into_iter().collect(),
                }],
            }],
        };

        let mut reg = Registry::default();
        Arc::new(ExporterMetrics::new(&config, &MetricOptions::default(), &mut reg).unwrap())
    }

    fn outdoor_temp(metrics: &ExporterMetrics) -> f64 {
        let binding = metrics.custom().resolve("AA:BB:CC", "tempf").unwrap();
        binding.gauge().get_or_create(binding.labels()).get()
    }

    #[test]
    fn test_fetch_outcome() {
        let empty: Result<Vec<DeviceRecord>, ClientError> = Ok(vec![]);
        assert!(matches!(FetchOutcome::from(empty), FetchOutcome::Success(_)));
        assert!(matches!(
            FetchOutcome::from(status(StatusCode::TOO_MANY_REQUESTS)),
            FetchOutcome::Transient(_)
        ));
        assert!(matches!(
            FetchOutcome::from(status(StatusCode::SERVICE_UNAVAILABLE)),
            FetchOutcome::Transient(_)
        ));
        assert!(matches!(
            FetchOutcome::from(status(StatusCode::INTERNAL_SERVER_ERROR)),
            FetchOutcome::Fatal(_)
        ));
        assert!(matches!(
            FetchOutcome::from(Err(ClientError::Unauthorized(StatusCode::UNAUTHORIZED))),
            FetchOutcome::Fatal(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_success_fetches_once() {
        let source = Arc::new(FakeSource::new(vec![Ok(devices(72.5)), Ok(devices(10.0))]));
        let metrics = metrics();
        let poll = PollLoop::new(source.clone(), metrics.clone(), Duration::from_secs(60));

        assert_eq!(1, poll.cycle().await.unwrap());
        assert_eq!(1, source.calls());
        assert_eq!(72.5, outdoor_temp(&metrics));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_retries_rate_limit_once() {
        let source = Arc::new(FakeSource::new(vec![
            status(StatusCode::TOO_MANY_REQUESTS),
            Ok(devices(72.5)),
            Ok(devices(10.0)),
        ]));
        let metrics = metrics();
        let poll = PollLoop::new(source.clone(), metrics.clone(), Duration::from_secs(60));

        let start = Instant::now();
        assert_eq!(1, poll.cycle().await.unwrap());
        assert!(start.elapsed() >= RETRY_BACKOFF);
        assert_eq!(2, source.calls());
        assert_eq!(72.5, outdoor_temp(&metrics));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_retry_fails() {
        let source = Arc::new(FakeSource::new(vec![
            status(StatusCode::BAD_GATEWAY),
            status(StatusCode::TOO_MANY_REQUESTS),
            Ok(devices(72.5)),
        ]));
        let metrics = metrics();
        let poll = PollLoop::new(source.clone(), metrics.clone(), Duration::from_secs(60));

        let res = poll.cycle().await;
        assert!(matches!(res, Err(ClientError::Status(s)) if s == StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(2, source.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_fatal_does_not_retry() {
        let source = Arc::new(FakeSource::new(vec![
            status(StatusCode::INTERNAL_SERVER_ERROR),
            Ok(devices(72.5)),
        ]));
        let metrics = metrics();
        let poll = PollLoop::new(source.clone(), metrics.clone(), Duration::from_secs(60));

        let res = poll.cycle().await;
        assert!(matches!(res, Err(ClientError::Status(s)) if s == StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(1, source.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_keeps_previous_values() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(devices(72.5)),
            status(StatusCode::INTERNAL_SERVER_ERROR),
        ]));
        let metrics = metrics();
        let poll = PollLoop::new(source.clone(), metrics.clone(), Duration::from_secs(60));

        poll.cycle().await.unwrap();
        assert!(poll.cycle().await.is_err());
        assert_eq!(72.5, outdoor_temp(&metrics));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(devices(1.0)),
            Ok(devices(2.0)),
            Ok(devices(3.0)),
            Ok(devices(4.0)),
        ]));
        let metrics = metrics();
        let poll = PollLoop::new(source.clone(), metrics.clone(), Duration::from_secs(60));

        // Cycles at 0s, 60s and 120s, stopped before the one at 180s
        poll.run(tokio::time::sleep(Duration::from_secs(150))).await;

        assert_eq!(3, source.calls());
        assert_eq!(3.0, outdoor_temp(&metrics));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_delayed_first_cycle() {
        let source = Arc::new(FakeSource::new(vec![Ok(devices(1.0))]));
        let metrics = metrics();
        let poll = PollLoop::new(source.clone(), metrics.clone(), Duration::from_secs(60)).delay_first_cycle();

        poll.run(tokio::time::sleep(Duration::from_secs(30))).await;
        assert_eq!(0, source.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff() {
        let source = Arc::new(FakeSource::new(vec![
            status(StatusCode::SERVICE_UNAVAILABLE),
            Ok(devices(72.5)),
        ]));
        let metrics = metrics();
        let poll = PollLoop::new(source.clone(), metrics.clone(), Duration::from_secs(60));

        poll.run(tokio::time::sleep(Duration::from_millis(500))).await;
        assert_eq!(1, source.calls());
    }
}
