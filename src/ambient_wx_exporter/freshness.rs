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

use crate::client::{DeviceRecord, FieldValue};
use crate::metrics::{self, GaugeFamily};
use chrono::{DateTime, NaiveDateTime, ParseResult, TimeZone, Utc};
use prometheus_client::registry::Registry;

/// Time of the most recent observation, epoch milliseconds.
pub const FIELD_DATE_UTC: &str = "dateutc";
/// Time of the most recent rain event, e.g. `2023-11-14T22:00:00.000Z`.
pub const FIELD_LAST_RAIN: &str = "lastRain";

const DATA_AGE: &str = "data_age";
const RAIN_AGE: &str = "time_since_rain";
const LAST_RAIN_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Ages computed from a single device record. `None` when the record didn't
/// contain a usable timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FreshnessState {
    pub data_age_seconds: Option<f64>,
    pub rain_age_seconds: Option<f64>,
}

/// Seconds between `now` and an observation timestamp in epoch milliseconds.
pub fn data_age(date_utc_millis: f64, now: DateTime<Utc>) -> f64 {
    (now.timestamp_millis() as f64 - date_utc_millis) / 1000.0
}

/// Whole seconds between `now` and a last rain timestamp. Negative if the
/// timestamp is in the future.
pub fn rain_age(last_rain: &str, now: DateTime<Utc>) -> ParseResult<f64> {
    let parsed = NaiveDateTime::parse_from_str(last_rain, LAST_RAIN_FORMAT)?;
    let parsed = Utc.from_utc_datetime(&parsed);
    Ok((now.timestamp() - parsed.timestamp()) as f64)
}

/// Gauges for how stale the data for each station is.
#[derive(Debug, Default)]
pub struct FreshnessCalculator {
    data_age: GaugeFamily,
    rain_age: GaugeFamily,
}

impl FreshnessCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_age(&self) -> &GaugeFamily {
        &self.data_age
    }

    pub fn rain_age(&self) -> &GaugeFamily {
        &self.rain_age
    }

    /// Names of the freshness gauges, without prefix.
    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        [DATA_AGE, RAIN_AGE].into_iter()
    }

    pub fn register(&self, reg: &mut Registry, prefix: &str) {
        reg.register(
            format!("{}{}", prefix, DATA_AGE),
            "Seconds since the station last reported data",
            self.data_age.clone(),
        );
        reg.register(
            format!("{}{}", prefix, RAIN_AGE),
            "Seconds since the station last recorded rain",
            self.rain_age.clone(),
        );
    }

    /// Compute both ages for a device and set their gauges.
    ///
    /// A missing or malformed timestamp leaves the corresponding gauge untouched
    /// so it keeps the value from the last successful update.
    pub fn record(&self, device: &DeviceRecord, now: DateTime<Utc>) -> FreshnessState {
        let labels = metrics::device_labels(&device.mac_address);
        let mut state = FreshnessState::default();

        match device.field(FIELD_DATE_UTC) {
            Some(FieldValue::Numeric(millis)) => {
                let age = data_age(millis, now);
                self.data_age.get_or_create(&labels).set(age);
                state.data_age_seconds = Some(age);
            }
            Some(other) => {
                tracing::warn!(
                    message = "unexpected observation timestamp",
                    mac_address = %device.mac_address,
                    timestamp = %other,
                );
            }
            None => {}
        }

        match device.field(FIELD_LAST_RAIN) {
            Some(FieldValue::Text(raw)) => match rain_age(raw, now) {
                Ok(age) => {
                    self.rain_age.get_or_create(&labels).set(age);
                    state.rain_age_seconds = Some(age);
                }
                Err(e) => {
                    tracing::warn!(
                        message = "unable to parse last rain timestamp",
                        mac_address = %device.mac_address,
                        timestamp = %raw,
                        error = %e,
                    );
                }
            },
            Some(other) => {
                tracing::warn!(
                    message = "unexpected last rain timestamp",
                    mac_address = %device.mac_address,
                    timestamp = %other,
                );
            }
            None => {}
        }

        state
    }
}
