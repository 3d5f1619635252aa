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
use prometheus_client::registry::Registry;
use std::collections::BTreeMap;

/// Fields reported by the Ambient Weather API that get a gauge of the same name.
pub const CATALOGUE: &[&str] = &[
    "baromabsin",
    "baromrelin",
    "batt1",
    "batt2",
    "batt3",
    "batt4",
    "batt5",
    "batt6",
    "batt7",
    "batt8",
    "battin",
    "battout",
    "dewPoint",
    "dewPoint1",
    "dewPoint2",
    "dewPoint3",
    "dewPoint4",
    "dewPoint5",
    "dewPoint6",
    "dewPoint7",
    "dewPoint8",
    "dewPointin",
    "dailyrainin",
    "eventrainin",
    "hourlyrainin",
    "feelsLike",
    "feelsLike1",
    "feelsLike2",
    "feelsLike3",
    "feelsLike4",
    "feelsLike5",
    "feelsLike6",
    "feelsLike7",
    "feelsLike8",
    "feelsLikein",
    "humidity",
    "humidity1",
    "humidity2",
    "humidity3",
    "humidity4",
    "humidity5",
    "humidity6",
    "humidity7",
    "humidity8",
    "humidityin",
    "maxdailygust",
    "monthlyrainin",
    "solarradiation",
    "temp1f",
    "temp2f",
    "temp3f",
    "temp4f",
    "temp5f",
    "temp6f",
    "temp7f",
    "temp8f",
    "tempf",
    "tempinf",
    "uv",
    "weeklyrainin",
    "winddir",
    "winddir_avg10m",
    "windgustmph",
    "windspdmph_avg10m",
    "windspeedmph",
    "yearlyrainin",
];

/// Date and free-text fields. These are never numeric gauges.
pub const EXCLUDED: &[&str] = &["dateutc", "date", "tz", "lastRain"];

/// One gauge per catalogue field, labeled only by the MAC address of the station.
#[derive(Debug)]
pub struct DefaultGaugeSet {
    gauges: BTreeMap<&'static str, GaugeFamily>,
}

impl DefaultGaugeSet {
    pub fn new() -> Self {
        DefaultGaugeSet {
            gauges: CATALOGUE.iter().map(|&n| (n, GaugeFamily::default())).collect(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&GaugeFamily> {
        self.gauges.get(field)
    }

    /// Names of every default gauge, without prefix.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.gauges.keys().copied()
    }

    pub fn register(&self, reg: &mut Registry, prefix: &str) {
        for (name, gauge) in &self.gauges {
            reg.register(
                format!("{}{}", prefix, name),
                format!("Value of {} reported by Ambient Weather API", name),
                gauge.clone(),
            );
        }
    }

    /// Set the gauge for a single field. Fields outside the catalogue are skipped.
    pub fn apply(&self, field: &str, mac_address: &str, value: FieldValue<'_>) {
        if EXCLUDED.contains(&field) {
            return;
        }

        match self.gauges.get(field) {
            Some(gauge) => metrics::set_gauge(gauge, &metrics::device_labels(mac_address), mac_address, field, value),
            None => tracing::debug!(
                message = "no default metric defined for api key",
                mac_address = %mac_address,
                api_key = %field,
            ),
        }
    }

    pub fn record(&self, device: &DeviceRecord) {
        for (field, value) in device.fields() {
            self.apply(field, &device.mac_address, value);
        }
    }
}

impl Default for DefaultGaugeSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{DefaultGaugeSet, CATALOGUE, EXCLUDED};
    use crate::client::{DeviceRecord, FieldValue};
    use crate::metrics::{self, device_labels};
    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;
    use serde_json::json;

    #[test]
    fn test_catalogue_names_are_valid() {
        for name in CATALOGUE {
            assert!(metrics::is_valid_metric_name(name), "invalid name {}", name);
            assert!(!EXCLUDED.contains(name));
        }
    }

    #[test]
    fn test_one_gauge_per_field() {
        let defaults = DefaultGaugeSet::new();
        assert_eq!(CATALOGUE.len(), defaults.names().count());
        assert!(defaults.get("tempf").is_some());
        assert!(defaults.get("dateutc").is_none());
        assert!(defaults.get("lastRain").is_none());
    }

    #[test]
    fn test_apply_integer() {
        let defaults = DefaultGaugeSet::new();
        defaults.apply("humidity", "AA:BB:CC", FieldValue::Numeric(55.0));

        let gauge = defaults.get("humidity").unwrap();
        assert_eq!(55.0, gauge.get_or_create(&device_labels("AA:BB:CC")).get());
    }

    #[test]
    fn test_apply_unknown_field() {
        let defaults = DefaultGaugeSet::new();
        let mut reg = Registry::default();
        defaults.register(&mut reg, "");

        let mut before = String::new();
        encode(&mut before, &reg).unwrap();

        defaults.apply("not_a_field", "AA:BB:CC", FieldValue::Numeric(1.0));
        defaults.apply("dateutc", "AA:BB:CC", FieldValue::Numeric(1700000000000.0));
        defaults.apply("tz", "AA:BB:CC", FieldValue::Text("America/New_York"));

        let mut after = String::new();
        encode(&mut after, &reg).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_apply_non_numeric() {
        let defaults = DefaultGaugeSet::new();
        let mut reg = Registry::default();
        defaults.register(&mut reg, "ambient_wx_");

        defaults.apply("uv", "AA:BB:CC", FieldValue::Text("high"));
        defaults.apply("battout", "AA:BB:CC", FieldValue::Unknown("bool"));

        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();
        assert!(!buf.contains(r#"ambient_wx_uv{"#));
        assert!(!buf.contains(r#"ambient_wx_battout{"#));
    }

    #[test]
    fn test_record_device() {
        let defaults = DefaultGaugeSet::new();
        let record: DeviceRecord = serde_json::from_value(json!({
            "macAddress": "AA:BB:CC",
            "lastData": {
                "tempf": 72.5,
                "windspeedmph": 3,
                "dateutc": 1700000000000u64,
                "lastRain": "2023-11-14T22:00:00.000Z",
                "pm25": 12,
            },
        }))
        .unwrap();

        defaults.record(&record);

        let labels = device_labels("AA:BB:CC");
        assert_eq!(72.5, defaults.get("tempf").unwrap().get_or_create(&labels).get());
        assert_eq!(3.0, defaults.get("windspeedmph").unwrap().get_or_create(&labels).get());
    }
}
