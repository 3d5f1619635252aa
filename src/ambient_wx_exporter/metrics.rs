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
use crate::config::Config;
use crate::defaults::DefaultGaugeSet;
use crate::freshness::FreshnessCalculator;
use crate::registry::{BuildError, GaugeRegistry};
use chrono::{DateTime, Utc};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

pub const DEFAULT_METRIC_PREFIX: &str = "ambient_wx_";
pub const LABEL_MAC_ADDRESS: &str = "mac_address";

const DEVICE_INFO: &str = "device_info";

/// Label keys and values of a single series, in encoding order.
pub type LabelSet = Vec<(String, String)>;

/// A gauge whose label schema is only known at runtime.
pub type GaugeFamily = Family<LabelSet, Gauge<f64, AtomicU64>>;

/// Label set for gauges identified only by the station.
pub fn device_labels(mac_address: &str) -> LabelSet {
    vec![(LABEL_MAC_ADDRESS.to_owned(), escape_label_value(mac_address))]
}

/// Escape a label value for the text exposition format.
///
/// The encoder writes label values as-is, so backslashes, double quotes and line
/// feeds must be escaped before a value is stored in a label set. Otherwise a
/// single station name can make the whole scrape unparseable.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Set a gauge from a raw field value, logging and skipping anything non-numeric.
pub(crate) fn set_gauge(gauge: &GaugeFamily, labels: &LabelSet, mac_address: &str, field: &str, value: FieldValue<'_>) {
    match value {
        FieldValue::Numeric(v) => {
            gauge.get_or_create(labels).set(v);
        }
        other => {
            tracing::warn!(
                message = "unhandled field value type",
                mac_address = %mac_address,
                api_key = %field,
                value = %other,
            );
        }
    }
}

/// Return true if `name` can be used as a Prometheus metric name.
pub(crate) fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        }
        _ => false,
    }
}

/// Return true if `name` can be used as a Prometheus label name.
pub(crate) fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if (c.is_ascii_alphabetic() || c == '_') && !name.starts_with("__") => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DeviceInfoLabels {
    mac_address: String,
    name: String,
    location: String,
}

/// Options that affect which metrics are created and what they are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricOptions {
    pub prefix: String,
    pub default_gauges: bool,
}

impl Default for MetricOptions {
    fn default() -> Self {
        MetricOptions {
            prefix: DEFAULT_METRIC_PREFIX.to_owned(),
            default_gauges: true,
        }
    }
}

/// Every gauge exported for the weather stations on an account.
///
/// Combines the per-device gauges from the configuration file, the catalogue of
/// default gauges (unless disabled), the data freshness gauges and a device
/// information gauge. All metrics are created and registered by
/// `ExporterMetrics::new()` and never change shape after that: only their values
/// are updated by `ExporterMetrics::record()`.
#[derive(Debug)]
pub struct ExporterMetrics {
    custom: GaugeRegistry,
    defaults: Option<DefaultGaugeSet>,
    freshness: FreshnessCalculator,
    device_info: Family<DeviceInfoLabels, Gauge>,
}

impl ExporterMetrics {
    /// Build all gauges and register them with the provided `Registry`.
    ///
    /// Nothing is registered if the configuration is invalid, if a custom gauge
    /// would share a name with one of the built-in gauges, or if the prefix would
    /// make any metric name invalid.
    pub fn new(config: &Config, opts: &MetricOptions, reg: &mut Registry) -> Result<Self, BuildError> {
        let custom = GaugeRegistry::build(config, &opts.prefix)?;
        let defaults = if opts.default_gauges {
            Some(DefaultGaugeSet::new())
        } else {
            None
        };
        let freshness = FreshnessCalculator::new();

        let mut reserved: Vec<&str> = vec![DEVICE_INFO];
        reserved.extend(freshness.names());
        if let Some(d) = &defaults {
            reserved.extend(d.names());
        }

        if let Some(name) = custom.names().find(|n| reserved.contains(n)) {
            return Err(BuildError::NameCollision(name.to_owned()));
        }

        if let Some(name) = reserved
            .iter()
            .map(|n| format!("{}{}", opts.prefix, n))
            .find(|n| !is_valid_metric_name(n))
        {
            return Err(BuildError::InvalidMetricName(name));
        }

        custom.register(reg, &opts.prefix);
        if let Some(d) = &defaults {
            d.register(reg, &opts.prefix);
        }
        freshness.register(reg, &opts.prefix);

        let device_info = Family::<DeviceInfoLabels, Gauge>::default();
        reg.register(
            format!("{}{}", opts.prefix, DEVICE_INFO),
            "Weather station metadata",
            device_info.clone(),
        );

        Ok(ExporterMetrics {
            custom,
            defaults,
            freshness,
            device_info,
        })
    }

    pub fn custom(&self) -> &GaugeRegistry {
        &self.custom
    }

    pub fn defaults(&self) -> Option<&DefaultGaugeSet> {
        self.defaults.as_ref()
    }

    pub fn freshness(&self) -> &FreshnessCalculator {
        &self.freshness
    }

    /// Update every gauge that a record for a single device has values for.
    pub fn record(&self, device: &DeviceRecord, now: DateTime<Utc>) {
        tracing::debug!(message = "recording device metrics", mac_address = %device.mac_address);

        if !self.custom.is_empty() {
            self.custom.record(device);
        }

        if let Some(d) = &self.defaults {
            d.record(device);
        }

        self.freshness.record(device, now);
        self.record_info(device);
    }

    /// Update gauges for every device returned by a single API request.
    pub fn record_all(&self, devices: &[DeviceRecord], now: DateTime<Utc>) {
        for device in devices {
            self.record(device, now);
        }
    }

    fn record_info(&self, device: &DeviceRecord) {
        let info = device.info.as_ref();
        let name = info.and_then(|i| i.name.as_deref()).unwrap_or_default();
        let location = info.and_then(|i| i.location.as_deref()).unwrap_or_default();

        self.device_info
            .get_or_create(&DeviceInfoLabels {
                mac_address: escape_label_value(&device.mac_address),
                name: escape_label_value(name),
                location: escape_label_value(location),
            })
            .set(1);
    }
}
