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

use crate::client::DeviceRecord;
use crate::config::{Config, DeviceConfig, GaugeConfig};
use crate::defaults;
use crate::metrics::{self, GaugeFamily, LabelSet, LABEL_MAC_ADDRESS};
use prometheus_client::registry::Registry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error;
use std::fmt;

/// Reasons a configuration cannot be turned into a set of gauges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    EmptyDeviceIdentity,
    EmptyRawField { mac_address: String },
    EmptyGaugeName { mac_address: String, api_name: String },
    ReservedLabel { gauge: String },
    InvalidMetricName(String),
    InvalidLabelName { gauge: String, label: String },
    DuplicateMapping { mac_address: String, api_name: String, first: String, second: String },
    NameCollision(String),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyDeviceIdentity => write!(f, "device with empty mac_address"),
            Self::EmptyRawField { mac_address } => {
                write!(f, "gauge with empty api_name for device {}", mac_address)
            }
            Self::EmptyGaugeName { mac_address, api_name } => {
                write!(f, "gauge with empty name for {} on device {}", api_name, mac_address)
            }
            Self::ReservedLabel { gauge } => {
                write!(f, "gauge {} sets reserved label {}", gauge, LABEL_MAC_ADDRESS)
            }
            Self::InvalidMetricName(name) => write!(f, "invalid metric name {}", name),
            Self::InvalidLabelName { gauge, label } => {
                write!(f, "invalid label name {} for gauge {}", label, gauge)
            }
            Self::DuplicateMapping {
                mac_address,
                api_name,
                first,
                second,
            } => write!(
                f,
                "{} on device {} is mapped more than once (to {} and {})",
                api_name, mac_address, first, second
            ),
            Self::NameCollision(name) => {
                write!(f, "gauge {} has the same name as a built-in gauge", name)
            }
        }
    }
}

impl error::Error for BuildError {}

/// Resolved destination for a single raw field of a single device.
#[derive(Debug, Clone)]
pub struct Binding {
    gauge: GaugeFamily,
    labels: LabelSet,
}

impl Binding {
    pub fn gauge(&self) -> &GaugeFamily {
        &self.gauge
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Overwrite the value of the series for this binding.
    pub fn apply(&self, value: f64) {
        self.gauge.get_or_create(&self.labels).set(value);
    }
}

#[derive(Debug)]
struct GaugeSchema {
    keys: Vec<String>,
    family: GaugeFamily,
}

impl GaugeSchema {
    fn new(keys: BTreeSet<&str>) -> Self {
        let mut keys: Vec<String> = keys.into_iter().map(String::from).collect();
        keys.push(LABEL_MAC_ADDRESS.to_owned());

        GaugeSchema {
            keys,
            family: GaugeFamily::default(),
        }
    }

    /// Labels for a single rule: every key of the schema, with keys the rule doesn't
    /// set given an empty value and the device identity last. Values are escaped.
    fn resolve(&self, device: &DeviceConfig, rule: &GaugeConfig) -> LabelSet {
        self.keys
            .iter()
            .map(|k| {
                let v = if k == LABEL_MAC_ADDRESS {
                    device.mac_address.as_str()
                } else {
                    rule.labels.get(k).map(String::as_str).unwrap_or_default()
                };

                (k.clone(), metrics::escape_label_value(v))
            })
            .collect()
    }
}

/// Gauges declared by the configuration file and the fields of each device that
/// are written to them.
///
/// Each distinct gauge name gets exactly one metric family. The label keys of that
/// family are the union of the labels of every rule that writes to it, plus
/// `mac_address`. Rules that don't set one of those keys use an empty value for it,
/// which Prometheus treats the same as the label being absent.
#[derive(Debug, Default)]
pub struct GaugeRegistry {
    gauges: BTreeMap<String, GaugeSchema>,
    bindings: HashMap<String, HashMap<String, Binding>>,
}

impl GaugeRegistry {
    /// Validate the configuration and build a gauge for each distinct gauge name in it.
    ///
    /// Fails on the first invalid rule. A raw field may only be mapped once per device:
    /// declaring the same field twice is rejected even if both rules name the same gauge.
    pub fn build(config: &Config, prefix: &str) -> Result<Self, BuildError> {
        let mut schemas: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut seen: HashMap<(&str, &str), &str> = HashMap::new();

        for device in &config.devices {
            if device.mac_address.is_empty() {
                return Err(BuildError::EmptyDeviceIdentity);
            }

            for rule in &device.gauges {
                Self::validate(device, rule, prefix)?;

                let key = (device.mac_address.as_str(), rule.api_name.as_str());
                if let Some(first) = seen.get(&key) {
                    return Err(BuildError::DuplicateMapping {
                        mac_address: device.mac_address.clone(),
                        api_name: rule.api_name.clone(),
                        first: (*first).to_owned(),
                        second: rule.name.clone(),
                    });
                }

                seen.insert(key, rule.name.as_str());
                schemas
                    .entry(rule.name.as_str())
                    .or_default()
                    .extend(rule.labels.keys().map(String::as_str));
            }
        }

        let gauges: BTreeMap<String, GaugeSchema> = schemas
            .into_iter()
            .map(|(name, keys)| (name.to_owned(), GaugeSchema::new(keys)))
            .collect();

        let mut bindings: HashMap<String, HashMap<String, Binding>> = HashMap::new();
        for device in &config.devices {
            let fields = bindings.entry(device.mac_address.clone()).or_default();

            for rule in &device.gauges {
                let schema = &gauges[rule.name.as_str()];
                fields.insert(
                    rule.api_name.clone(),
                    Binding {
                        gauge: schema.family.clone(),
                        labels: schema.resolve(device, rule),
                    },
                );
            }
        }

        bindings.retain(|_, fields| !fields.is_empty());
        Ok(GaugeRegistry { gauges, bindings })
    }

    fn validate(device: &DeviceConfig, rule: &GaugeConfig, prefix: &str) -> Result<(), BuildError> {
        if rule.api_name.is_empty() {
            return Err(BuildError::EmptyRawField {
                mac_address: device.mac_address.clone(),
            });
        }

        if rule.name.is_empty() {
            return Err(BuildError::EmptyGaugeName {
                mac_address: device.mac_address.clone(),
                api_name: rule.api_name.clone(),
            });
        }

        let full_name = format!("{}{}", prefix, rule.name);
        if !metrics::is_valid_metric_name(&full_name) {
            return Err(BuildError::InvalidMetricName(full_name));
        }

        for label in rule.labels.keys() {
            if label == LABEL_MAC_ADDRESS {
                return Err(BuildError::ReservedLabel { gauge: rule.name.clone() });
            }

            if !metrics::is_valid_label_name(label) {
                return Err(BuildError::InvalidLabelName {
                    gauge: rule.name.clone(),
                    label: label.clone(),
                });
            }
        }

        Ok(())
    }

    /// Return true if no device has any custom gauges.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Return true if the device has at least one custom gauge.
    pub fn is_configured(&self, mac_address: &str) -> bool {
        self.bindings.contains_key(mac_address)
    }

    /// Names of every custom gauge, without prefix, in lexicographic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.gauges.keys().map(String::as_str)
    }

    /// Label keys shared by every series of the given gauge.
    pub fn schema(&self, name: &str) -> Option<&[String]> {
        self.gauges.get(name).map(|s| s.keys.as_slice())
    }

    /// Find the gauge and labels a raw field of a device is written to, if any.
    pub fn resolve(&self, mac_address: &str, api_name: &str) -> Option<&Binding> {
        self.bindings.get(mac_address).and_then(|fields| fields.get(api_name))
    }

    pub fn register(&self, reg: &mut Registry, prefix: &str) {
        for (name, schema) in &self.gauges {
            reg.register(
                format!("{}{}", prefix, name),
                format!("Configured gauge {} set from Ambient Weather API fields", name),
                schema.family.clone(),
            );
        }
    }

    /// Write every configured field of the record to its gauge.
    pub fn record(&self, device: &DeviceRecord) {
        let fields = match self.bindings.get(&device.mac_address) {
            Some(f) => f,
            None => {
                tracing::warn!(message = "no config for mac address", mac_address = %device.mac_address);
                return;
            }
        };

        for (api_name, value) in device.fields() {
            if defaults::EXCLUDED.contains(&api_name) {
                continue;
            }

            match fields.get(api_name) {
                Some(b) => metrics::set_gauge(&b.gauge, &b.labels, &device.mac_address, api_name, value),
                None => tracing::debug!(
                    message = "no config for ambient metric",
                    mac_address = %device.mac_address,
                    api_key = %api_name,
                ),
            }
        }
    }
}
