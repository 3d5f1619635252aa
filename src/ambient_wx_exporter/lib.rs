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

//! Prometheus metrics exporter for the Ambient Weather API
//!
//! ## Features
//!
//! `ambient_wx_exporter` fetches the latest observations for every weather station on an
//! [Ambient Weather] account using the [Ambient Weather API] and emits them as Prometheus
//! metrics. Every metric name starts with a configurable prefix (`ambient_wx_` by default)
//! and every series has a `mac_address` label identifying the station.
//!
//! * `ambient_wx_$FIELD{mac_address=$MAC}` - One gauge per well known field reported by
//!   the API (`tempf`, `humidity`, `windspeedmph`, ...). Can be disabled with
//!   `--disable-default-gauges`.
//! * `ambient_wx_$NAME{$LABELS..., mac_address=$MAC}` - Gauges declared in the config file.
//! * `ambient_wx_data_age{mac_address=$MAC}` - Seconds since the station last reported data.
//! * `ambient_wx_time_since_rain{mac_address=$MAC}` - Seconds since the station last recorded rain.
//! * `ambient_wx_device_info{mac_address=$MAC, name=$NAME, location=$LOCATION}` - Station metadata.
//!
//! [Ambient Weather]: https://ambientweather.net/
//! [Ambient Weather API]: https://ambientweather.docs.apiary.io/
//!
//! ## Build
//!
//! `ambient_wx_exporter` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Keys
//!
//! Requests to the Ambient Weather API need an application key and an API key, both of
//! which can be created from your account page on [Ambient Weather]. Pass them as the
//! first two arguments.
//!
//! ```text
//! ./ambient_wx_exporter $APPLICATION_KEY $API_KEY
//! ```
//!
//! ### Custom gauges
//!
//! Fields of a particular station can be exported under a name and labels of your choosing
//! by writing a JSON config file and passing it with `--config-file`. Every field mapped to
//! the same gauge name shares one set of label keys: keys a mapping doesn't set are exported
//! with an empty value.
//!
//! ```json
//! {
//!   "devices": [
//!     {
//!       "mac_address": "00:0E:C6:20:0F:7B",
//!       "gauges": [
//!         {"api_name": "tempf", "name": "temperature", "labels": {"location": "outdoor"}},
//!         {"api_name": "tempinf", "name": "temperature", "labels": {"location": "indoor"}}
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! The exporter refuses to start if a field is mapped more than once for the same station
//! or a gauge would have the same name as one of the built in gauges.
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `9876` at `/metrics`. Once `ambient_wx_exporter`
//! is running, configure scrapes of it by your Prometheus server.
//!
//! ```yaml
//! scrape_configs:
//! - job_name: ambient_wx_exporter
//!   static_configs:
//!   - targets: ['example:9876']
//! ```
//!

pub mod client;
pub mod config;
pub mod defaults;
pub mod freshness;
pub mod http;
pub mod metrics;
pub mod poll;
pub mod registry;
