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

use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error;
use std::fmt;
use std::future::Future;

#[derive(Debug)]
pub enum ClientError {
    Internal(reqwest::Error),
    InvalidUrl(String),
    Unauthorized(StatusCode),
    Status(StatusCode),
}

impl ClientError {
    /// Statuses the API returns when it is rate limiting us or briefly overloaded.
    const TRANSIENT: [StatusCode; 3] = [
        StatusCode::TOO_MANY_REQUESTS,
        StatusCode::BAD_GATEWAY,
        StatusCode::SERVICE_UNAVAILABLE,
    ];

    /// Return true if the request that caused this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status(status) => Self::TRANSIENT.contains(status),
            _ => false,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(e) => write!(f, "{}", e),
            Self::InvalidUrl(u) => write!(f, "invalid API URL {}", u),
            Self::Unauthorized(status) => write!(f, "API rejected application or API key: {}", status),
            Self::Status(status) => write!(f, "unexpected status {}", status),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            _ => None,
        }
    }
}

/// Anything that can produce the latest records for every device on an account.
///
/// Implemented by `AmbientClient` and by fakes in tests so that the poll loop
/// can be exercised without a network.
pub trait DeviceSource {
    fn devices(&self) -> impl Future<Output = Result<Vec<DeviceRecord>, ClientError>> + Send;
}

/// Client for the Ambient Weather REST API.
///
/// Debug is intentionally not derived: the request URL carries both keys.
pub struct AmbientClient {
    client: Client,
    devices_url: Url,
}

impl AmbientClient {
    const USER_AGENT: &'static str = "ambient_wx_exporter Prometheus Exporter";
    const JSON_RESPONSE: &'static str = "application/json";

    pub fn new(client: Client, base_url: Url, application_key: &str, api_key: &str) -> Result<Self, ClientError> {
        let devices_url = Self::devices_url(base_url, application_key, api_key)?;
        Ok(AmbientClient { client, devices_url })
    }

    async fn make_request(&self) -> Result<Response, ClientError> {
        let res = self
            .client
            .get(self.devices_url.clone())
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .send()
            .await
            .map_err(|e| ClientError::Internal(e.without_url()))?;

        let status = res.status();
        if status == StatusCode::OK {
            Ok(res)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ClientError::Unauthorized(status))
        } else {
            Err(ClientError::Status(status))
        }
    }

    fn devices_url(base_url: Url, application_key: &str, api_key: &str) -> Result<Url, ClientError> {
        let mut url = base_url;
        url.path_segments_mut()
            .map(|mut p| {
                p.pop_if_empty().push("devices");
            })
            .map_err(|_| ClientError::InvalidUrl(url.to_string()))?;

        url.query_pairs_mut()
            .clear()
            .append_pair("applicationKey", application_key)
            .append_pair("apiKey", api_key);

        Ok(url)
    }
}

impl DeviceSource for AmbientClient {
    async fn devices(&self) -> Result<Vec<DeviceRecord>, ClientError> {
        tracing::debug!(message = "making device list request", path = %self.devices_url.path());

        let res = self.make_request().await?;
        res.json::<Vec<DeviceRecord>>()
            .await
            .map_err(|e| ClientError::Internal(e.without_url()))
    }
}

/// A single weather station and the most recent values it reported.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    #[serde(alias = "macAddress")]
    pub mac_address: String,
    #[serde(alias = "lastData", default)]
    pub last_data: BTreeMap<String, Value>,
    #[serde(alias = "info", default)]
    pub info: Option<DeviceInfo>,
}

impl DeviceRecord {
    /// Value of a single raw field, if the station reported it.
    pub fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        self.last_data.get(name).map(FieldValue::from)
    }

    /// Every raw field reported by the station, ordered by name.
    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldValue<'_>)> {
        self.last_data.iter().map(|(k, v)| (k.as_str(), FieldValue::from(v)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    #[serde(alias = "name", default)]
    pub name: Option<String>,
    #[serde(alias = "location", default)]
    pub location: Option<String>,
}

/// Raw field value from the API, narrowed to the shapes we know what to do with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Numeric(f64),
    Text(&'a str),
    Unknown(&'static str),
}

impl<'a> From<&'a Value> for FieldValue<'a> {
    fn from(v: &'a Value) -> Self {
        match v {
            Value::Number(n) => n.as_f64().map(FieldValue::Numeric).unwrap_or(FieldValue::Unknown("number")),
            Value::String(s) => FieldValue::Text(s),
            Value::Bool(_) => FieldValue::Unknown("bool"),
            Value::Null => FieldValue::Unknown("null"),
            Value::Array(_) => FieldValue::Unknown("array"),
            Value::Object(_) => FieldValue::Unknown("object"),
        }
    }
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
            Self::Unknown(kind) => write!(f, "<{}>", kind),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{AmbientClient, ClientError, DeviceRecord, FieldValue};
    use reqwest::{StatusCode, Url};
    use serde_json::json;

    #[test]
    fn test_devices_url_with_trailing_slash() {
        let base = Url::parse("https://rt.ambientweather.net/v1/").unwrap();
        let url = AmbientClient::devices_url(base, "app", "api").unwrap();
        assert_eq!(
            "https://rt.ambientweather.net/v1/devices?applicationKey=app&apiKey=api",
            url.as_str()
        );
    }

    #[test]
    fn test_devices_url_without_trailing_slash() {
        let base = Url::parse("http://localhost:1234/v1").unwrap();
        let url = AmbientClient::devices_url(base, "a b", "c&d").unwrap();
        assert_eq!("/v1/devices", url.path());
        assert_eq!(Some("applicationKey=a+b&apiKey=c%26d"), url.query());
    }

    #[test]
    fn test_devices_url_cannot_be_base() {
        let base = Url::parse("mailto:someone@example.com").unwrap();
        let res = AmbientClient::devices_url(base, "app", "api");
        assert!(matches!(res, Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn test_is_transient() {
        assert!(ClientError::Status(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(ClientError::Status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(ClientError::Status(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(!ClientError::Status(StatusCode::INTERNAL_SERVER_ERROR).is_transient());
        assert!(!ClientError::Status(StatusCode::NOT_FOUND).is_transient());
        assert!(!ClientError::Unauthorized(StatusCode::UNAUTHORIZED).is_transient());
    }

    #[test]
    fn test_record_from_api_payload() {
        let record: DeviceRecord = serde_json::from_value(json!({
            "macAddress": "AA:BB:CC",
            "lastData": {
                "dateutc": 1700000000000u64,
                "tempf": 72.5,
                "humidity": 55,
                "tz": "America/New_York",
                "battout": true,
                "extra": null,
            },
            "info": {"name": "Backyard", "coords": {"lat": 1.0}},
        }))
        .unwrap();

        assert_eq!("AA:BB:CC", record.mac_address);
        assert_eq!(Some(FieldValue::Numeric(72.5)), record.field("tempf"));
        assert_eq!(Some(FieldValue::Numeric(55.0)), record.field("humidity"));
        assert_eq!(Some(FieldValue::Numeric(1700000000000.0)), record.field("dateutc"));
        assert_eq!(Some(FieldValue::Text("America/New_York")), record.field("tz"));
        assert_eq!(Some(FieldValue::Unknown("bool")), record.field("battout"));
        assert_eq!(Some(FieldValue::Unknown("null")), record.field("extra"));
        assert_eq!(None, record.field("uv"));

        let info = record.info.unwrap();
        assert_eq!(Some("Backyard".to_owned()), info.name);
        assert_eq!(None, info.location);
    }

    #[test]
    fn test_record_without_data() {
        let record: DeviceRecord = serde_json::from_value(json!({"macAddress": "AA:BB:CC"})).unwrap();
        assert_eq!(0, record.fields().count());
        assert!(record.info.is_none());
    }
}
