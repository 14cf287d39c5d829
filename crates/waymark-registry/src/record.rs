//! Address records and their wire format
//!
//! TigerStyle: Validated records, explicit defaults for optional fields.
//!
//! Every registered instance stores one JSON payload under its key:
//!
//! ```text
//! /gamesrv/v1 -> {"ip": "10.0.0.1", "port": "9000", "weight": 10, "srv_type": 0}
//! ```
//!
//! `weight` and `srv_type` are optional; unknown fields are ignored.

use crate::error::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use waymark_core::constants::{RECORD_PAYLOAD_SIZE_BYTES_MAX, RECORD_WEIGHT_DEFAULT};

/// Pool discriminator for records sharing a prefix
///
/// Records of different service types are balanced independently.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceType(pub u16);

impl ServiceType {
    /// Plain TCP endpoints
    pub const TCP: ServiceType = ServiceType(0);
    /// WebSocket endpoints
    pub const WEBSOCKET: ServiceType = ServiceType(1);

    /// Raw discriminator value
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TCP => write!(f, "tcp"),
            Self::WEBSOCKET => write!(f, "websocket"),
            Self(other) => write!(f, "type-{}", other),
        }
    }
}

/// Port as published by registrars: usually a string, numbers accepted
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Text(String),
    Number(u16),
}

impl PortValue {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

/// JSON payload stored under each registration key
///
/// Serialized with [`RecordPayload::to_json`], parsed with [`RecordPayload::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordPayload {
    /// Host or IP the instance listens on
    pub ip: String,
    /// Port the instance listens on
    pub port: String,
    /// Relative weight; missing or non-positive means 1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    /// Pool discriminator; missing means TCP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srv_type: Option<u16>,
}

/// Deserialization shadow so that required fields produce a clear error
#[derive(Deserialize)]
struct RawPayload {
    ip: Option<String>,
    port: Option<PortValue>,
    #[serde(default)]
    weight: Option<i64>,
    #[serde(default, alias = "service_type")]
    srv_type: Option<u16>,
}

impl RecordPayload {
    /// Create a payload for `ip:port` with default weight and type
    pub fn new(ip: impl Into<String>, port: impl ToString) -> Self {
        Self {
            ip: ip.into(),
            port: port.to_string(),
            weight: None,
            srv_type: None,
        }
    }

    /// Set the weight
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Set the service type
    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.srv_type = Some(service_type.as_u16());
        self
    }

    /// Serialize to the JSON wire format
    pub fn to_json(&self) -> RegistryResult<String> {
        serde_json::to_string(self).map_err(|e| RegistryError::Internal {
            message: format!("failed to serialize record payload: {}", e),
        })
    }

    /// Parse a payload stored under `key`
    ///
    /// # Errors
    /// Returns `InvalidRecord` if the value is not JSON, is too large, or lacks
    /// a non-empty `ip` or `port`.
    pub fn parse(key: &str, value: &[u8]) -> RegistryResult<Self> {
        if value.len() > RECORD_PAYLOAD_SIZE_BYTES_MAX {
            return Err(RegistryError::invalid_record(
                key,
                format!(
                    "payload size {} exceeds limit {}",
                    value.len(),
                    RECORD_PAYLOAD_SIZE_BYTES_MAX
                ),
            ));
        }

        let raw: RawPayload = serde_json::from_slice(value)
            .map_err(|e| RegistryError::invalid_record(key, e.to_string()))?;

        let ip = raw
            .ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| RegistryError::invalid_record(key, "missing field `ip`"))?;
        let port = raw
            .port
            .map(PortValue::into_string)
            .filter(|port| !port.is_empty())
            .ok_or_else(|| RegistryError::invalid_record(key, "missing field `port`"))?;

        Ok(Self {
            ip,
            port,
            weight: raw.weight,
            srv_type: raw.srv_type,
        })
    }

    /// Weight after coercion to the valid range
    pub fn effective_weight(&self) -> u32 {
        normalize_weight(self.weight.unwrap_or(0))
    }
}

/// Coerce a raw weight to `1..=u32::MAX`
pub fn normalize_weight(weight: i64) -> u32 {
    if weight <= 0 {
        RECORD_WEIGHT_DEFAULT
    } else {
        u32::try_from(weight).unwrap_or(u32::MAX)
    }
}

/// One registered instance as seen by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    /// Full store key of the registration
    pub key: String,
    /// `host:port`
    pub address: String,
    /// Relative weight, at least 1
    pub weight: u32,
    /// Pool this record is balanced in
    pub service_type: ServiceType,
}

impl AddressRecord {
    /// Create a record directly
    pub fn new(
        key: impl Into<String>,
        address: impl Into<String>,
        weight: i64,
        service_type: ServiceType,
    ) -> Self {
        Self {
            key: key.into(),
            address: address.into(),
            weight: normalize_weight(weight),
            service_type,
        }
    }

    /// Build a record from a stored key/value pair
    pub fn parse(key: &str, value: &[u8]) -> RegistryResult<Self> {
        let payload = RecordPayload::parse(key, value)?;
        Ok(Self::from_payload(key, &payload))
    }

    /// Build a record from an already parsed payload
    pub fn from_payload(key: &str, payload: &RecordPayload) -> Self {
        let record = Self {
            key: key.to_string(),
            address: format!("{}:{}", payload.ip, payload.port),
            weight: payload.effective_weight(),
            service_type: ServiceType(payload.srv_type.unwrap_or_default()),
        };

        debug_assert!(record.weight >= 1);
        record
    }
}

impl fmt::Display for AddressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (weight {}, {})",
            self.key, self.address, self.weight, self.service_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_record() {
        let value = br#"{"ip":"10.0.0.1","port":"9000","weight":10,"srv_type":1}"#;
        let record = AddressRecord::parse("/svc/a", value).unwrap();
        assert_eq!(record.key, "/svc/a");
        assert_eq!(record.address, "10.0.0.1:9000");
        assert_eq!(record.weight, 10);
        assert_eq!(record.service_type, ServiceType::WEBSOCKET);
    }

    #[test]
    fn test_weight_defaults() {
        let missing = AddressRecord::parse("/k", br#"{"ip":"h","port":"1"}"#).unwrap();
        assert_eq!(missing.weight, 1);

        let zero = AddressRecord::parse("/k", br#"{"ip":"h","port":"1","weight":0}"#).unwrap();
        assert_eq!(zero.weight, 1);

        let negative = AddressRecord::parse("/k", br#"{"ip":"h","port":"1","weight":-5}"#).unwrap();
        assert_eq!(negative.weight, 1);
    }

    #[test]
    fn test_service_type_defaults_to_tcp() {
        let record = AddressRecord::parse("/k", br#"{"ip":"h","port":"1"}"#).unwrap();
        assert_eq!(record.service_type, ServiceType::TCP);
    }

    #[test]
    fn test_numeric_port_and_alias() {
        let record =
            AddressRecord::parse("/k", br#"{"ip":"h","port":8080,"service_type":1}"#).unwrap();
        assert_eq!(record.address, "h:8080");
        assert_eq!(record.service_type, ServiceType::WEBSOCKET);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let value = br#"{"ip":"h","port":"1","zone":"eu-west","version":"2.1"}"#;
        assert!(AddressRecord::parse("/k", value).is_ok());
    }

    #[test]
    fn test_missing_required_fields() {
        let err = AddressRecord::parse("/k", br#"{"port":"1"}"#).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRecord { .. }));

        let err = AddressRecord::parse("/k", br#"{"ip":"h"}"#).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRecord { .. }));

        let err = AddressRecord::parse("/k", br#"{"ip":"","port":"1"}"#).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRecord { .. }));
    }

    #[test]
    fn test_not_json() {
        let err = AddressRecord::parse("/k", b"8.134.99.107:80").unwrap_err();
        assert!(err.to_string().contains("/k"));
    }

    #[test]
    fn test_payload_serializes_wire_format() {
        let payload = RecordPayload::new("10.0.0.2", 9001)
            .with_weight(30)
            .with_service_type(ServiceType::TCP);
        let json = payload.to_json().unwrap();

        let parsed = RecordPayload::parse("/svc/b", json.as_bytes()).unwrap();
        assert_eq!(parsed, payload);
        assert!(json.contains("\"port\":\"9001\""));
    }

    #[test]
    fn test_normalize_weight_saturates() {
        assert_eq!(normalize_weight(i64::MAX), u32::MAX);
        assert_eq!(normalize_weight(7), 7);
    }

    #[test]
    fn test_service_type_display() {
        assert_eq!(ServiceType::TCP.to_string(), "tcp");
        assert_eq!(ServiceType(7).to_string(), "type-7");
    }
}
