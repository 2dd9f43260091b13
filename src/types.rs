//! Data structures exchanged between edge sites.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and
//! pushed over HTTP to peer sites.  They describe one mutation of the
//! service table at a time: a site either starts or stops advertising
//! a service.  Field names follow the wire format used by existing
//! peers (`Meta`, `Event`, `IP`, ...), hence the explicit renames.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Latitude/longitude of an edge site.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GeoCoords {
    pub lat: f64,
    pub lon: f64,
}

/// Identity of an edge site.  Used as the key of the service table.
///
/// Coordinates are compared bit for bit so the type can be hashed;
/// two sites are the same only when every field matches exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSite {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "GeoCoords")]
    pub geo_coords: GeoCoords,
}

impl EdgeSite {
    pub fn new(ip: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            ip: ip.into(),
            geo_coords: GeoCoords { lat, lon },
        }
    }
}

impl PartialEq for EdgeSite {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
            && self.geo_coords.lat.to_bits() == other.geo_coords.lat.to_bits()
            && self.geo_coords.lon.to_bits() == other.geo_coords.lon.to_bits()
    }
}

impl Eq for EdgeSite {}

impl Hash for EdgeSite {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.geo_coords.lat.to_bits().hash(state);
        self.geo_coords.lon.to_bits().hash(state);
    }
}

/// A service running at an edge site.
///
/// The payload is opaque: it is carried and compared, never
/// interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Service(serde_json::Value);

impl Service {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for Service {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_value(&self.0, state);
    }
}

// Object keys are visited in sorted order so equal values hash equally
// whatever map type serde_json was built with.
fn hash_value<H: Hasher>(value: &serde_json::Value, state: &mut H) {
    use serde_json::Value;

    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            2u8.hash(state);
            n.to_string().hash(state);
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(state);
                hash_value(&map[key.as_str()], state);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Add,
    Delete,
}

/// One add or delete of a single service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEvent {
    #[serde(rename = "Type")]
    pub kind: EventType,
    pub service: Service,
}

/// An update message describing a change in a site's advertised services.
///
/// Exactly one event per message; peers push one message per service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceTableUpdate {
    pub meta: EdgeSite,
    pub event: ServiceEvent,
}

impl ServiceTableUpdate {
    pub fn add(meta: EdgeSite, service: Service) -> Self {
        Self {
            meta,
            event: ServiceEvent {
                kind: EventType::Add,
                service,
            },
        }
    }

    pub fn delete(meta: EdgeSite, service: Service) -> Self {
        Self {
            meta,
            event: ServiceEvent {
                kind: EventType::Delete,
                service,
            },
        }
    }

    /// Decode an update from a request body.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}
