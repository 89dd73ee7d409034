//! Shared types for the queue engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Newtype wrapper for service IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ServiceId(pub Uuid);

/// Newtype wrapper for counter IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CounterId(pub Uuid);

/// Newtype wrapper for token IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TokenId(pub Uuid);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            /// Generate a new time-sortable ID (UUIDv7)
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

impl_id!(ServiceId);
impl_id!(CounterId);
impl_id!(TokenId);

/// Operational status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Open,
    Closed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Open => "OPEN",
            ServiceStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(ServiceStatus::Open),
            "CLOSED" => Ok(ServiceStatus::Closed),
            other => Err(format!("unknown service status: {other}")),
        }
    }
}

/// A reported or configured geographic coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Both components finite and within WGS84 bounds
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A physical service point customers queue for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Admissible presence radius around the anchor, in meters
    pub presence_radius_m: f64,
    pub status: ServiceStatus,
    pub created_at: DateTime<Utc>,
}

impl Service {
    /// Create a service. New services start Closed until an admin opens them.
    pub fn new(name: &str, latitude: f64, longitude: f64, presence_radius_m: f64) -> Self {
        Self {
            id: ServiceId::new(),
            name: name.to_string(),
            latitude,
            longitude,
            presence_radius_m,
            status: ServiceStatus::Closed,
            created_at: Utc::now(),
        }
    }

    /// The service's geographic anchor point
    pub fn anchor(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// A staffed counter belonging to a service
///
/// Whether a counter is busy is derived from the ledger's assignment
/// table, not stored on the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub id: CounterId,
    pub service_id: ServiceId,
    pub name: String,
}

impl Counter {
    pub fn new(service_id: ServiceId, name: &str) -> Self {
        Self { id: CounterId::new(), service_id, name: name.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = TokenId::new();
        let parsed: TokenId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_distinct() {
        assert_ne!(TokenId::new(), TokenId::new());
        assert_ne!(ServiceId::new(), ServiceId::new());
    }

    #[test]
    fn test_service_status_from_str() {
        assert_eq!("OPEN".parse::<ServiceStatus>().unwrap(), ServiceStatus::Open);
        assert_eq!("CLOSED".parse::<ServiceStatus>().unwrap(), ServiceStatus::Closed);
        assert!("open".parse::<ServiceStatus>().is_err());
    }

    #[test]
    fn test_geo_point_validity() {
        assert!(GeoPoint::new(64.1466, -21.9426).is_valid());
        assert!(GeoPoint::new(-90.0, 180.0).is_valid());
        assert!(!GeoPoint::new(90.5, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.1).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_new_service_starts_closed() {
        let service = Service::new("City Hall Desk", 64.1466, -21.9426, 100.0);
        assert_eq!(service.status, ServiceStatus::Closed);
        assert_eq!(service.anchor(), GeoPoint::new(64.1466, -21.9426));
    }
}
