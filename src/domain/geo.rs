//! Geofence evaluation: great-circle distance against a service radius

use crate::domain::types::GeoPoint;

/// Mean Earth radius in meters (IUGG)
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance between two coordinates in meters, using the
/// haversine formula.
pub fn haversine_distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Whether `point` lies within `radius_m` of `anchor` (boundary inclusive)
pub fn within_radius(point: GeoPoint, anchor: GeoPoint, radius_m: f64) -> bool {
    haversine_distance_m(point, anchor) <= radius_m
}
