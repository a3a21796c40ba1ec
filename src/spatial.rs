//! Spatial utilities for GeoFire
//!
//! This module provides the location value type, great-circle distance and
//! the meter/degree conversions used when sizing geohash queries.

use crate::error::{GeoFireError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean Earth radius used for great-circle distance.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Length of a meridian, pole to pole and back.
pub const EARTH_MERIDIONAL_CIRCUMFERENCE_M: f64 = 40_007_860.0;
/// Equatorial radius of the WGS84 ellipsoid.
pub const EARTH_EQ_RADIUS_M: f64 = 6_378_137.0;
/// First eccentricity squared of the WGS84 ellipsoid.
pub const EARTH_E2: f64 = 0.006_694_478_197_99;
pub const METERS_PER_DEGREE_LATITUDE: f64 = 110_574.0;

const EPSILON: f64 = 1e-12;
const TO_RAD: f64 = std::f64::consts::PI / 180.0;

/// A geographic location on Earth's surface.
///
/// `Location` is an immutable value: the constructor validates that the
/// latitude lies in `[-90, 90]` and the longitude in `[-180, 180]`, and the
/// coordinates can only be read afterwards. All coordinates use WGS84.
///
/// # Examples
///
/// ```rust
/// use geofire::Location;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let new_york = Location::new(40.7128, -74.0060)?;
/// let london = Location::new(51.5074, -0.1278)?;
///
/// let distance_km = new_york.distance_to(&london) / 1000.0;
/// assert!((distance_km - 5585.0).abs() < 50.0);
///
/// assert!(Location::new(91.0, 0.0).is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLocation")]
pub struct Location {
    latitude: f64,
    longitude: f64,
}

impl Location {
    /// Creates a location, rejecting out-of-range or non-finite coordinates.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !Self::is_valid(latitude, longitude) {
            return Err(GeoFireError::invalid(format!(
                "invalid coordinates ({}, {})",
                latitude, longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Whether the pair is a usable latitude/longitude.
    pub fn is_valid(latitude: f64, longitude: f64) -> bool {
        latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude)
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle distance in meters using the Haversine formula.
    ///
    /// ```rust
    /// use geofire::Location;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let a = Location::new(0.0, 179.9995)?;
    /// let b = Location::new(0.0, -179.9995)?;
    /// // Across the antimeridian the points are about 111m apart.
    /// assert!(a.distance_to(&b) < 120.0);
    /// # Ok(())
    /// # }
    /// ```
    pub fn distance_to(&self, other: &Location) -> f64 {
        let lat1 = self.latitude * TO_RAD;
        let lat2 = other.latitude * TO_RAD;
        let dlat = (other.latitude - self.latitude) * TO_RAD;
        let dlon = (other.longitude - self.longitude) * TO_RAD;

        let sin_half_dlat = (dlat * 0.5).sin();
        let sin_half_dlon = (dlon * 0.5).sin();

        let a =
            sin_half_dlat * sin_half_dlat + lat1.cos() * lat2.cos() * sin_half_dlon * sin_half_dlon;
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_M * c
    }

    /// Check if this location is within `radius_meters` of `center`.
    pub fn within_distance(&self, center: &Location, radius_meters: f64) -> bool {
        self.distance_to(center) <= radius_meters
    }

    pub(crate) fn to_coord(self) -> geo::Coord<f64> {
        geo::Coord {
            x: self.longitude,
            y: self.latitude,
        }
    }
}

#[derive(Deserialize)]
struct RawLocation {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawLocation> for Location {
    type Error = GeoFireError;

    fn try_from(raw: RawLocation) -> Result<Self> {
        Location::new(raw.latitude, raw.longitude)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// A bounding box defined by minimum and maximum latitude and longitude coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Create a new bounding box
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    /// Inclusive containment test.
    pub fn contains(&self, location: &Location) -> bool {
        location.latitude() >= self.min_lat
            && location.latitude() <= self.max_lat
            && location.longitude() >= self.min_lon
            && location.longitude() <= self.max_lon
    }

    /// Check if this bounding box intersects with another bounding box.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.max_lat < other.min_lat
            || self.min_lat > other.max_lat
            || self.max_lon < other.min_lon
            || self.min_lon > other.max_lon)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) * 0.5,
            (self.min_lon + self.max_lon) * 0.5,
        )
    }
}

/// Degrees of latitude spanned by `distance` meters.
pub fn distance_to_latitude_degrees(distance: f64) -> f64 {
    distance / METERS_PER_DEGREE_LATITUDE
}

/// Degrees of longitude spanned by `distance` meters at `latitude`.
///
/// Capped at 360; at the poles any positive distance spans every meridian.
pub fn distance_to_longitude_degrees(distance: f64, latitude: f64) -> f64 {
    let radians = latitude * TO_RAD;
    let numerator = radians.cos() * EARTH_EQ_RADIUS_M * std::f64::consts::PI / 180.0;
    let denominator = 1.0 / (1.0 - EARTH_E2 * radians.sin() * radians.sin()).sqrt();
    let delta_degrees = numerator * denominator;
    if delta_degrees < EPSILON {
        if distance > 0.0 { 360.0 } else { 0.0 }
    } else {
        (distance / delta_degrees).min(360.0)
    }
}

/// Fold a longitude back into `[-180, 180]`.
pub fn wrap_longitude(longitude: f64) -> f64 {
    if (-180.0..=180.0).contains(&longitude) {
        return longitude;
    }
    let adjusted = longitude + 180.0;
    if adjusted > 0.0 {
        (adjusted % 360.0) - 180.0
    } else {
        180.0 - (-adjusted % 360.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_creation() {
        let location = Location::new(40.7128, -74.0060).unwrap();
        assert_eq!(location.latitude(), 40.7128);
        assert_eq!(location.longitude(), -74.0060);
    }

    #[test]
    fn test_location_rejects_invalid_coordinates() {
        assert!(Location::new(90.1, 0.0).is_err());
        assert!(Location::new(-90.1, 0.0).is_err());
        assert!(Location::new(0.0, 180.1).is_err());
        assert!(Location::new(f64::NAN, 0.0).is_err());
        assert!(Location::new(0.0, f64::INFINITY).is_err());
        assert!(Location::new(90.0, -180.0).is_ok());
    }

    #[test]
    fn test_distance_calculation() {
        let new_york = Location::new(40.7128, -74.0060).unwrap();
        let london = Location::new(51.5074, -0.1278).unwrap();

        let distance = new_york.distance_to(&london);
        // Distance should be approximately 5585 km
        assert!((distance - 5_585_000.0).abs() < 50_000.0);
        assert!(new_york.distance_to(&new_york) < 1e-6);
    }

    #[test]
    fn test_within_distance() {
        let nyc = Location::new(40.7128, -74.0060).unwrap();
        let brooklyn = Location::new(40.6782, -73.9442).unwrap();
        let london = Location::new(51.5074, -0.1278).unwrap();

        assert!(brooklyn.within_distance(&nyc, 20_000.0));
        assert!(!london.within_distance(&nyc, 1_000_000.0));
        assert!(nyc.within_distance(&nyc, 0.0));
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Location = serde_json::from_str(r#"{"latitude": 1.5, "longitude": 2.5}"#).unwrap();
        assert_eq!(ok, Location::new(1.5, 2.5).unwrap());
        assert!(serde_json::from_str::<Location>(r#"{"latitude": 95.0, "longitude": 0.0}"#).is_err());
    }

    #[test]
    fn test_location_display() {
        let location = Location::new(40.7128, -74.0060).unwrap();
        assert_eq!(format!("{}", location), "(40.712800, -74.006000)");
    }

    #[test]
    fn test_wrap_longitude() {
        assert_eq!(wrap_longitude(0.0), 0.0);
        assert_eq!(wrap_longitude(180.0), 180.0);
        assert!((wrap_longitude(181.0) - -179.0).abs() < 1e-9);
        assert!((wrap_longitude(-181.0) - 179.0).abs() < 1e-9);
        assert!((wrap_longitude(540.0) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_degree_conversions() {
        assert!((distance_to_latitude_degrees(110_574.0) - 1.0).abs() < 1e-9);
        // One degree of longitude at the equator is roughly 111.3km
        let deg = distance_to_longitude_degrees(111_320.0, 0.0);
        assert!((deg - 1.0).abs() < 0.01);
        assert!(
            distance_to_longitude_degrees(1000.0, 60.0) > distance_to_longitude_degrees(1000.0, 0.0)
        );
        assert_eq!(distance_to_longitude_degrees(1.0, 90.0), 360.0);
        assert_eq!(distance_to_longitude_degrees(0.0, 90.0), 0.0);
    }

    #[test]
    fn test_bounding_box() {
        let bbox1 = BoundingBox::new(40.0, -75.0, 41.0, -73.0);
        let bbox2 = BoundingBox::new(40.5, -74.5, 40.8, -74.0);
        let bbox3 = BoundingBox::new(51.0, -1.0, 52.0, 1.0);

        assert!(bbox1.intersects(&bbox2));
        assert!(!bbox1.intersects(&bbox3));
        assert!(bbox1.contains(&Location::new(40.5, -74.0).unwrap()));
        assert!(!bbox1.contains(&Location::new(42.0, -74.0).unwrap()));
        assert_eq!(bbox1.center(), (40.5, -74.0));
    }
}
