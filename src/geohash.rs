//! Geohash codec and query range computation
//!
//! Encoding and decoding go through the `geohash` crate. On top of that this
//! module sizes proximity queries: given a center and a radius it picks the
//! coarsest cell size that still bounds the circle and returns the half-open
//! hash ranges whose union covers it. A range scan over an ordered hash index
//! then yields every candidate; the caller re-checks true distance.

use crate::error::{GeoFireError, Result};
use crate::spatial::{
    distance_to_latitude_degrees, distance_to_longitude_degrees, wrap_longitude, BoundingBox,
    Location, EARTH_MERIDIONAL_CIRCUMFERENCE_M,
};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

pub use geohash::Direction;

/// The geohash alphabet, in sort order.
pub const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";
pub const BITS_PER_CHAR: u32 = 5;
/// Longest hash the codec produces.
pub const MAX_PRECISION: usize = 12;
pub const MAX_PRECISION_BITS: u32 = MAX_PRECISION as u32 * BITS_PER_CHAR;

// Well inside the easternmost cell at every supported precision.
const EAST_EDGE_LONGITUDE: f64 = 180.0 - 1e-9;

/// Sorts after every base-32 symbol; closes ranges that run to the end of a prefix.
const RANGE_END_SENTINEL: char = '~';

/// Covering sets never hold more than the nine sampled cells.
pub type CoveringSet = SmallVec<[HashRange; 9]>;

fn base32_index(symbol: u8) -> Option<u32> {
    BASE32.iter().position(|&c| c == symbol).map(|i| i as u32)
}

/// A validated geohash string.
///
/// Ordering is plain string ordering, which walks cells along the geohash
/// Z-order curve; hashes sharing a prefix lie in the same cell.
///
/// # Examples
///
/// ```rust
/// use geofire::{GeoHash, Location};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let nyc = Location::new(40.7128, -74.0060)?;
/// let hash = GeoHash::encode(&nyc, 8)?;
/// assert_eq!(hash.as_str(), "dr5regw3");
/// assert!(hash.bounding_box()?.contains(&nyc));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GeoHash(String);

impl GeoHash {
    /// Encode a location into a hash of `precision` characters.
    pub fn encode(location: &Location, precision: usize) -> Result<Self> {
        check_precision(precision)?;
        geohash::encode(location.to_coord(), precision)
            .map(GeoHash)
            .map_err(|e| GeoFireError::invalid(e.to_string()))
    }

    /// Validate an existing hash string.
    pub fn parse(hash: &str) -> Result<Self> {
        check_precision(hash.len())?;
        if let Some(bad) = hash.bytes().find(|b| base32_index(*b).is_none()) {
            return Err(GeoFireError::invalid(format!(
                "'{}' is not a geohash symbol",
                bad as char
            )));
        }
        Ok(GeoHash(hash.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn precision(&self) -> usize {
        self.0.len()
    }

    /// The cell this hash denotes.
    pub fn bounding_box(&self) -> Result<BoundingBox> {
        let rect =
            geohash::decode_bbox(&self.0).map_err(|e| GeoFireError::invalid(e.to_string()))?;
        Ok(BoundingBox::new(
            rect.min().y,
            rect.min().x,
            rect.max().y,
            rect.max().x,
        ))
    }

    /// Center of the cell.
    pub fn decode(&self) -> Result<Location> {
        let (coord, _, _) =
            geohash::decode(&self.0).map_err(|e| GeoFireError::invalid(e.to_string()))?;
        Location::new(coord.y, coord.x)
    }

    /// The adjacent cell of the same precision in `direction`.
    pub fn neighbor(&self, direction: Direction) -> Result<GeoHash> {
        geohash::neighbor(&self.0, direction)
            .map(GeoHash)
            .map_err(|e| GeoFireError::invalid(e.to_string()))
    }

    /// All eight adjacent cells, clockwise from north.
    pub fn neighbors(&self) -> Result<[GeoHash; 8]> {
        let n = geohash::neighbors(&self.0).map_err(|e| GeoFireError::invalid(e.to_string()))?;
        Ok([n.n, n.ne, n.e, n.se, n.s, n.sw, n.w, n.nw].map(GeoHash))
    }

    /// Shorten to `precision` characters (no-op when already shorter).
    pub fn truncate(&self, precision: usize) -> GeoHash {
        GeoHash(self.0.chars().take(precision).collect())
    }
}

impl fmt::Display for GeoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for GeoHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn check_precision(precision: usize) -> Result<()> {
    if precision == 0 || precision > MAX_PRECISION {
        return Err(GeoFireError::invalid(format!(
            "geohash precision must be between 1 and {}, got {}",
            MAX_PRECISION, precision
        )));
    }
    Ok(())
}

/// A half-open range `[start, end)` of geohash strings.
///
/// `end` may carry a trailing `~`, which sorts after every geohash symbol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashRange {
    pub start: String,
    pub end: String,
}

impl HashRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        hash >= self.start.as_str() && hash < self.end.as_str()
    }

    /// True when the two ranges overlap or touch end to start.
    pub fn can_join(&self, other: &HashRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// The cell containing `hash`, widened so that only `bits` significant
    /// bits are kept.
    pub fn for_geohash(hash: &str, bits: u32) -> Result<HashRange> {
        let precision = bits.div_ceil(BITS_PER_CHAR) as usize;
        if hash.len() < precision {
            return Ok(HashRange::new(
                hash,
                format!("{}{}", hash, RANGE_END_SENTINEL),
            ));
        }
        let hash = &hash[..precision];
        let (base, last) = hash.split_at(precision - 1);
        let last_value = base32_index(last.as_bytes()[0])
            .ok_or_else(|| GeoFireError::invalid(format!("invalid geohash '{}'", hash)))?;

        let significant_bits = bits - base.len() as u32 * BITS_PER_CHAR;
        let unused_bits = BITS_PER_CHAR - significant_bits;
        let start_value = (last_value >> unused_bits) << unused_bits;
        let end_value = start_value + (1 << unused_bits);

        let start = format!("{}{}", base, BASE32[start_value as usize] as char);
        let end = if end_value > 31 {
            format!("{}{}", base, RANGE_END_SENTINEL)
        } else {
            format!("{}{}", base, BASE32[end_value as usize] as char)
        };
        Ok(HashRange::new(start, end))
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

fn bits_latitude(resolution: f64) -> f64 {
    (EARTH_MERIDIONAL_CIRCUMFERENCE_M / 2.0 / resolution)
        .log2()
        .min(MAX_PRECISION_BITS as f64)
}

fn bits_longitude(resolution: f64, latitude: f64) -> f64 {
    let degrees = distance_to_longitude_degrees(resolution, latitude);
    if degrees.abs() > 0.0 {
        (360.0 / degrees).log2().max(1.0)
    } else {
        1.0
    }
}

/// Number of hash bits whose cells are at least `size` meters on each side
/// everywhere within `size` of `center`, capped at `max_bits`.
pub fn bits_for_bounding_box(center: &Location, size: f64, max_bits: u32) -> u32 {
    let latitude_delta = distance_to_latitude_degrees(size);
    let latitude_north = (center.latitude() + latitude_delta).min(90.0);
    let latitude_south = (center.latitude() - latitude_delta).max(-90.0);

    let bits_lat = bits_latitude(size).floor() as i64 * 2;
    let bits_lon_north = bits_longitude(size, latitude_north).floor() as i64 * 2 - 1;
    let bits_lon_south = bits_longitude(size, latitude_south).floor() as i64 * 2 - 1;

    bits_lat
        .min(bits_lon_north)
        .min(bits_lon_south)
        .min(max_bits.min(MAX_PRECISION_BITS) as i64)
        .max(1) as u32
}

/// Hash ranges whose union covers the circle of `radius` meters around
/// `center`, for entries stored at `precision` characters.
///
/// The circle's bounding box is sampled at its center, edges and corners;
/// longitudes are wrapped so boxes crossing the antimeridian produce ranges on
/// both sides, and latitudes are clamped at the poles. Overlapping or touching
/// ranges are merged.
///
/// ```rust
/// use geofire::{geohash::covering_ranges, GeoHash, Location};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let center = Location::new(37.7853, -122.4056)?;
/// let ranges = covering_ranges(&center, 1_000.0, 10)?;
/// let hash = GeoHash::encode(&center, 10)?;
/// assert!(ranges.iter().any(|r| r.contains(hash.as_str())));
/// # Ok(())
/// # }
/// ```
pub fn covering_ranges(center: &Location, radius: f64, precision: usize) -> Result<CoveringSet> {
    if !(radius.is_finite() && radius > 0.0) {
        return Err(GeoFireError::invalid(format!(
            "radius must be a positive number of meters, got {}",
            radius
        )));
    }
    check_precision(precision)?;

    let query_bits = bits_for_bounding_box(center, radius, precision as u32 * BITS_PER_CHAR);
    let hash_precision = query_bits.div_ceil(BITS_PER_CHAR) as usize;

    let latitude = center.latitude();
    let longitude = center.longitude();
    let latitude_delta = distance_to_latitude_degrees(radius);
    let latitude_north = (latitude + latitude_delta).min(90.0);
    let latitude_south = (latitude - latitude_delta).max(-90.0);
    let longitude_delta = distance_to_longitude_degrees(radius, latitude_north)
        .max(distance_to_longitude_degrees(radius, latitude_south));
    // A box spanning every meridian is sampled at both edges of the map so the
    // cells on either side of the center longitude are both covered.
    let (west, east) = if longitude_delta >= 180.0 {
        (-180.0, 180.0)
    } else {
        (
            wrap_longitude(longitude - longitude_delta),
            wrap_longitude(longitude + longitude_delta),
        )
    };

    let mut ranges: Vec<HashRange> = Vec::with_capacity(9);
    for lat in [latitude, latitude_north, latitude_south] {
        for lon in [longitude, west, east] {
            let sample = Location::new(lat, sample_longitude(lon))?;
            let hash = GeoHash::encode(&sample, hash_precision)?;
            ranges.push(HashRange::for_geohash(hash.as_str(), query_bits)?);
        }
    }

    Ok(merge_ranges(ranges))
}

/// Longitude 180 encodes into the same cell as -180, so the eastern edge is
/// sampled just inside the easternmost cell instead.
fn sample_longitude(longitude: f64) -> f64 {
    if longitude >= 180.0 {
        EAST_EDGE_LONGITUDE
    } else {
        longitude
    }
}

/// Sort and coalesce overlapping or adjacent ranges.
pub fn merge_ranges(mut ranges: Vec<HashRange>) -> CoveringSet {
    ranges.sort();
    let mut merged = CoveringSet::new();
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.can_join(&range) => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}
