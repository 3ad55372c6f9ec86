//! Geohash encoding for the geo commands.
//!
//! Coordinates are interleaved longitude-first into a Z-order curve.
//! The geo commands store the 64-bit code as a sorted-set score, decode
//! it back to the bounding-box center for GEOPOS, and render the
//! standard base32 alphabet for GEOHASH.

/// Bits in a full-precision code. 52 bits (26 per axis) is the most
/// that survives a round-trip through an f64 sorted-set score intact.
const BIT_SIZE: u32 = 52;

/// The geohash base32 alphabet (no i, l, o).
const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Mean earth radius in meters, used for haversine distances.
const EARTH_RADIUS_M: f64 = 6_372_797.560856;

/// Longitude and latitude limits accepted by GEOADD.
pub const LONGITUDE_RANGE: (f64, f64) = (-180.0, 180.0);
pub const LATITUDE_RANGE: (f64, f64) = (-90.0, 90.0);

/// Encodes a coordinate into a 64-bit Z-order code.
pub fn encode(latitude: f64, longitude: f64) -> u64 {
    let mut lng_box = (LONGITUDE_RANGE.0, LONGITUDE_RANGE.1);
    let mut lat_box = (LATITUDE_RANGE.0, LATITUDE_RANGE.1);
    let mut code: u64 = 0;

    let mut level = 0;
    while level < BIT_SIZE {
        // longitude first, then latitude, alternating per bit
        for (val, range) in [(longitude, &mut lng_box), (latitude, &mut lat_box)] {
            let mid = (range.0 + range.1) / 2.0;
            code <<= 1;
            if val < mid {
                range.1 = mid;
            } else {
                range.0 = mid;
                code |= 1;
            }
            level += 1;
            if level == BIT_SIZE {
                break;
            }
        }
    }
    code
}

/// Decodes a 64-bit code back to the `(latitude, longitude)` center of
/// its bounding box.
pub fn decode(code: u64) -> (f64, f64) {
    let mut lng_box = (LONGITUDE_RANGE.0, LONGITUDE_RANGE.1);
    let mut lat_box = (LATITUDE_RANGE.0, LATITUDE_RANGE.1);

    let mut direction = 0;
    for i in (0..BIT_SIZE).rev() {
        let bit = (code >> i) & 1;
        let range = if direction == 0 {
            &mut lng_box
        } else {
            &mut lat_box
        };
        let mid = (range.0 + range.1) / 2.0;
        if bit == 1 {
            range.0 = mid;
        } else {
            range.1 = mid;
        }
        direction ^= 1;
    }
    (
        (lat_box.0 + lat_box.1) / 2.0,
        (lng_box.0 + lng_box.1) / 2.0,
    )
}

/// Renders a code as an 11-character base32 geohash string, the format
/// GEOHASH replies with. The 52 data bits are left-aligned; the three
/// trailing filler bits read as zero.
pub fn to_base32(code: u64) -> String {
    let full = code << (64 - BIT_SIZE);
    let mut out = String::with_capacity(11);
    for i in 0u32..11 {
        let shift = 64 - 5 * (i + 1);
        let idx = ((full >> shift) & 0x1f) as usize;
        out.push(BASE32[idx] as char);
    }
    out
}

/// Great-circle distance between two coordinates in meters.
pub fn distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (lat1, lng1) = (lat1.to_radians(), lng1.to_radians());
    let (lat2, lng2) = (lat2.to_radians(), lng2.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * a.sqrt().asin() * EARTH_RADIUS_M
}
