//! Encoded polyline codec.
//!
//! Routing services return paths in the compact polyline text format: each
//! coordinate is scaled by 1e5, delta-encoded against the previous point,
//! zig-zag encoded, and emitted as 5-bit chunks offset by 63 with `0x20` as
//! the continuation bit. Latitude comes before longitude.

use crate::error::{ProximityError, Result};
use crate::GeoPoint;

const PRECISION: f64 = 1e5;
const CHUNK_OFFSET: u8 = 63;
const CONTINUATION: i64 = 0x20;
// 7 chunks carry 35 bits, enough for any delta within ±360 degrees
const MAX_SHIFT: u32 = 35;

/// Decode an encoded polyline into an ordered sequence of points.
///
/// Characters outside the polyline alphabet, a chunk whose continuation bit is
/// set on the final character, a latitude without its longitude, and decoded
/// coordinates outside WGS84 ranges are all reported as [`ProximityError::Decode`].
///
/// # Example
///
/// ```rust
/// use proximity_guard::polyline;
///
/// let points = polyline::decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@").unwrap();
/// assert_eq!(points.len(), 3);
/// assert!((points[0].latitude - 38.5).abs() < 1e-9);
/// assert!((points[0].longitude + 120.2).abs() < 1e-9);
/// ```
pub fn decode(encoded: &str) -> Result<Vec<GeoPoint>> {
    let bytes = encoded.as_bytes();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lng: i64 = 0;
    let mut points = Vec::with_capacity(bytes.len() / 4);

    while index < bytes.len() {
        lat += read_delta(bytes, &mut index)?;
        if index >= bytes.len() {
            return Err(ProximityError::decode(format!(
                "polyline ends after a latitude at offset {}",
                index
            )));
        }
        lng += read_delta(bytes, &mut index)?;

        let point = GeoPoint::new(lat as f64 / PRECISION, lng as f64 / PRECISION);
        if !point.is_valid() {
            return Err(ProximityError::decode(format!(
                "decoded coordinate out of range: ({}, {})",
                point.latitude, point.longitude
            )));
        }
        points.push(point);
    }

    Ok(points)
}

/// Encode points with the standard polyline algorithm (1e5 precision).
pub fn encode(points: &[GeoPoint]) -> String {
    let mut out = String::with_capacity(points.len() * 8);
    let mut prev_lat: i64 = 0;
    let mut prev_lng: i64 = 0;

    for p in points {
        let lat = (p.latitude * PRECISION).round() as i64;
        let lng = (p.longitude * PRECISION).round() as i64;
        write_delta(lat - prev_lat, &mut out);
        write_delta(lng - prev_lng, &mut out);
        prev_lat = lat;
        prev_lng = lng;
    }

    out
}

fn read_delta(bytes: &[u8], index: &mut usize) -> Result<i64> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;

    loop {
        let byte = *bytes.get(*index).ok_or_else(|| {
            ProximityError::decode(format!("truncated chunk at offset {}", *index))
        })?;
        if !(CHUNK_OFFSET..=126).contains(&byte) {
            return Err(ProximityError::decode(format!(
                "invalid character {:?} at offset {}",
                byte as char, *index
            )));
        }
        if shift >= MAX_SHIFT {
            return Err(ProximityError::decode(format!(
                "value overflows at offset {}",
                *index
            )));
        }
        *index += 1;

        let chunk = i64::from(byte - CHUNK_OFFSET);
        result |= (chunk & 0x1f) << shift;
        shift += 5;

        if chunk < CONTINUATION {
            break;
        }
    }

    Ok(if result & 1 != 0 { !(result >> 1) } else { result >> 1 })
}

fn write_delta(delta: i64, out: &mut String) {
    let mut value = if delta < 0 { !(delta << 1) } else { delta << 1 };
    while value >= CONTINUATION {
        out.push(char::from(((CONTINUATION | (value & 0x1f)) as u8) + CHUNK_OFFSET));
        value >>= 5;
    }
    out.push(char::from(value as u8 + CHUNK_OFFSET));
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFERENCE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    fn reference_points() -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(38.5, -120.2),
            GeoPoint::new(40.7, -120.95),
            GeoPoint::new(43.252, -126.453),
        ]
    }

    #[test]
    fn test_decode_reference() {
        let points = decode(REFERENCE).unwrap();
        let expected = reference_points();
        assert_eq!(points.len(), expected.len());
        for (got, want) in points.iter().zip(&expected) {
            assert!((got.latitude - want.latitude).abs() < 1e-9);
            assert!((got.longitude - want.longitude).abs() < 1e-9);
        }
    }

    #[test]
    fn test_encode_reference() {
        assert_eq!(encode(&reference_points()), REFERENCE);
    }

    #[test]
    fn test_round_trip_within_precision() {
        let track = vec![
            GeoPoint::new(19.07601, 72.87773),
            GeoPoint::new(19.07712, 72.88011),
            GeoPoint::new(19.06655, 72.86102),
            GeoPoint::new(-33.86882, 151.20929),
            GeoPoint::new(0.0, 0.0),
        ];
        let decoded = decode(&encode(&track)).unwrap();
        assert_eq!(decoded.len(), track.len());
        for (got, want) in decoded.iter().zip(&track) {
            assert!((got.latitude - want.latitude).abs() <= 1e-5);
            assert!((got.longitude - want.longitude).abs() <= 1e-5);
        }
    }

    #[test]
    fn test_decode_empty() {
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn test_decode_latitude_without_longitude() {
        let err = decode("_p~iF").unwrap_err();
        assert!(matches!(err, ProximityError::Decode(_)));
    }

    #[test]
    fn test_decode_truncated_chunk() {
        // 'i' carries the continuation bit, so the value never terminates
        let err = decode("_p~i").unwrap_err();
        assert!(matches!(err, ProximityError::Decode(_)));
    }

    #[test]
    fn test_decode_invalid_character() {
        let err = decode("_p~iF ps|U").unwrap_err();
        assert!(err.to_string().contains("invalid character"));
    }

    #[test]
    fn test_decode_overflow() {
        let err = decode("~~~~~~~~~~~~").unwrap_err();
        assert!(matches!(err, ProximityError::Decode(_)));
    }
}
