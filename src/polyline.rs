//! Polyline codec for the matching service's compact geometry encoding.
//!
//! The wire format stores a coordinate sequence as successive signed deltas,
//! each delta zig-zag encoded and packed into 5-bit groups with a
//! continuation bit, offset by 63 into printable ASCII. Values are scaled by
//! `10^precision`; the Mapbox matching service emits precision 6, so the
//! precision is always a parameter here rather than a constant.
//!
//! The wire order is (lat, lon). [`decode`] swaps every pair on the way out
//! so callers always see GeoJSON-style (lon, lat).

use thiserror::Error;

/// Failure while decoding a polyline string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The input ended while a value still had its continuation bit set.
    #[error("polyline ends mid-value at byte {position}")]
    UnexpectedEnd { position: usize },

    /// A byte outside the printable 63..=126 alphabet.
    #[error("invalid polyline byte {byte:#04x} at position {position}")]
    InvalidCharacter { byte: u8, position: usize },

    /// A run of continuation bytes longer than a 64-bit value can hold.
    #[error("polyline value overruns 64 bits at position {position}")]
    ValueTooLong { position: usize },
}

/// Decode a polyline string into (lon, lat) coordinate pairs.
///
/// The running (lat, lon) accumulator follows the wire format; the returned
/// pairs are axis-swapped to match GeoJSON convention.
///
/// # Example
/// ```
/// use map_matcher::polyline;
///
/// let coords = polyline::decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@", 5).unwrap();
/// assert_eq!(coords[0], [-120.2, 38.5]); // lon first
/// ```
pub fn decode(encoded: &str, precision: u32) -> Result<Vec<[f64; 2]>, DecodeError> {
    let factor = 10f64.powi(precision as i32);
    let bytes = encoded.as_bytes();
    let mut coordinates = Vec::new();
    let mut position = 0;
    let mut lat: i64 = 0;
    let mut lon: i64 = 0;

    while position < bytes.len() {
        lat += read_value(bytes, &mut position)?;
        lon += read_value(bytes, &mut position)?;
        coordinates.push([lon as f64 / factor, lat as f64 / factor]);
    }

    Ok(coordinates)
}

/// Encode (lon, lat) coordinate pairs into a polyline string.
///
/// Inverse of [`decode`] up to `10^-precision` rounding per coordinate.
pub fn encode(coordinates: &[[f64; 2]], precision: u32) -> String {
    let factor = 10f64.powi(precision as i32);
    let mut encoded = String::new();
    let mut prev_lat: i64 = 0;
    let mut prev_lon: i64 = 0;

    for &[lon, lat] in coordinates {
        let lat_scaled = (lat * factor).round() as i64;
        let lon_scaled = (lon * factor).round() as i64;
        write_value(lat_scaled - prev_lat, &mut encoded);
        write_value(lon_scaled - prev_lon, &mut encoded);
        prev_lat = lat_scaled;
        prev_lon = lon_scaled;
    }

    encoded
}

/// Read one zig-zag encoded delta starting at `*position`.
fn read_value(bytes: &[u8], position: &mut usize) -> Result<i64, DecodeError> {
    let mut accumulator: u64 = 0;
    let mut shift = 0;

    loop {
        let Some(&byte) = bytes.get(*position) else {
            return Err(DecodeError::UnexpectedEnd { position: *position });
        };
        if !(63..=126).contains(&byte) {
            return Err(DecodeError::InvalidCharacter {
                byte,
                position: *position,
            });
        }
        // 13 groups fill the accumulator; another shift would overflow.
        if shift >= 64 {
            return Err(DecodeError::ValueTooLong {
                position: *position,
            });
        }
        *position += 1;

        let group = u64::from(byte - 63);
        accumulator |= (group & 0x1f) << shift;
        shift += 5;

        if group & 0x20 == 0 {
            break;
        }
    }

    // Low bit carries the sign; the rest is the magnitude.
    let value = if accumulator & 1 == 1 {
        !(accumulator >> 1) as i64
    } else {
        (accumulator >> 1) as i64
    };
    Ok(value)
}

fn write_value(value: i64, encoded: &mut String) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    while zigzag >= 0x20 {
        encoded.push(((((zigzag & 0x1f) as u8) | 0x20) + 63) as char);
        zigzag >>= 5;
    }
    encoded.push((zigzag as u8 + 63) as char);
}
