//! Utility functions for the elm327-rust-ble crate.

/// Kilometres per statute mile.
const KM_PER_MILE: f64 = 1.609_344;

/// Convert kilometres per hour to miles per hour.
///
/// # Example
///
/// ```
/// use elm327_rust_ble::kph_to_mph;
///
/// let mph = kph_to_mph(100.0);
/// assert!((mph - 62.137).abs() < 0.001);
/// ```
#[inline]
pub fn kph_to_mph(kph: f64) -> f64 {
    kph / KM_PER_MILE
}

/// Convert miles per hour to kilometres per hour.
///
/// # Example
///
/// ```
/// use elm327_rust_ble::mph_to_kph;
///
/// let kph = mph_to_kph(60.0);
/// assert!((kph - 96.561).abs() < 0.001);
/// ```
#[inline]
pub fn mph_to_kph(mph: f64) -> f64 {
    mph * KM_PER_MILE
}

/// Value of a single ASCII hex digit, case-insensitive.
#[inline]
pub fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode consecutive ASCII hex pairs into bytes.
///
/// Stops at the first pair that is not valid hex. A trailing odd nibble is
/// ignored.
///
/// # Example
///
/// ```
/// use elm327_rust_ble::utils::parse_hex_pairs;
///
/// assert_eq!(parse_hex_pairs("0C1a"), vec![0x0C, 0x1A]);
/// assert_eq!(parse_hex_pairs("28ZZ11"), vec![0x28]);
/// ```
pub fn parse_hex_pairs(hex: &str) -> Vec<u8> {
    hex.as_bytes()
        .chunks_exact(2)
        .map_while(|pair| Some(hex_digit(pair[0])? << 4 | hex_digit(pair[1])?))
        .collect()
}
