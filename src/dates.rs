//! Date conversions for the packed, zoned and Julian fields carried by tape
//! labels, IEBCOPY control records and ISPF statistics.

use chrono::{NaiveDate, NaiveDateTime};

/// Decode a packed-BCD byte (two decimal nibbles). Returns `None` for
/// non-decimal nibbles.
pub(crate) fn bcd(byte: u8) -> Option<u8> {
    let hi = byte >> 4;
    let lo = byte & 0x0F;
    if hi > 9 || lo > 9 {
        return None;
    }
    Some(hi * 10 + lo)
}

/// Decode a 3-byte packed date: six nibbles `C Y Y D D D`, where the century
/// digit counts hundreds of years past 1900 (0 = 1900, 1 = 2000).
pub(crate) fn packed_date(bytes: &[u8]) -> Option<NaiveDate> {
    if bytes.len() != 3 || bytes.iter().all(|&b| b == 0) {
        return None;
    }
    let nibbles: Vec<u8> = bytes.iter().flat_map(|&b| vec![b >> 4, b & 0x0F]).collect();
    if nibbles.iter().any(|&n| n > 9) {
        return None;
    }
    let year = 1900 + nibbles[0] as i32 * 100 + nibbles[1] as i32 * 10 + nibbles[2] as i32;
    let day = nibbles[3] as u32 * 100 + nibbles[4] as u32 * 10 + nibbles[5] as u32;
    NaiveDate::from_yo_opt(year, day)
}

/// Decode a character Julian date field, either `yyddd` or `cyyddd`. Two-digit
/// years without a century digit pivot at 70.
pub(crate) fn julian_date(field: &str) -> Option<NaiveDate> {
    let digits = field.trim();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (year, day) = match digits.len() {
        5 => {
            let yy: i32 = digits[..2].parse().ok()?;
            let ddd: u32 = digits[2..].parse().ok()?;
            let year = if yy < 70 { 2000 + yy } else { 1900 + yy };
            (year, ddd)
        }
        6 => {
            let c: i32 = digits[..1].parse().ok()?;
            let yy: i32 = digits[1..3].parse().ok()?;
            let ddd: u32 = digits[3..].parse().ok()?;
            (1900 + c * 100 + yy, ddd)
        }
        _ => return None,
    };
    NaiveDate::from_yo_opt(year, day)
}

/// Parse the character timestamp used by text units: `YYYYMMDD` optionally
/// followed by `hhmmss` and fractional digits.
pub(crate) fn character_timestamp(digits: &str) -> Option<NaiveDateTime> {
    let digits = digits.trim();
    if digits.len() < 8 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = digits[..4].parse().ok()?;
    let month: u32 = digits[4..6].parse().ok()?;
    let day: u32 = digits[6..8].parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;

    let (hour, minute, second) = if digits.len() >= 14 {
        (
            digits[8..10].parse().ok()?,
            digits[10..12].parse().ok()?,
            digits[12..14].parse().ok()?,
        )
    } else {
        (0, 0, 0)
    };
    let micro = if digits.len() > 14 {
        let frac = &digits[14..digits.len().min(20)];
        let scale = 10u32.pow(6u32.saturating_sub(frac.len() as u32));
        frac.parse::<u32>().ok()? * scale
    } else {
        0
    };
    date.and_hms_micro_opt(hour, minute, second, micro)
}

/// ISO-8601 with microseconds, the rendering used throughout the JSON dump.
pub fn iso_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

pub fn iso_date(d: &NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}
