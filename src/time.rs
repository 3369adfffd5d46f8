//! 80-bit fixed-point time values.
//!
//! PTP carries time as 48 bits of seconds plus 32 bits of nanoseconds.
//! Internally we keep a signed seconds field and a signed nanosecond field
//! so the same type can represent absolute timestamps and offsets.
//! All arithmetic normalizes so that the nanosecond field stays within
//! (-10^9, 10^9) and carries the same sign as the value.

use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};

pub const NS_PER_SEC: i64 = 1_000_000_000;

/// Maximum wire seconds value: 2^48 - 1.
pub const MAX_WIRE_SECONDS: i64 = (1 << 48) - 1;

/// Internal time value: signed seconds + signed nanoseconds.
///
/// Invariants after normalization:
/// - `nanoseconds.abs() < 1_000_000_000`
/// - if `seconds != 0`, then `nanoseconds` is zero or has the same sign
/// - negative sub-second values have `seconds == 0` and `nanoseconds < 0`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: i32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        seconds: 0,
        nanoseconds: 0,
    };

    pub fn new(seconds: i64, nanoseconds: i32) -> Self {
        let mut ts = Timestamp {
            seconds,
            nanoseconds,
        };
        ts.normalize();
        ts
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Timestamp {
            seconds: nanos / NS_PER_SEC,
            nanoseconds: (nanos % NS_PER_SEC) as i32,
        }
    }

    /// Total nanoseconds. Saturates rather than wraps on extreme values;
    /// offsets fed to the servo are always far below the i64 range.
    pub fn as_nanos(&self) -> i64 {
        self.seconds
            .saturating_mul(NS_PER_SEC)
            .saturating_add(self.nanoseconds as i64)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + self.nanoseconds as f64 / 1e9
    }

    pub fn from_secs_f64(value: f64) -> Self {
        let seconds = value.trunc() as i64;
        let nanoseconds = (value.fract() * 1e9).round() as i32;
        Timestamp::new(seconds, nanoseconds)
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp::new(d.as_secs() as i64, d.subsec_nanos() as i32),
            Err(e) => {
                let d = e.duration();
                Timestamp::new(-(d.as_secs() as i64), -(d.subsec_nanos() as i32))
            }
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        Timestamp::new(d.as_secs() as i64, d.subsec_nanos() as i32)
    }

    fn normalize(&mut self) {
        self.seconds += self.nanoseconds as i64 / NS_PER_SEC;
        self.nanoseconds %= NS_PER_SEC as i32;

        if self.seconds > 0 && self.nanoseconds < 0 {
            self.seconds -= 1;
            self.nanoseconds += NS_PER_SEC as i32;
        } else if self.seconds < 0 && self.nanoseconds > 0 {
            self.seconds += 1;
            self.nanoseconds -= NS_PER_SEC as i32;
        }
    }

    pub fn add(&self, other: &Timestamp) -> Timestamp {
        Timestamp::new(
            self.seconds + other.seconds,
            // i32 + i32 can overflow; widen before re-splitting
            0,
        )
        .add_nanos(self.nanoseconds as i64 + other.nanoseconds as i64)
    }

    fn add_nanos(mut self, nanos: i64) -> Timestamp {
        self.seconds += nanos / NS_PER_SEC;
        let mut ts = Timestamp {
            seconds: self.seconds,
            nanoseconds: (nanos % NS_PER_SEC) as i32,
        };
        ts.normalize();
        ts
    }

    pub fn sub(&self, other: &Timestamp) -> Timestamp {
        Timestamp::new(self.seconds - other.seconds, 0)
            .add_nanos(self.nanoseconds as i64 - other.nanoseconds as i64)
    }

    pub fn neg(&self) -> Timestamp {
        Timestamp {
            seconds: -self.seconds,
            nanoseconds: -self.nanoseconds,
        }
    }

    /// Halve the value. Rounds the nanosecond component half toward
    /// negative infinity so repeated halving cannot drift positive.
    pub fn half(&self) -> Timestamp {
        let carry = (self.seconds % 2) * NS_PER_SEC;
        let nanos = (self.nanoseconds as i64 + carry).div_euclid(2);
        Timestamp::new(self.seconds / 2, 0).add_nanos(nanos)
    }

    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.nanoseconds == 0
    }

    pub fn is_negative(&self) -> bool {
        self.seconds < 0 || self.nanoseconds < 0
    }

    /// Strip the sign componentwise. A value like -1.2 s is held as
    /// (-1 s, -200 ms) so componentwise abs never loses a second boundary.
    pub fn abs(&self) -> Timestamp {
        Timestamp {
            seconds: self.seconds.abs(),
            nanoseconds: self.nanoseconds.abs(),
        }
    }

    pub fn clear(&mut self) {
        self.seconds = 0;
        self.nanoseconds = 0;
    }

    /// True when the two values are within `nanos` of each other.
    pub fn is_close(&self, other: &Timestamp, nanos: i64) -> bool {
        self.sub(other).abs().as_nanos() <= nanos
    }

    /// Pack into IEEE 1588 wire form: 48-bit unsigned seconds followed by
    /// a 32-bit unsigned nanosecond field, both big-endian. Negative
    /// values cannot be represented on the wire.
    pub fn to_wire(&self, buf: &mut [u8; 10]) -> bool {
        if self.is_negative() || self.seconds > MAX_WIRE_SECONDS {
            return false;
        }
        BigEndian::write_u16(&mut buf[0..2], (self.seconds >> 32) as u16);
        BigEndian::write_u32(&mut buf[2..6], (self.seconds & 0xFFFF_FFFF) as u32);
        BigEndian::write_u32(&mut buf[6..10], self.nanoseconds as u32);
        true
    }

    pub fn from_wire(buf: &[u8]) -> Option<Timestamp> {
        if buf.len() < 10 {
            return None;
        }
        let msb = BigEndian::read_u16(&buf[0..2]) as i64;
        let lsb = BigEndian::read_u32(&buf[2..6]) as i64;
        let nanos = BigEndian::read_u32(&buf[6..10]);
        if nanos >= NS_PER_SEC as u32 {
            return None;
        }
        Some(Timestamp {
            seconds: (msb << 32) | lsb,
            nanoseconds: nanos as i32,
        })
    }

    /// Convert a correction field (signed 64-bit scaled nanoseconds,
    /// 48 integer + 16 fractional bits) to a time value. Fractional
    /// nanoseconds are discarded per 1588 5.3.2.
    pub fn from_correction(correction: i64) -> Timestamp {
        let sign = if correction < 0 { -1 } else { 1 };
        let scaled = correction.unsigned_abs() >> 16;
        Timestamp {
            seconds: sign * (scaled / NS_PER_SEC as u64) as i64,
            nanoseconds: (sign * (scaled % NS_PER_SEC as u64) as i64) as i32,
        }
    }

    pub fn to_correction(&self) -> i64 {
        self.as_nanos() << 16
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        // Normalized values order lexicographically on (seconds, nanoseconds).
        (self.seconds, self.nanoseconds).cmp(&(other.seconds, other.nanoseconds))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_negative() { "-" } else { "" };
        write!(
            f,
            "{}{}.{:09}",
            sign,
            self.seconds.abs(),
            self.nanoseconds.abs()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_carries_sign() {
        let t = Timestamp::new(1, -1);
        assert_eq!(t, Timestamp::new(0, 999_999_999));

        let t = Timestamp::new(-1, 1);
        assert_eq!(t.seconds, 0);
        assert_eq!(t.nanoseconds, -999_999_999);

        // nanosecond overflow carries into seconds
        let t = Timestamp::new(0, 900_000_000).add(&Timestamp::new(0, 900_000_000));
        assert_eq!(t, Timestamp::new(1, 800_000_000));
    }

    #[test]
    fn test_add_sub_roundtrip() {
        let a = Timestamp::new(100, 600_000_000);
        let b = Timestamp::new(250, 100_000_000);
        let d = b.sub(&a);
        assert_eq!(a.add(&d), b);

        let a = Timestamp::new(-3, -400_000_000);
        let b = Timestamp::new(2, 900_000_000);
        assert_eq!(a.add(&b.sub(&a)), b);
    }

    #[test]
    fn test_sub_negative_subsecond() {
        let a = Timestamp::new(10, 100_000_000);
        let b = Timestamp::new(10, 300_000_000);
        let d = a.sub(&b);
        assert_eq!(d.seconds, 0);
        assert_eq!(d.nanoseconds, -200_000_000);
        assert!(d.is_negative());
    }

    #[test]
    fn test_half_rounds_toward_negative_infinity() {
        assert_eq!(Timestamp::new(1, 0).half(), Timestamp::new(0, 500_000_000));
        assert_eq!(Timestamp::new(0, 5).half(), Timestamp::new(0, 2));
        assert_eq!(Timestamp::new(0, -5).half(), Timestamp::new(0, -3));
        assert_eq!(Timestamp::new(3, 0).half(), Timestamp::new(1, 500_000_000));
    }

    #[test]
    fn test_abs_keeps_second_boundary() {
        let t = Timestamp::new(-1, -200_000_000);
        assert_eq!(t.abs(), Timestamp::new(1, 200_000_000));
    }

    #[test]
    fn test_ordering() {
        let mut v = vec![
            Timestamp::new(0, 5),
            Timestamp::new(-1, -1),
            Timestamp::new(0, -5),
            Timestamp::new(1, 0),
            Timestamp::ZERO,
        ];
        v.sort();
        assert_eq!(
            v,
            vec![
                Timestamp::new(-1, -1),
                Timestamp::new(0, -5),
                Timestamp::ZERO,
                Timestamp::new(0, 5),
                Timestamp::new(1, 0),
            ]
        );
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut buf = [0u8; 10];
        let t = Timestamp::new(1_000_000_020, 500_000_000);
        assert!(t.to_wire(&mut buf));
        assert_eq!(Timestamp::from_wire(&buf), Some(t));

        // 48-bit boundary
        let t = Timestamp::new(MAX_WIRE_SECONDS, 999_999_999);
        assert!(t.to_wire(&mut buf));
        assert_eq!(Timestamp::from_wire(&buf), Some(t));

        // negative values are not representable
        assert!(!Timestamp::new(0, -1).to_wire(&mut buf));
        assert!(!Timestamp::new(MAX_WIRE_SECONDS + 1, 0).to_wire(&mut buf));
    }

    #[test]
    fn test_wire_rejects_bad_nanos() {
        let mut buf = [0u8; 10];
        BigEndian::write_u32(&mut buf[6..10], 1_500_000_000);
        assert_eq!(Timestamp::from_wire(&buf), None);
    }

    #[test]
    fn test_correction_field() {
        // 450000 ns correction, scaled by 2^16
        let c = 450_000i64 << 16;
        assert_eq!(
            Timestamp::from_correction(c),
            Timestamp::new(0, 450_000)
        );
        assert_eq!(
            Timestamp::from_correction(-c),
            Timestamp::new(0, -450_000)
        );
        // fractional nanoseconds are dropped
        assert_eq!(
            Timestamp::from_correction((1i64 << 16) + 0x8000),
            Timestamp::new(0, 1)
        );
        // over one second
        let c = (2 * NS_PER_SEC + 7) << 16;
        assert_eq!(Timestamp::from_correction(c), Timestamp::new(2, 7));
    }

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::new(1, 500).to_string(), "1.000000500");
        assert_eq!(Timestamp::new(0, -450_000).to_string(), "-0.000450000");
    }

    #[test]
    fn test_is_close() {
        let a = Timestamp::new(5, 100);
        let b = Timestamp::new(5, 900);
        assert!(a.is_close(&b, 1000));
        assert!(!a.is_close(&b, 500));
    }
}
