// tdds-kernel: monotonic ticks and fractional wire time

use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Timer tick unit in milliseconds.
pub const TICK_MS: u32 = 10;

/// Number of ticks per second.
pub const TICKS_PER_SEC: u32 = 1000 / TICK_MS;

/// Maximum tick delta that still counts as "in the future". Anything
/// larger is treated as an already-elapsed (wrapped) deadline, and the
/// value doubles as the "effectively infinite" sentinel.
pub const MAX_TICK_DIFF: u32 = 0x7fff_ffff;

/// Monotonic 10 ms tick counter since process start. Wraps at `u32::MAX`.
pub type Ticks = u32;

static START: OnceLock<Instant> = OnceLock::new();

fn start_instant() -> Instant {
    *START.get_or_init(Instant::now)
}

/// Current tick count. Single monotonic clock read.
#[inline]
pub fn now_ticks() -> Ticks {
    (start_instant().elapsed().as_millis() / TICK_MS as u128) as u32
}

/// Wrap-safe tick difference `new - old`.
#[inline]
pub fn ticks_diff(old: Ticks, new: Ticks) -> Ticks {
    new.wrapping_sub(old)
}

/// Wall-clock time in seconds and nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time {
    pub seconds: i32,
    pub nanos: u32,
}

/// Fractional timestamp as used on the wire: the high 32 bits hold
/// seconds, the low 32 bits a fraction of a second in 1/2^32 s units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FTime(i64);

impl FTime {
    pub const ZERO: FTime = FTime(0);

    /// Build from seconds and nanoseconds.
    #[inline]
    pub fn new(seconds: i32, nanos: u32) -> Self {
        FTime(((seconds as i64) << 32) | (((nanos as i64) << 32) / 1_000_000_000))
    }

    /// Build from seconds and a raw 1/2^32 s fraction.
    #[inline]
    pub fn from_fraction(seconds: i32, fraction: u32) -> Self {
        FTime(((seconds as i64) << 32) | fraction as i64)
    }

    #[inline]
    pub fn from_raw(raw: i64) -> Self {
        FTime(raw)
    }

    #[inline]
    pub fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn seconds(self) -> i32 {
        (self.0 >> 32) as i32
    }

    #[inline]
    pub fn fraction(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    #[inline]
    pub fn nanos(self) -> u32 {
        (((self.0 & 0xffff_ffff) as u64 * 1_000_000_000) >> 32) as u32
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Convert to timer ticks, rounding down.
    #[inline]
    pub fn to_ticks(self) -> Ticks {
        (self.0 as u64 / (0x1_0000_0000u64 / TICKS_PER_SEC as u64)) as Ticks
    }
}

impl From<Time> for FTime {
    fn from(t: Time) -> Self {
        FTime::new(t.seconds, t.nanos)
    }
}

impl From<FTime> for Time {
    fn from(ft: FTime) -> Self {
        Time {
            seconds: ft.seconds(),
            nanos: ft.nanos(),
        }
    }
}

impl Add for FTime {
    type Output = FTime;

    fn add(self, rhs: FTime) -> FTime {
        FTime(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for FTime {
    fn add_assign(&mut self, rhs: FTime) {
        self.0 = self.0.wrapping_add(rhs.0);
    }
}

impl Sub for FTime {
    type Output = FTime;

    fn sub(self, rhs: FTime) -> FTime {
        FTime(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for FTime {
    fn sub_assign(&mut self, rhs: FTime) {
        self.0 = self.0.wrapping_sub(rhs.0);
    }
}

/// Current wall-clock time.
pub fn now_time() -> Time {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Time {
        seconds: d.as_secs() as i32,
        nanos: d.subsec_nanos(),
    }
}

/// Current wall-clock time in fractional form.
pub fn now_ftime() -> FTime {
    now_time().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tick_diff_basic() {
        assert_eq!(ticks_diff(10, 40), 30);
        assert_eq!(ticks_diff(40, 40), 0);
    }

    #[test]
    fn tick_diff_wraps() {
        assert_eq!(ticks_diff(u32::MAX, 2), 3);
        assert_eq!(ticks_diff(u32::MAX - 10, u32::MAX), 10);
        assert_eq!(ticks_diff(0xffff_fff0, 0x10), 0x20);
    }

    #[test]
    fn ftime_second_nanos_split() {
        let ft = FTime::new(5, 500_000_000);
        assert_eq!(ft.seconds(), 5);
        // Fraction conversion loses a little under 1 ns.
        assert!((ft.nanos() as i64 - 500_000_000).abs() < 2);
    }

    #[test]
    fn ftime_half_second_fraction() {
        let ft = FTime::new(0, 500_000_000);
        assert_eq!(ft.fraction(), 0x8000_0000);
    }

    #[test]
    fn ftime_add_carries_into_seconds() {
        let a = FTime::new(1, 600_000_000);
        let b = FTime::new(0, 600_000_000);
        let sum = a + b;
        assert_eq!(sum.seconds(), 2);
        assert!((sum.nanos() as i64 - 200_000_000).abs() < 4);
    }

    #[test]
    fn ftime_sub_borrows() {
        let a = FTime::new(2, 100_000_000);
        let b = FTime::new(0, 600_000_000);
        let d = a - b;
        assert_eq!(d.seconds(), 1);
        assert!((d.nanos() as i64 - 500_000_000).abs() < 4);
    }

    #[test]
    fn ftime_ordering() {
        assert!(FTime::new(1, 0) < FTime::new(1, 1));
        assert!(FTime::new(2, 0) > FTime::new(1, 999_999_999));
        assert!(FTime::ZERO.is_zero());
    }

    #[test]
    fn ftime_to_ticks() {
        assert_eq!(FTime::new(1, 0).to_ticks(), TICKS_PER_SEC);
        assert_eq!(FTime::new(0, 10_000_000).to_ticks(), 1);
    }

    #[test]
    fn time_round_trip() {
        let t = Time {
            seconds: 1234,
            nanos: 56_789_000,
        };
        let back: Time = FTime::from(t).into();
        assert_eq!(back.seconds, t.seconds);
        assert!((back.nanos as i64 - t.nanos as i64).abs() < 2);
    }

    proptest! {
        // ticks_diff(a, a + b) == b for every in-range delta.
        #[test]
        fn prop_tick_diff_inverse(a in any::<u32>(), b in 0u32..=MAX_TICK_DIFF) {
            prop_assert_eq!(ticks_diff(a, a.wrapping_add(b)), b);
        }

        #[test]
        fn prop_ftime_add_sub_inverse(s1 in -1000i32..1000, n1 in 0u32..1_000_000_000,
                                      s2 in -1000i32..1000, n2 in 0u32..1_000_000_000) {
            let a = FTime::new(s1, n1);
            let b = FTime::new(s2, n2);
            prop_assert_eq!(a + b - b, a);
        }
    }
}
