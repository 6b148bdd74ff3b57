//! Hybrid Logical Clock: a 64-bit timestamp combining wall-clock milliseconds
//! with a monotonic tie-break counter, so a single clock's successive `now()`
//! calls always compare strictly increasing even across wall-clock
//! regressions.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

const COUNTER_BITS: u32 = 16;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Opaque 64-bit HLC value: high 48 bits wall-clock ms, low 16 bits counter.
///
/// Serialises as a base-10 string in JSON payloads so the
/// value survives hosts whose JSON numbers are lossy 53-bit floats; binary
/// frames use [`HlcTimestamp::to_be_bytes`]/[`HlcTimestamp::from_be_bytes`]
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HlcTimestamp(pub u64);

impl HlcTimestamp {
    pub const ZERO: HlcTimestamp = HlcTimestamp(0);

    pub fn encode(wall_ms: u64, counter: u16) -> Self {
        HlcTimestamp((wall_ms << COUNTER_BITS) | (counter as u64 & COUNTER_MASK))
    }

    pub fn decode(self) -> (u64, u16) {
        (self.0 >> COUNTER_BITS, (self.0 & COUNTER_MASK) as u16)
    }

    pub fn wall_ms(self) -> u64 {
        self.decode().0
    }

    pub fn counter(self) -> u16 {
        self.decode().1
    }

    pub fn compare(a: HlcTimestamp, b: HlcTimestamp) -> Ordering {
        a.0.cmp(&b.0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        HlcTimestamp(u64::from_be_bytes(bytes))
    }
}

impl Serialize for HlcTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl Default for HlcTimestamp {
    fn default() -> Self {
        HlcTimestamp::ZERO
    }
}

impl<'de> Deserialize<'de> for HlcTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<u64>()
            .map(HlcTimestamp)
            .map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HlcTimestamp {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(HlcTimestamp)
    }
}

/// Injectable wall-clock source, so clocks are deterministic in tests.
pub trait WallSource: Send + Sync {
    fn wall_ms(&self) -> u64;
}

pub struct SystemWallSource;

impl WallSource for SystemWallSource {
    fn wall_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

struct ClockState {
    last_wall: u64,
    last_counter: u16,
}

/// Monotonic Hybrid Logical Clock. Cheaply cloneable (`Arc`-free single
/// owner is fine since all mutation happens behind an internal mutex).
pub struct Hlc {
    wall_source: Box<dyn WallSource>,
    state: Mutex<ClockState>,
}

impl Hlc {
    pub fn new() -> Self {
        Self::with_wall_source(Box::new(SystemWallSource))
    }

    pub fn with_wall_source(wall_source: Box<dyn WallSource>) -> Self {
        Self {
            wall_source,
            state: Mutex::new(ClockState {
                last_wall: 0,
                last_counter: 0,
            }),
        }
    }

    /// Produce a timestamp strictly greater than every timestamp this clock
    /// has previously produced.
    pub fn now(&self) -> HlcTimestamp {
        let wall = self.wall_source.wall_ms();
        let mut state = self.state.lock().expect("hlc mutex poisoned");

        if wall > state.last_wall {
            state.last_wall = wall;
            state.last_counter = 0;
        } else if state.last_counter == u16::MAX {
            // counter overflow: advance wall by one tick and reset counter
            state.last_wall += 1;
            state.last_counter = 0;
        } else {
            state.last_counter += 1;
        }

        HlcTimestamp::encode(state.last_wall, state.last_counter)
    }

    pub fn encode(&self, wall_ms: u64, counter: u16) -> HlcTimestamp {
        HlcTimestamp::encode(wall_ms, counter)
    }

    pub fn decode(&self, ts: HlcTimestamp) -> (u64, u16) {
        ts.decode()
    }

    pub fn compare(&self, a: HlcTimestamp, b: HlcTimestamp) -> Ordering {
        HlcTimestamp::compare(a, b)
    }
}

impl Default for Hlc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    struct FixedWallSource(AtomicU64);

    impl WallSource for FixedWallSource {
        fn wall_ms(&self) -> u64 {
            self.0.load(AtomicOrdering::SeqCst)
        }
    }

    #[test]
    fn successive_now_calls_strictly_increase() {
        let clock = Hlc::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert_eq!(Hlc::compare_pub(last, next), Ordering::Less);
            last = next;
        }
    }

    #[test]
    fn counter_increments_on_wall_regression() {
        let source = FixedWallSource(AtomicU64::new(1_000));
        let clock = Hlc::with_wall_source(Box::new(source));

        // a fixed time source means wall never advances, so subsequent
        // calls must bump the counter instead to stay strictly increasing.
        let a = clock.now();
        let b = clock.now();
        let c = clock.now();

        assert!(b.0 > a.0);
        assert!(c.0 > b.0);
        assert_eq!(a.wall_ms(), b.wall_ms());
        assert_eq!(b.wall_ms(), c.wall_ms());
        assert_eq!(a.counter() + 1, b.counter());
    }

    #[test]
    fn counter_overflow_bumps_wall() {
        let source = FixedWallSource(AtomicU64::new(42));
        let clock = Hlc::with_wall_source(Box::new(source));
        {
            let mut state = clock.state.lock().unwrap();
            state.last_wall = 42;
            state.last_counter = u16::MAX;
        }
        let next = clock.now();
        assert_eq!(next.wall_ms(), 43);
        assert_eq!(next.counter(), 0);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let ts = HlcTimestamp::encode(1_700_000_000_000, 12);
        let (wall, ctr) = ts.decode();
        assert_eq!(wall, 1_700_000_000_000);
        assert_eq!(ctr, 12);
    }

    #[test]
    fn display_and_parse_roundtrip() {
        let ts = HlcTimestamp::encode(123, 4);
        let s = ts.to_string();
        let parsed: HlcTimestamp = s.parse().unwrap();
        assert_eq!(ts, parsed);
    }

    impl Hlc {
        fn compare_pub(a: HlcTimestamp, b: HlcTimestamp) -> Ordering {
            HlcTimestamp::compare(a, b)
        }
    }
}
