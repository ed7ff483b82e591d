//! Fixed-point timestamps.
//!
//! A `Timestamp` packs seconds in the high 32 bits and a 2^-32 s fraction in
//! the low 32 bits, so interval arithmetic is plain integer arithmetic and a
//! whole-second interval is `ts_from_secs(n)`.

use std::time::SystemTime;

pub type Timestamp = u64;

/// Largest representable timestamp, used as the "no end bound" marker.
pub const TS_MAX: Timestamp = !0;

#[inline]
pub fn ts_from_secs(secs: u64) -> Timestamp {
    secs << 32
}

#[inline]
pub fn ts_from_parts(secs: u64, nanos: u32) -> Timestamp {
    (secs << 32) | (((nanos as u64) << 32) / 1_000_000_000)
}

#[inline]
pub fn ts_secs(ts: Timestamp) -> u64 {
    ts >> 32
}

#[inline]
pub fn ts_nanos(ts: Timestamp) -> u32 {
    (((ts & 0xffff_ffff) * 1_000_000_000) >> 32) as u32
}

/// Start of the window of length `ivl` that contains `ts`.
#[inline]
pub fn ts_floor(ts: Timestamp, ivl: Timestamp) -> Timestamp {
    ts - (ts % ivl)
}

/// Returns the current wall clock as a `Timestamp`.
#[inline]
pub fn now() -> Timestamp {
    let elapsed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised");
    ts_from_parts(elapsed.as_secs(), elapsed.subsec_nanos())
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}
