//! Wall-clock time in nanoseconds, read from `CLOCK_REALTIME`.
//!
//! `CLOCK_REALTIME` is used (rather than a monotonic clock) so that the
//! adjustment performed during the boot-time clock-sync handshake is
//! reflected in every node's readings. The flip side is documented in the
//! warnings below.
//!
//! Warnings:
//!
//! 1. Do not adjust the system time during the lifetime of the process;
//!    readings would jump.
//! 2. Clock synchronization must complete before [`Time::instance`] is first
//!    called.

use std::sync::OnceLock;

use crate::errors::{Errno, Error};

/// Nanoseconds in one second.
pub const NS_IN_S: u64 = 1_000_000_000;
/// Nanoseconds in one millisecond.
pub const NS_IN_MS: u64 = 1_000_000;
/// Nanoseconds in one microsecond.
pub const NS_IN_US: u64 = 1_000;
/// Microseconds in one millisecond.
pub const US_IN_MS: u64 = 1_000;
/// Milliseconds in one second.
pub const MS_IN_S: u64 = 1_000;

/// Seconds the clock must be away from overflowing the 31-bit seconds field
/// for initialization to succeed. One year.
const SECONDS_AWAY_FROM_OVERFLOW_TO_INIT: i64 = 365 * 24 * 60 * 60;

static INSTANCE: OnceLock<Result<Time, Error>> = OnceLock::new();

/// Process-wide time source.
pub struct Time {
    /// Reading taken at initialization.
    at_init_ns: u64,
}

impl Time {
    /// Access the singleton, initializing it on first call.
    ///
    /// Initialization reads the clock once and refuses to come up with
    /// [`Error::OverflowImminent`] if the seconds field is within one year
    /// of its maximum.
    pub fn instance() -> Result<&'static Time, Error> {
        INSTANCE.get_or_init(Time::init).as_ref().map_err(|&e| e)
    }

    fn init() -> Result<Time, Error> {
        let (sec, nsec) = clock_gettime(libc::CLOCK_REALTIME)?;

        let max_allowed = i64::from(i32::MAX) - SECONDS_AWAY_FROM_OVERFLOW_TO_INIT;
        if sec > max_allowed {
            return Err(Error::OverflowImminent);
        }

        Ok(Time {
            at_init_ns: sec as u64 * NS_IN_S + nsec as u64,
        })
    }

    /// Current time in nanoseconds.
    ///
    /// Never decreases across successive calls under normal operation; equal
    /// readings are legal.
    pub fn now_ns(&self) -> Result<u64, Error> {
        let (sec, nsec) = clock_gettime(libc::CLOCK_REALTIME)?;
        Ok(sec as u64 * NS_IN_S + nsec as u64)
    }

    /// The reading taken when the singleton came up.
    pub fn init_time_ns(&self) -> u64 {
        self.at_init_ns
    }
}

/// Monotonic reading for durations (receive deadlines, jitter measurement).
pub(crate) fn monotonic_ns() -> Result<u64, Error> {
    let (sec, nsec) = clock_gettime(libc::CLOCK_MONOTONIC)?;
    Ok(sec as u64 * NS_IN_S + nsec as u64)
}

fn clock_gettime(clock: libc::clockid_t) -> Result<(i64, i64), Error> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(clock, &mut ts) } != 0 {
        return Err(Error::ClockRead(Errno::last()));
    }
    Ok((ts.tv_sec as i64, ts.tv_nsec as i64))
}
