//! Version stamps: fixed-width, lexically sortable creation tokens.
//!
//! A stamp is the local wall-clock time of the creation event formatted as
//! `YYYYMMDDHHMMSSffffff`. The generator keeps the last issued microsecond (since the epoch, so
//! independent of the zone) in an atomic and never hands out the same value twice, so two
//! creations landing in the same microsecond get neighbouring stamps instead of colliding on one
//! version directory.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, FixedOffset, Local, TimeDelta};

use crate::error::{Result, StampFsError};

pub const STAMP_FORMAT: &str = "%Y%m%d%H%M%S%6f";
pub const STAMP_LEN: usize = 20;

/// Source of wall-clock time for the generator, carrying the offset the stamp is written in.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

/// The host's local time zone, as `TZ` or `/etc/localtime` define it.
impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionStamp(String);

impl VersionStamp {
    fn from_datetime(at: DateTime<FixedOffset>) -> Self {
        Self(at.format(STAMP_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `name` looks like a version directory name.
    pub fn is_stamp(name: &str) -> bool {
        name.len() == STAMP_LEN && name.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for VersionStamp {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

pub struct StampGenerator {
    clock: Box<dyn Clock>,
    last_micros: AtomicI64,
}

impl StampGenerator {
    /// Generator on the system clock. Fails when the clock reads before the UNIX epoch.
    pub fn new() -> Result<Self> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| StampFsError::ClockUnavailable(e.to_string()))?;
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Result<Self> {
        let probe = clock.now().timestamp_micros();
        if probe < 0 {
            return Err(StampFsError::ClockUnavailable(format!(
                "clock reads {probe}us before the UNIX epoch"
            )));
        }
        Ok(Self {
            clock: Box::new(clock),
            last_micros: AtomicI64::new(i64::MIN),
        })
    }

    /// Issue the next stamp. Strictly greater than every stamp issued before by this generator.
    pub fn next_stamp(&self) -> VersionStamp {
        let now = self.clock.now();
        let now_micros = now.timestamp_micros();
        let mut last = self.last_micros.load(Ordering::Acquire);
        loop {
            let next = if now_micros > last { now_micros } else { last + 1 };
            match self.last_micros.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let at = now + TimeDelta::microseconds(next - now_micros);
                    return VersionStamp::from_datetime(at);
                }
                Err(actual) => last = actual,
            }
        }
    }
}

impl fmt::Debug for StampGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StampGenerator")
            .field("last_micros", &self.last_micros.load(Ordering::Relaxed))
            .finish()
    }
}
