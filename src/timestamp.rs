//! Device clock to wall clock translation.

use chrono::{DateTime, Utc};

use crate::traits::DeviceDriver;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Converts device monotonic timestamps to UTC using an offset fixed at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampTranslator {
    offset_ns: Option<i64>,
}

impl TimestampTranslator {
    /// Fix the offset from one reading of each clock.
    ///
    /// Either reading being absent leaves the translator unavailable.
    pub fn establish(wall_now: Option<DateTime<Utc>>, monotonic_now_ns: Option<i64>) -> Self {
        let offset_ns = wall_now
            .and_then(|wall| wall.timestamp_nanos_opt())
            .zip(monotonic_now_ns)
            .and_then(|(wall, monotonic)| wall.checked_sub(monotonic));
        Self { offset_ns }
    }

    /// Fix the offset against the driver's frame clock.
    pub fn from_driver(driver: &dyn DeviceDriver) -> Self {
        Self::establish(Some(Utc::now()), driver.monotonic_now_ns())
    }

    /// A translator that never produces a wall-clock time.
    pub const fn unavailable() -> Self {
        Self { offset_ns: None }
    }

    #[cfg(test)]
    const fn is_available(&self) -> bool {
        self.offset_ns.is_some()
    }

    /// Wall-clock instant at which the device clock read zero.
    pub fn epoch(&self) -> Option<DateTime<Utc>> {
        self.offset_ns.and_then(from_nanos)
    }

    /// Translate a device timestamp. `None` when unavailable or out of range.
    pub fn translate(&self, device_ns: Option<i64>) -> Option<DateTime<Utc>> {
        let ns = self.offset_ns?.checked_add(device_ns?)?;
        from_nanos(ns)
    }

    /// Translate a device timestamp to UTC milliseconds.
    pub fn translate_ms(&self, device_ns: Option<i64>) -> Option<i64> {
        self.translate(device_ns).map(|utc| utc.timestamp_millis())
    }
}

fn from_nanos(ns: i64) -> Option<DateTime<Utc>> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let nanos = ns.rem_euclid(NANOS_PER_SEC) as u32;
    DateTime::from_timestamp(ns.div_euclid(NANOS_PER_SEC), nanos)
}

/// Render a UTC instant the way frame logs print it.
pub fn format_utc(utc: &DateTime<Utc>) -> String {
    utc.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
