//! GPS time conversion.
//!
//! GPS time counts SI seconds since 1980-01-06T00:00:00Z and, unlike UTC, is
//! not adjusted for leap seconds. Conversion therefore adds the number of
//! leap seconds inserted between the GPS epoch and the given instant.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// The GPS epoch (1980-01-06T00:00:00Z) as a Unix timestamp.
const GPS_EPOCH_UNIX: i64 = 315_964_800;

// Unix timestamps at which a leap second took effect, 1981-07-01 through
// 2017-01-01. No leap second has been scheduled since.
const LEAP_SECONDS: [i64; 18] = [
    362_793_600,   // 1981-07-01
    394_329_600,   // 1982-07-01
    425_865_600,   // 1983-07-01
    489_024_000,   // 1985-07-01
    567_993_600,   // 1988-01-01
    631_152_000,   // 1990-01-01
    662_688_000,   // 1991-01-01
    709_948_800,   // 1992-07-01
    741_484_800,   // 1993-07-01
    773_020_800,   // 1994-07-01
    820_454_400,   // 1996-01-01
    867_715_200,   // 1997-07-01
    915_148_800,   // 1999-01-01
    1_136_073_600, // 2006-01-01
    1_230_768_000, // 2009-01-01
    1_341_100_800, // 2012-07-01
    1_435_708_800, // 2015-07-01
    1_483_228_800, // 2017-01-01
];

/// Duration between the GPS epoch and `t`.
pub fn time_since_gps_epoch(t: DateTime<Utc>) -> Duration {
    let unix = t.timestamp();
    let leaps = LEAP_SECONDS.iter().filter(|&&l| l <= unix).count() as i64;
    Duration::seconds(unix - GPS_EPOCH_UNIX + leaps)
        + Duration::nanoseconds(t.timestamp_subsec_nanos() as i64)
}

/// Inverse of [`time_since_gps_epoch`].
pub fn time_from_gps_epoch(since_epoch: Duration) -> DateTime<Utc> {
    let mut unix = GPS_EPOCH_UNIX + since_epoch.num_seconds();
    let leaps = LEAP_SECONDS.iter().filter(|&&l| l <= unix).count() as i64;
    unix -= leaps;
    // A leap second may fall inside the correction itself.
    let leaps_after = LEAP_SECONDS.iter().filter(|&&l| l <= unix).count() as i64;
    unix += leaps - leaps_after;
    Utc.timestamp_opt(unix, 0).single().unwrap_or_default()
}

/// GPS-epoch seconds of `t`, wrapped to 32 bits as transmitted in session
/// times and clock-sync commands.
pub fn seconds_mod_2_32(t: DateTime<Utc>) -> u32 {
    (time_since_gps_epoch(t).num_seconds() as u64 % (1u64 << 32)) as u32
}
