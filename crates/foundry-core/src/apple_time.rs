//! Conversion between wall-clock instants and the artifact's native
//! timestamp: signed nanoseconds since 2001-01-01T00:00:00Z.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::FoundryError;

/// Seconds between the Unix epoch and 2001-01-01T00:00:00Z.
pub const APPLE_EPOCH_UNIX_SECONDS: i64 = 978_307_200;

const NANOS_PER_SECOND: i64 = 1_000_000_000;
const APPLE_EPOCH_UNIX_NANOS: i128 = APPLE_EPOCH_UNIX_SECONDS as i128 * NANOS_PER_SECOND as i128;

/// Values below this magnitude are whole seconds written by pre-2017 clients.
const LEGACY_SECONDS_CEILING: i64 = 10_000_000_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(transparent)]
pub struct NativeTimestamp(pub i64);

impl NativeTimestamp {
    pub const EPOCH: Self = Self(0);

    #[must_use]
    pub fn nanos(self) -> i64 {
        self.0
    }

    /// Interpret a legacy whole-second value.
    ///
    /// # Errors
    /// Returns [`FoundryError::TimestampOutOfRange`] when the nanosecond value overflows.
    pub fn from_legacy_seconds(seconds: i64) -> Result<Self, FoundryError> {
        seconds.checked_mul(NANOS_PER_SECOND).map(Self).ok_or_else(|| {
            FoundryError::TimestampOutOfRange(format!("{seconds} seconds since 2001-01-01"))
        })
    }

    /// Heuristic for rows written with second resolution.
    #[must_use]
    pub fn is_legacy_seconds(raw: i64) -> bool {
        raw != 0 && raw.abs() < LEGACY_SECONDS_CEILING
    }

    #[must_use]
    pub fn saturating_add_nanos(self, nanos: i64) -> Self {
        Self(self.0.saturating_add(nanos))
    }
}

impl Display for NativeTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Convert a wall-clock instant to the native representation.
///
/// # Errors
/// Returns [`FoundryError::TimestampOutOfRange`] when the instant does not fit
/// in signed 64-bit nanoseconds around the 2001 epoch.
pub fn now_to_native(instant: OffsetDateTime) -> Result<NativeTimestamp, FoundryError> {
    let relative = instant.unix_timestamp_nanos() - APPLE_EPOCH_UNIX_NANOS;
    i64::try_from(relative).map(NativeTimestamp).map_err(|_| {
        FoundryError::TimestampOutOfRange(format!("{instant} is outside the native range"))
    })
}

/// Convert a native timestamp back to a UTC instant.
///
/// # Errors
/// Returns [`FoundryError::TimestampOutOfRange`] when the instant is not
/// representable as an [`OffsetDateTime`].
pub fn native_to_time(native: NativeTimestamp) -> Result<OffsetDateTime, FoundryError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(native.0) + APPLE_EPOCH_UNIX_NANOS)
        .map_err(|err| FoundryError::TimestampOutOfRange(format!("{native}: {err}")))
}

/// Native timestamp for the current instant.
///
/// # Errors
/// Returns [`FoundryError::TimestampOutOfRange`] only for clocks far outside 1709..2293.
pub fn native_now() -> Result<NativeTimestamp, FoundryError> {
    now_to_native(OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn apple_epoch_maps_to_zero() -> Result<(), FoundryError> {
        assert_eq!(now_to_native(datetime!(2001-01-01 00:00:00 UTC))?, NativeTimestamp::EPOCH);
        assert_eq!(native_to_time(NativeTimestamp::EPOCH)?, datetime!(2001-01-01 00:00:00 UTC));
        Ok(())
    }

    #[test]
    fn known_instant_converts_to_expected_nanos() -> Result<(), FoundryError> {
        let native = now_to_native(datetime!(2024-06-01 12:30:00.000000123 UTC))?;
        assert_eq!(native.nanos(), 738_937_800_000_000_123);
        Ok(())
    }

    #[test]
    fn offsets_are_normalized_to_the_same_instant() -> Result<(), FoundryError> {
        let utc = now_to_native(datetime!(2024-03-10 18:00:00 UTC))?;
        let shifted = now_to_native(datetime!(2024-03-10 13:00:00 -5))?;
        assert_eq!(utc, shifted);
        Ok(())
    }

    #[test]
    fn instants_before_the_epoch_are_negative() -> Result<(), FoundryError> {
        let native = now_to_native(datetime!(2000-12-31 23:59:59 UTC))?;
        assert_eq!(native.nanos(), -NANOS_PER_SECOND);
        Ok(())
    }

    #[test]
    fn out_of_range_instants_are_rejected() {
        let far_future = datetime!(2400-01-01 00:00:00 UTC);
        assert!(matches!(now_to_native(far_future), Err(FoundryError::TimestampOutOfRange(_))));
    }

    #[test]
    fn legacy_seconds_are_detected_and_scaled() -> Result<(), FoundryError> {
        assert!(NativeTimestamp::is_legacy_seconds(600_000_000));
        assert!(!NativeTimestamp::is_legacy_seconds(600_000_000_000_000_000));
        assert!(!NativeTimestamp::is_legacy_seconds(0));
        assert_eq!(
            NativeTimestamp::from_legacy_seconds(600_000_000)?,
            NativeTimestamp(600_000_000_000_000_000)
        );
        assert!(NativeTimestamp::from_legacy_seconds(i64::MAX).is_err());
        Ok(())
    }

    proptest! {
        #[test]
        fn property_native_round_trip_is_exact(nanos in any::<i64>()) {
            let instant = native_to_time(NativeTimestamp(nanos));
            prop_assert!(instant.is_ok());
            let instant = instant.unwrap_or_else(|_| unreachable!());
            let back = now_to_native(instant);
            prop_assert_eq!(back, Ok(NativeTimestamp(nanos)));
        }

        #[test]
        fn property_wall_clock_round_trip_is_exact(
            seconds in -2_000_000_000_i64..6_000_000_000_i64,
            subsec in 0_i64..1_000_000_000_i64,
        ) {
            let unix_nanos = i128::from(seconds) * 1_000_000_000 + i128::from(subsec);
            let instant = OffsetDateTime::from_unix_timestamp_nanos(unix_nanos);
            prop_assert!(instant.is_ok());
            let instant = instant.unwrap_or_else(|_| unreachable!());
            let native = now_to_native(instant);
            prop_assert!(native.is_ok());
            prop_assert_eq!(native_to_time(native.unwrap_or_else(|_| unreachable!())), Ok(instant));
        }
    }
}
