//! Realistic timestamp sequences for a conversation.
//!
//! Messages are grouped into bursty sessions separated by long, circadian
//! weighted gaps. Gaps inside a session follow the sender's latency class.
//! The raw sequence is compressed proportionally when it overruns the window,
//! so ordering and relative spacing survive.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::apple_time::{now_to_native, NativeTimestamp};
use crate::{FoundryError, LatencyClass};

/// Profile key for the artifact owner.
pub const OWNER_PROFILE_KEY: &str = "me";

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Relative likelihood of a conversation resuming at each local hour.
const CIRCADIAN_WEIGHTS: [f64; 24] = [
    0.08, 0.04, 0.02, 0.02, 0.02, 0.04, 0.10, 0.30, 0.60, 0.80, 0.90, 0.95, //
    1.00, 0.95, 0.90, 0.90, 0.90, 0.95, 1.00, 1.00, 1.00, 0.90, 0.60, 0.25,
];

/// Latency class per participant identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct BehaviorProfiles {
    classes: BTreeMap<String, LatencyClass>,
}

impl BehaviorProfiles {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, participant: impl Into<String>, class: LatencyClass) -> Self {
        self.insert(participant, class);
        self
    }

    pub fn insert(&mut self, participant: impl Into<String>, class: LatencyClass) {
        self.classes.insert(participant.into(), class);
    }

    /// Class for `participant`, falling back to [`LatencyClass::default`].
    #[must_use]
    pub fn class_for(&self, participant: &str) -> LatencyClass {
        self.classes.get(participant).copied().unwrap_or_default()
    }

    /// Class for a message sender, `None` being the owner.
    #[must_use]
    pub fn class_for_sender(&self, sender: Option<&str>) -> LatencyClass {
        self.class_for(sender.unwrap_or(OWNER_PROFILE_KEY))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, LatencyClass)> {
        self.classes.iter().map(|(participant, class)| (participant.as_str(), *class))
    }
}

impl<S: Into<String>> FromIterator<(S, LatencyClass)> for BehaviorProfiles {
    fn from_iter<T: IntoIterator<Item = (S, LatencyClass)>>(iter: T) -> Self {
        Self {
            classes: iter
                .into_iter()
                .map(|(participant, class)| (participant.into(), class))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DistributorConfig {
    /// Share of messages placed inside multi-message sessions.
    pub session_ratio: f64,
    pub min_session_len: usize,
    pub max_session_len: usize,
    pub min_session_gap_seconds: u32,
    pub max_session_gap_seconds: u32,
    /// Rejection-sampling budget for circadian placement of a session start.
    pub circadian_attempts: u32,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            session_ratio: 0.7,
            min_session_len: 5,
            max_session_len: 30,
            min_session_gap_seconds: 3_600,
            max_session_gap_seconds: 172_800,
            circadian_attempts: 50,
        }
    }
}

impl DistributorConfig {
    /// # Errors
    /// Returns [`FoundryError::Config`] for out-of-range tuning values.
    pub fn validate(&self) -> Result<(), FoundryError> {
        if !(0.0..=1.0).contains(&self.session_ratio) {
            return Err(FoundryError::Config(format!(
                "session_ratio must be within 0.0..=1.0, got {}",
                self.session_ratio
            )));
        }
        if self.min_session_len == 0 || self.min_session_len > self.max_session_len {
            return Err(FoundryError::Config(format!(
                "session length bounds {}..={} are invalid",
                self.min_session_len, self.max_session_len
            )));
        }
        if self.min_session_gap_seconds == 0
            || self.min_session_gap_seconds > self.max_session_gap_seconds
        {
            return Err(FoundryError::Config(format!(
                "session gap bounds {}..={} are invalid",
                self.min_session_gap_seconds, self.max_session_gap_seconds
            )));
        }
        if self.circadian_attempts == 0 {
            return Err(FoundryError::Config("circadian_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Seeded timestamp generator. Identical seed, config, and inputs always
/// produce identical output.
#[derive(Debug, Clone)]
pub struct TemporalDistributor {
    config: DistributorConfig,
    rng: StdRng,
}

impl TemporalDistributor {
    /// # Errors
    /// Returns [`FoundryError::Config`] when `config` fails validation.
    pub fn new(config: DistributorConfig, seed: u64) -> Result<Self, FoundryError> {
        config.validate()?;
        Ok(Self { config, rng: StdRng::seed_from_u64(seed) })
    }

    #[must_use]
    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// One timestamp per entry of `responders`, where `responders[i]` is the
    /// latency class of the sender of message `i`. Output is non-decreasing
    /// and lies within `[start, end]`.
    ///
    /// # Errors
    /// Returns [`FoundryError::InvalidWindow`] when `end <= start` and
    /// [`FoundryError::TimestampOutOfRange`] when a bound is not representable.
    pub fn distribute(
        &mut self,
        responders: &[LatencyClass],
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<NativeTimestamp>, FoundryError> {
        if end <= start {
            return Err(FoundryError::InvalidWindow(format!(
                "end {end} is not after start {start}"
            )));
        }
        let start_native = now_to_native(start)?;
        let end_native = now_to_native(end)?;
        if responders.is_empty() {
            return Ok(Vec::new());
        }

        let window = i128::from(end_native.nanos()) - i128::from(start_native.nanos());
        let units = self.plan_units(responders.len());
        let mean_gap_seconds = {
            let spread = (window as f64 / NANOS_PER_SECOND) / (units.len() as f64 + 1.0);
            spread.clamp(
                f64::from(self.config.min_session_gap_seconds),
                f64::from(self.config.max_session_gap_seconds),
            )
        };

        let mut offsets = Vec::with_capacity(responders.len());
        let mut cursor: i128 = 0;
        let mut index = 0;
        for (unit_index, unit_len) in units.iter().enumerate() {
            if unit_index > 0 {
                cursor += self.session_gap(start, cursor, mean_gap_seconds);
            }
            for position in 0..*unit_len {
                if position > 0 {
                    cursor += self.intra_gap(responders[index]);
                }
                offsets.push(cursor);
                index += 1;
            }
        }

        if cursor > window {
            tracing::debug!(
                messages = responders.len(),
                span_ns = %cursor,
                window_ns = %window,
                "compressing timestamp sequence into window"
            );
            for offset in &mut offsets {
                *offset = *offset * window / cursor;
            }
        } else {
            let slack = window - cursor;
            let lead_in_ceiling = slack / (units.len() as i128 + 1);
            if lead_in_ceiling > 0 {
                let lead_in = self.rng.gen_range(0..=lead_in_ceiling);
                for offset in &mut offsets {
                    *offset += lead_in;
                }
            }
        }

        let start_nanos = i128::from(start_native.nanos());
        let end_nanos = i128::from(end_native.nanos());
        Ok(offsets
            .into_iter()
            .map(|offset| {
                let absolute = (start_nanos + offset).clamp(start_nanos, end_nanos);
                NativeTimestamp(i64::try_from(absolute).unwrap_or(end_native.nanos()))
            })
            .collect())
    }

    /// Session lengths followed by isolated messages, shuffled together.
    fn plan_units(&mut self, count: usize) -> Vec<usize> {
        let mut in_sessions = ((count as f64) * self.config.session_ratio).round() as usize;
        in_sessions = in_sessions.min(count);
        let isolated = count - in_sessions;

        let mut units = Vec::new();
        while in_sessions > 0 {
            let len = self
                .rng
                .gen_range(self.config.min_session_len..=self.config.max_session_len)
                .min(in_sessions);
            units.push(len);
            in_sessions -= len;
        }
        units.extend(std::iter::repeat(1).take(isolated));
        units.shuffle(&mut self.rng);
        units
    }

    fn intra_gap(&mut self, class: LatencyClass) -> i128 {
        let (lo, hi) = class.gap_bounds_seconds();
        let (lo, hi) = (f64::from(lo), f64::from(hi));
        let scale = (hi - lo) / 4.0;
        let seconds = (lo + self.exponential() * scale).min(hi);
        seconds_to_nanos(seconds)
    }

    fn session_gap(&mut self, start: OffsetDateTime, cursor: i128, mean_seconds: f64) -> i128 {
        let mut gap = seconds_to_nanos(mean_seconds);
        for _ in 0..self.config.circadian_attempts {
            let floor = f64::from(self.config.min_session_gap_seconds);
            gap = seconds_to_nanos((self.exponential() * mean_seconds).max(floor));
            let weight =
                local_hour(start, cursor + gap).map_or(1.0, |hour| CIRCADIAN_WEIGHTS[hour]);
            if self.rng.gen::<f64>() < weight {
                break;
            }
        }
        gap
    }

    /// Standard exponential variate.
    fn exponential(&mut self) -> f64 {
        let uniform: f64 = self.rng.gen();
        -(1.0 - uniform).ln()
    }
}

fn seconds_to_nanos(seconds: f64) -> i128 {
    (seconds * NANOS_PER_SECOND) as i128
}

/// Hour of day at `start + offset`, in `start`'s UTC offset.
fn local_hour(start: OffsetDateTime, offset: i128) -> Option<usize> {
    let offset = i64::try_from(offset).ok()?;
    start.checked_add(Duration::nanoseconds(offset)).map(|instant| usize::from(instant.hour()))
}

/// Timestamps for `count` messages whose senders cycle through the profiled
/// participants in order. An empty profile set uses the default class.
///
/// # Errors
/// Returns [`FoundryError::InvalidWindow`] when `end <= start`.
pub fn generate_timestamps(
    count: usize,
    start: OffsetDateTime,
    end: OffsetDateTime,
    profiles: &BehaviorProfiles,
    seed: u64,
) -> Result<Vec<NativeTimestamp>, FoundryError> {
    let classes = profiles.iter().map(|(_, class)| class).collect::<Vec<_>>();
    let responders = if classes.is_empty() {
        vec![LatencyClass::default(); count]
    } else {
        classes.iter().copied().cycle().take(count).collect()
    };
    TemporalDistributor::new(DistributorConfig::default(), seed)?.distribute(
        &responders,
        start,
        end,
    )
}
