//! `foundry` configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use foundry_core::dialect::DEFAULT_DIALECT;
use foundry_core::distributor::OWNER_PROFILE_KEY;
use foundry_core::{
    normalize_identifier, BehaviorProfiles, DistributorConfig, FoundryError, LatencyClass, Service,
};
use foundry_store_sqlite::{DEFAULT_COUNTRY, DEFAULT_IO_RETRY_ATTEMPTS};
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV_VAR: &str = "IMESSAGE_FOUNDRY_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FoundryConfig {
    /// Dialect tag used when a command does not name one.
    pub dialect: String,
    pub service: String,
    pub country: String,
    pub io_retry_attempts: u32,
    pub seed: u64,
    /// Participant identifier (or `me`) to latency class spelling.
    pub profiles: BTreeMap<String, String>,
    pub timestamps: TimestampTuning,
}

impl Default for FoundryConfig {
    fn default() -> Self {
        Self {
            dialect: DEFAULT_DIALECT.to_string(),
            service: Service::default().as_str().to_string(),
            country: DEFAULT_COUNTRY.to_string(),
            io_retry_attempts: DEFAULT_IO_RETRY_ATTEMPTS,
            seed: 0,
            profiles: BTreeMap::new(),
            timestamps: TimestampTuning::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TimestampTuning {
    pub session_ratio: f64,
    pub min_session_size: usize,
    pub max_session_size: usize,
}

impl Default for TimestampTuning {
    fn default() -> Self {
        let defaults = DistributorConfig::default();
        Self {
            session_ratio: defaults.session_ratio,
            min_session_size: defaults.min_session_len,
            max_session_size: defaults.max_session_len,
        }
    }
}

impl FoundryConfig {
    /// Load from `explicit`, else from `$IMESSAGE_FOUNDRY_CONFIG`, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| {
                std::env::var_os(CONFIG_ENV_VAR)
                    .filter(|value| !value.is_empty())
                    .map(PathBuf::from)
            });
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let body = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::parse(&body)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml).context("failed to parse YAML")?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), FoundryError> {
        let tuning = &self.timestamps;
        if !(tuning.session_ratio > 0.0 && tuning.session_ratio <= 1.0) {
            return Err(FoundryError::Config(format!(
                "timestamps.session_ratio must be in (0, 1], got {}",
                tuning.session_ratio
            )));
        }
        if tuning.min_session_size == 0 || tuning.min_session_size > tuning.max_session_size {
            return Err(FoundryError::Config(format!(
                "timestamps session sizes must satisfy 1 <= min ({}) <= max ({})",
                tuning.min_session_size, tuning.max_session_size
            )));
        }
        if self.io_retry_attempts == 0 {
            return Err(FoundryError::Config("io_retry_attempts must be at least 1".to_string()));
        }
        self.behavior_profiles().map(|_| ())
    }

    #[must_use]
    pub fn service(&self) -> Service {
        Service::parse_lenient(&self.service, Service::default())
    }

    /// Profiles keyed by canonical identifier so they match builder senders.
    pub fn behavior_profiles(&self) -> Result<BehaviorProfiles, FoundryError> {
        let mut profiles = BehaviorProfiles::new();
        for (participant, class) in &self.profiles {
            let key = if participant.trim().eq_ignore_ascii_case(OWNER_PROFILE_KEY) {
                OWNER_PROFILE_KEY.to_string()
            } else {
                normalize_identifier(participant)
                    .map_err(|err| FoundryError::Config(format!("profiles: {err}")))?
                    .canonical
            };
            profiles.insert(key, LatencyClass::parse_lenient(class, LatencyClass::default()));
        }
        Ok(profiles)
    }

    #[must_use]
    pub fn distributor_config(&self) -> DistributorConfig {
        DistributorConfig {
            session_ratio: self.timestamps.session_ratio,
            min_session_len: self.timestamps.min_session_size,
            max_session_len: self.timestamps.max_session_size,
            ..DistributorConfig::default()
        }
    }
}
