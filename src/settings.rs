use anyhow::{anyhow, bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::consolidation::ConsolidationConfig;

const ENABLE_LOGS: bool = true;

/// Ten years.
const MAX_DURATION_SECS: i64 = 10 * 366 * 24 * 3600;

/// Pipeline tunables as stored on disk. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineSettings {
    pub merge_gap_secs: i64,
    pub min_duration_secs: i64,
    pub max_session_secs: i64,
    pub max_entity_secs: i64,
    pub batch_size: usize,
    pub fan_out: usize,
    pub queue_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let config = ConsolidationConfig::default();
        Self {
            merge_gap_secs: config.merge_gap.num_seconds(),
            min_duration_secs: config.min_duration.num_seconds(),
            max_session_secs: config.max_session_duration.num_seconds(),
            max_entity_secs: config.max_entity_duration.num_seconds(),
            batch_size: config.batch_size,
            fan_out: config.fan_out,
            queue_capacity: config.queue_capacity,
        }
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value {raw:?} for {name}"))
}

impl PipelineSettings {
    /// Read settings from `path`. A missing file gives the defaults, as does
    /// a file that is not valid JSON (with a warning).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        match serde_json::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(err) => {
                crate::log_warn!(
                    "Ignoring unreadable settings file {}: {}",
                    path.display(),
                    err
                );
                Ok(Self::default())
            }
        }
    }

    /// Apply `PRESENCE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        macro_rules! override_field {
            ($settings:ident . $field:ident, $name:literal) => {
                if let Some(raw) = lookup($name) {
                    $settings.$field = parse_override($name, &raw)?;
                }
            };
        }

        override_field!(self.merge_gap_secs, "PRESENCE_MERGE_GAP_SECS");
        override_field!(self.min_duration_secs, "PRESENCE_MIN_DURATION_SECS");
        override_field!(self.max_session_secs, "PRESENCE_MAX_SESSION_SECS");
        override_field!(self.max_entity_secs, "PRESENCE_MAX_ENTITY_SECS");
        override_field!(self.batch_size, "PRESENCE_BATCH_SIZE");
        override_field!(self.fan_out, "PRESENCE_FAN_OUT");
        override_field!(self.queue_capacity, "PRESENCE_QUEUE_CAPACITY");
        Ok(())
    }

    pub fn into_config(self) -> Result<ConsolidationConfig> {
        for (name, value) in [
            ("batchSize", self.batch_size),
            ("fanOut", self.fan_out),
            ("queueCapacity", self.queue_capacity),
        ] {
            if value == 0 {
                bail!("{name} must be at least 1");
            }
        }

        Ok(ConsolidationConfig {
            merge_gap: seconds("mergeGapSecs", self.merge_gap_secs)?,
            min_duration: seconds("minDurationSecs", self.min_duration_secs)?,
            max_session_duration: seconds("maxSessionSecs", self.max_session_secs)?,
            max_entity_duration: seconds("maxEntitySecs", self.max_entity_secs)?,
            batch_size: self.batch_size,
            fan_out: self.fan_out,
            queue_capacity: self.queue_capacity,
        })
    }
}

/// Durations are added to poll timestamps, so they stay well inside the
/// range chrono can represent.
fn seconds(name: &str, secs: i64) -> Result<Duration> {
    if secs < 0 {
        bail!("{name} must not be negative (got {secs})");
    }
    if secs > MAX_DURATION_SECS {
        bail!("{name} must be at most {MAX_DURATION_SECS} seconds (got {secs})");
    }
    Duration::try_seconds(secs).ok_or_else(|| anyhow!("{name} is out of range"))
}
