//! Path and recording configuration, loaded from TOML with `serde`: plain
//! derive-only structs with `#[serde(default)]` on every optional field.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

fn default_describe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stop_after_describe() -> Duration {
    Duration::from_secs(10)
}

fn default_restart_pause() -> Duration {
    Duration::from_secs(2)
}

fn default_reader_queue_depth() -> usize {
    512
}

fn default_part_duration() -> Duration {
    Duration::from_millis(100)
}

fn default_segment_duration() -> Duration {
    Duration::from_secs(1)
}

/// One `runOn*` hook: a shell command plus whether it should be restarted
/// if it exits while still armed.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct OnDemandConfig {
    pub run_on_init: Option<String>,
    pub run_on_demand: Option<String>,
    pub run_on_connect: Option<String>,
    pub run_on_disconnect: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Fmp4,
    Mpegts,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RecordConfig {
    pub path_format: String,
    pub format: RecordFormat,
    #[serde(with = "duration_millis", default = "default_part_duration")]
    pub part_duration: Duration,
    #[serde(with = "duration_millis", default = "default_segment_duration")]
    pub segment_duration: Duration,
    #[serde(with = "duration_secs")]
    pub delete_after: Duration,
}

/// One path's configuration. `name` doubles as
/// a regex pattern for dynamic paths when `is_regex` is set.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PathConfig {
    pub name: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub on_demand: OnDemandConfig,
    #[serde(default = "default_describe_timeout", with = "duration_secs")]
    pub describe_timeout: Duration,
    #[serde(default = "default_stop_after_describe", with = "duration_secs")]
    pub stop_after_describe: Duration,
    #[serde(default)]
    pub record: Option<RecordConfig>,
    #[serde(default)]
    pub gop_cache: bool,
    #[serde(default = "default_reader_queue_depth")]
    pub reader_queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: Vec<PathConfig>,
    #[serde(default = "default_restart_pause", with = "duration_secs")]
    pub recording_restart_pause: Duration,
}

impl Config {
    pub fn from_toml_str(contents: &str) -> crate::error::Result<Self> {
        toml::from_str(contents)
            .map_err(|e| crate::error::CoreError::InvalidConfig(e.to_string()))
    }

    /// Index by path name, used by [`crate::path::manager::PathManager::reload`].
    pub fn by_name(&self) -> HashMap<String, PathConfig> {
        self.paths
            .iter()
            .cloned()
            .map(|p| (p.name.clone(), p))
            .collect()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_path() {
        let toml = r#"
            [[paths]]
            name = "cam1"
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.paths.len(), 1);
        assert_eq!(cfg.paths[0].name, "cam1");
        assert_eq!(cfg.paths[0].describe_timeout, Duration::from_secs(10));
    }

    #[test]
    fn parses_recording_and_on_demand() {
        let toml = r#"
            [[paths]]
            name = "^cam-(\\d+)$"
            is_regex = true

            [paths.on_demand]
            run_on_demand = "ffmpeg -i rtsp://cam/$MTX_PATH out.mp4"

            [paths.record]
            path_format = "%path/%Y-%m-%d_%H-%M-%S-%f"
            format = "fmp4"
            delete_after = 86400
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        let path = &cfg.paths[0];
        assert!(path.is_regex);
        assert!(path.on_demand.run_on_demand.is_some());
        let record = path.record.as_ref().unwrap();
        assert_eq!(record.format, RecordFormat::Fmp4);
        assert_eq!(record.delete_after, Duration::from_secs(86_400));
    }
}
