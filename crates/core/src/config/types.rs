use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_scan_interval")]
    pub scan_interval: HumanDuration,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Comma-separated CIDRs allowed to open WebSocket connections.
    /// Empty means no restriction.
    #[serde(default)]
    pub trusted_cidrs: String,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            scan_interval: default_scan_interval(),
            db_path: default_db_path(),
            listen_addr: default_listen_addr(),
            trusted_cidrs: String::new(),
            pipelines: Vec::new(),
        }
    }
}

fn default_scan_interval() -> HumanDuration {
    HumanDuration::from_secs(30)
}

fn default_db_path() -> PathBuf {
    PathBuf::from("refinery.db")
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// Delay between a capacity reduction and forced cancellation of
    /// over-quota workers.
    #[serde(default = "default_shrink_grace")]
    pub shrink_grace: HumanDuration,
    #[serde(default)]
    pub shrink_kill_order: KillOrder,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            shrink_grace: default_shrink_grace(),
            shrink_kill_order: KillOrder::default(),
        }
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_shrink_grace() -> HumanDuration {
    HumanDuration::from_secs(60)
}

/// Which workers a shrink cancels first, keyed on start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillOrder {
    #[default]
    Oldest,
    Youngest,
}

/// A single conversion pipeline: which files it claims and how they
/// are converted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub name: String,
    /// Lower value = higher precedence.
    #[serde(default)]
    pub priority: i32,
    /// Absolute glob patterns; recursive `**` is supported.
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_age: Option<HumanDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<HumanDuration>,
    #[serde(default)]
    pub target: TargetConfig,
    pub command: String,
    /// Delete the input file once conversion succeeds.
    #[serde(default)]
    pub delete_on_success: bool,
    /// Base template values; shadowed by per-pipeline overrides from
    /// the store at render time.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Intra-priority ordering of a pipeline's candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Oldest,
    Newest,
}

/// How the output path is derived from the input path.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Optional regex with named capture groups, matched against the
    /// input file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    pub format: String,
}

/// A duration expressed as a humantime string ("30s", "5m") in
/// configuration and API bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_duration_roundtrip() {
        let d: HumanDuration = serde_json::from_str("\"5m\"").unwrap();
        assert_eq!(d.as_duration(), Duration::from_secs(300));
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"5m\"");
    }

    #[test]
    fn test_human_duration_rejects_garbage() {
        let result: Result<HumanDuration, _> = serde_json::from_str("\"not a duration\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_kill_order_lowercase() {
        let order: KillOrder = serde_json::from_str("\"youngest\"").unwrap();
        assert_eq!(order, KillOrder::Youngest);
        assert_eq!(KillOrder::default(), KillOrder::Oldest);
    }

    #[test]
    fn test_direction_default_oldest() {
        assert_eq!(Direction::default(), Direction::Oldest);
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.pool.size, 4);
        assert_eq!(config.pool.shrink_grace.as_duration(), Duration::from_secs(60));
        assert_eq!(config.pool.shrink_kill_order, KillOrder::Oldest);
        assert_eq!(config.scan_interval.as_duration(), Duration::from_secs(30));
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert!(config.pipelines.is_empty());
    }
}
