use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, Result};

pub const ENV_MIN_RELIABILITY: &str = "FACTORY_MIN_RELIABILITY";
pub const ENV_DEEP_FINGERPRINT: &str = "FACTORY_DEEP_FINGERPRINT";
pub const ENV_MAX_PROFILES: &str = "FACTORY_MAX_PROFILES";
pub const ENV_SANDBOX_TIMEOUT: &str = "FACTORY_SANDBOX_TIMEOUT";
pub const ENV_PROFILE_SELECTION: &str = "FACTORY_PROFILE_SELECTION";
pub const ENV_PROFILE_INSTANTIATION: &str = "FACTORY_PROFILE_INSTANTIATION";
pub const ENV_LOCK_TIMEOUT: &str = "FACTORY_LOCK_TIMEOUT";
pub const ENV_USE_SUBPROCESS: &str = "FACTORY_USE_SUBPROCESS";
pub const ENV_STRICT_CAPABILITIES: &str = "FACTORY_STRICT_CAPABILITIES";
pub const ENV_PLANNER_DIR: &str = "FACTORY_PLANNER_DIR";

/// Upper bound for every timeout; larger values are clamped.
pub const MAX_TIMEOUT_S: f64 = 86_400.0;

/// Immutable snapshot of the registry tunables.
///
/// Every field has a default so an empty environment (or an empty TOML file)
/// always yields a usable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FactoryConfig {
    pub min_reliability: f64,
    pub deep_fingerprint: bool,
    pub max_profiles: usize,
    pub sandbox_timeout_s: f64,
    pub profile_selection: bool,
    pub profile_instantiation: bool,
    pub lock_timeout_s: f64,
    pub use_subprocess: bool,
    pub strict_capabilities: bool,
    pub planner_dir: Option<PathBuf>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            min_reliability: 0.3,
            deep_fingerprint: true,
            max_profiles: 1000,
            sandbox_timeout_s: 3.0,
            profile_selection: true,
            profile_instantiation: true,
            lock_timeout_s: 5.0,
            use_subprocess: true,
            strict_capabilities: false,
            planner_dir: None,
        }
    }
}

impl FactoryConfig {
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Self {
        Self::default().with_overrides(vars)
    }

    /// Copies `self` and applies every recognised key found in `vars`.
    /// Unparseable values keep the current value.
    pub fn with_overrides(&self, vars: &HashMap<String, String>) -> Self {
        let mut config = self.clone();
        if let Some(value) = parse_var(vars, ENV_MIN_RELIABILITY, parse_f64) {
            config.min_reliability = value;
        }
        if let Some(value) = parse_var(vars, ENV_DEEP_FINGERPRINT, parse_bool) {
            config.deep_fingerprint = value;
        }
        if let Some(value) = parse_var(vars, ENV_MAX_PROFILES, parse_usize) {
            config.max_profiles = value;
        }
        if let Some(value) = parse_var(vars, ENV_SANDBOX_TIMEOUT, parse_f64) {
            config.sandbox_timeout_s = value;
        }
        if let Some(value) = parse_var(vars, ENV_PROFILE_SELECTION, parse_bool) {
            config.profile_selection = value;
        }
        if let Some(value) = parse_var(vars, ENV_PROFILE_INSTANTIATION, parse_bool) {
            config.profile_instantiation = value;
        }
        if let Some(value) = parse_var(vars, ENV_LOCK_TIMEOUT, parse_f64) {
            config.lock_timeout_s = value;
        }
        if let Some(value) = parse_var(vars, ENV_USE_SUBPROCESS, parse_bool) {
            config.use_subprocess = value;
        }
        if let Some(value) = parse_var(vars, ENV_STRICT_CAPABILITIES, parse_bool) {
            config.strict_capabilities = value;
        }
        if let Some(dir) = vars.get(ENV_PLANNER_DIR) {
            let dir = dir.trim();
            if !dir.is_empty() {
                config.planner_dir = Some(PathBuf::from(dir));
            }
        }
        config.sanitized()
    }

    pub fn with_min_reliability(mut self, value: f64) -> Self {
        self.min_reliability = value;
        self.sanitized()
    }

    pub fn with_sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_timeout_s = timeout.as_secs_f64();
        self.sanitized()
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_s = timeout.as_secs_f64();
        self.sanitized()
    }

    pub fn with_max_profiles(mut self, value: usize) -> Self {
        self.max_profiles = value;
        self.sanitized()
    }

    pub fn with_subprocess(mut self, value: bool) -> Self {
        self.use_subprocess = value;
        self
    }

    pub fn with_deep_fingerprint(mut self, value: bool) -> Self {
        self.deep_fingerprint = value;
        self
    }

    pub fn with_strict_capabilities(mut self, value: bool) -> Self {
        self.strict_capabilities = value;
        self
    }

    pub fn with_planner_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.planner_dir = Some(dir.into());
        self
    }

    pub fn sandbox_timeout(&self) -> Duration {
        bounded_duration(self.sandbox_timeout_s, FactoryConfig::default().sandbox_timeout_s)
    }

    pub fn lock_timeout(&self) -> Duration {
        bounded_duration(self.lock_timeout_s, FactoryConfig::default().lock_timeout_s)
    }

    /// Loggable snapshot, keyed by field name.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("min_reliability".into(), format!("{}", self.min_reliability));
        map.insert("deep_fingerprint".into(), self.deep_fingerprint.to_string());
        map.insert("max_profiles".into(), self.max_profiles.to_string());
        map.insert(
            "sandbox_timeout_s".into(),
            format!("{}", self.sandbox_timeout_s),
        );
        map.insert(
            "profile_selection".into(),
            self.profile_selection.to_string(),
        );
        map.insert(
            "profile_instantiation".into(),
            self.profile_instantiation.to_string(),
        );
        map.insert("lock_timeout_s".into(), format!("{}", self.lock_timeout_s));
        map.insert("use_subprocess".into(), self.use_subprocess.to_string());
        map.insert(
            "strict_capabilities".into(),
            self.strict_capabilities.to_string(),
        );
        map.insert(
            "planner_dir".into(),
            self.planner_dir
                .as_ref()
                .map(|dir| dir.display().to_string())
                .unwrap_or_default(),
        );
        map
    }

    fn sanitized(mut self) -> Self {
        let defaults = FactoryConfig::default();
        if !self.min_reliability.is_finite() {
            self.min_reliability = defaults.min_reliability;
        }
        self.min_reliability = self.min_reliability.clamp(0.0, 1.0);
        self.max_profiles = self.max_profiles.max(1);
        if !(self.sandbox_timeout_s.is_finite() && self.sandbox_timeout_s > 0.0) {
            self.sandbox_timeout_s = defaults.sandbox_timeout_s;
        }
        if !(self.lock_timeout_s.is_finite() && self.lock_timeout_s > 0.0) {
            self.lock_timeout_s = defaults.lock_timeout_s;
        }
        self.sandbox_timeout_s = self.sandbox_timeout_s.min(MAX_TIMEOUT_S);
        self.lock_timeout_s = self.lock_timeout_s.min(MAX_TIMEOUT_S);
        self
    }
}

/// Fields are public, so the accessors cannot assume `sanitized` ran.
fn bounded_duration(seconds: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.min(MAX_TIMEOUT_S))
        .ok()
        .filter(|duration| !duration.is_zero())
        .unwrap_or_else(|| Duration::from_secs_f64(fallback))
}

pub fn load_factory_config<P: AsRef<Path>>(path: P) -> Result<FactoryConfig> {
    let config: FactoryConfig = load_toml(path)?;
    Ok(config.sanitized())
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

fn parse_var<T>(
    vars: &HashMap<String, String>,
    key: &str,
    parse: fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = vars.get(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!(target: "config", key, value = %raw, "ignoring unparseable value, keeping default");
    }
    parsed
}

fn parse_f64(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn parse_usize(raw: &str) -> Option<usize> {
    raw.parse().ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = FactoryConfig::from_map(&HashMap::new());
        assert_eq!(config, FactoryConfig::default());
        assert_eq!(config.min_reliability, 0.3);
        assert!(config.deep_fingerprint);
        assert_eq!(config.max_profiles, 1000);
        assert_eq!(config.sandbox_timeout_s, 3.0);
    }

    #[test]
    fn recognised_keys_override_defaults() {
        let config = FactoryConfig::from_map(&vars(&[
            (ENV_MIN_RELIABILITY, "0.55"),
            (ENV_DEEP_FINGERPRINT, "off"),
            (ENV_MAX_PROFILES, "16"),
            (ENV_SANDBOX_TIMEOUT, "0.2"),
            (ENV_PROFILE_SELECTION, "no"),
            (ENV_PLANNER_DIR, "/srv/planners"),
        ]));
        assert_eq!(config.min_reliability, 0.55);
        assert!(!config.deep_fingerprint);
        assert_eq!(config.max_profiles, 16);
        assert_eq!(config.sandbox_timeout(), Duration::from_millis(200));
        assert!(!config.profile_selection);
        assert!(config.profile_instantiation);
        assert_eq!(config.planner_dir, Some(PathBuf::from("/srv/planners")));
    }

    #[test]
    fn garbage_values_fall_back_instead_of_failing() {
        let config = FactoryConfig::from_map(&vars(&[
            (ENV_MIN_RELIABILITY, "very"),
            (ENV_MAX_PROFILES, "-3"),
            (ENV_SANDBOX_TIMEOUT, "NaN"),
            (ENV_LOCK_TIMEOUT, "0"),
            (ENV_USE_SUBPROCESS, "maybe"),
        ]));
        let defaults = FactoryConfig::default();
        assert_eq!(config.min_reliability, defaults.min_reliability);
        assert_eq!(config.max_profiles, defaults.max_profiles);
        assert_eq!(config.sandbox_timeout_s, defaults.sandbox_timeout_s);
        assert_eq!(config.lock_timeout_s, defaults.lock_timeout_s);
        assert!(config.use_subprocess);
    }

    #[test]
    fn oversized_timeouts_are_clamped() {
        let config = FactoryConfig::from_map(&vars(&[
            (ENV_SANDBOX_TIMEOUT, "1e20"),
            (ENV_LOCK_TIMEOUT, "1e300"),
        ]));
        assert_eq!(config.sandbox_timeout_s, MAX_TIMEOUT_S);
        assert_eq!(config.lock_timeout_s, MAX_TIMEOUT_S);
        assert_eq!(config.sandbox_timeout(), Duration::from_secs(86_400));

        let raw = FactoryConfig {
            lock_timeout_s: 1e20,
            sandbox_timeout_s: -1.0,
            ..FactoryConfig::default()
        };
        assert_eq!(raw.lock_timeout(), Duration::from_secs(86_400));
        assert_eq!(raw.sandbox_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let config = FactoryConfig::from_map(&vars(&[
            (ENV_MIN_RELIABILITY, "1.7"),
            (ENV_MAX_PROFILES, "0"),
        ]));
        assert_eq!(config.min_reliability, 1.0);
        assert_eq!(config.max_profiles, 1);
    }

    #[test]
    fn overrides_leave_the_original_untouched() {
        let base = FactoryConfig::default().with_max_profiles(8);
        let derived = base.with_overrides(&vars(&[(ENV_STRICT_CAPABILITIES, "true")]));
        assert!(!base.strict_capabilities);
        assert!(derived.strict_capabilities);
        assert_eq!(derived.max_profiles, 8);
    }

    #[test]
    fn snapshot_lists_every_tunable() {
        let map = FactoryConfig::default().to_map();
        for key in [
            "min_reliability",
            "deep_fingerprint",
            "max_profiles",
            "sandbox_timeout_s",
            "profile_selection",
            "profile_instantiation",
            "lock_timeout_s",
            "use_subprocess",
            "strict_capabilities",
            "planner_dir",
        ] {
            assert!(map.contains_key(key), "missing {key}");
        }
        assert_eq!(map["max_profiles"], "1000");
    }

    #[test]
    fn toml_file_is_partial_and_sanitised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("factory.toml");
        std::fs::write(&path, "min_reliability = -2.0\nmax_profiles = 32\n").unwrap();
        let config = load_factory_config(&path).unwrap();
        assert_eq!(config.min_reliability, 0.0);
        assert_eq!(config.max_profiles, 32);
        assert!(config.use_subprocess);

        let missing = load_factory_config(dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
