use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clustering::ClusteringParameters;
use crate::error::{QuiverError, Result};

const CONFIG_ENV: &str = "QUIVER_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "quiver.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchConfig,
    pub clustering: ClusteringParameters,
    pub accelerator: AcceleratorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_k: usize,
    /// Index-time nprobe applied to freshly built inverted files.
    pub nprobe: usize,
    /// Default `ivf_nprobe_pct`, 0 to keep the index's own nprobe.
    pub nprobe_pct: f32,
    /// Default `ivf_max_codes_pct`, 0 for unbounded scans.
    pub max_codes_pct: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: 10,
            nprobe: 1,
            nprobe_pct: 0.0,
            max_codes_pct: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Devices exposed by the in-process emulated backend.
    pub emulated_devices: usize,
    pub memory_per_device: u64,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            emulated_devices: 0,
            memory_per_device: 1 << 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then a TOML file (explicit `path`, else
    /// `$QUIVER_CONFIG`, else `./quiver.toml` when present), then `QUIVER_*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(p) => Some(p.to_string()),
            None => std::env::var(CONFIG_ENV).ok().or_else(|| {
                Path::new(DEFAULT_CONFIG_FILE)
                    .exists()
                    .then(|| DEFAULT_CONFIG_FILE.to_string())
            }),
        };

        let mut config = match file {
            Some(p) => Self::from_toml(&std::fs::read_to_string(&p)?)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `QUIVER_*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| QuiverError::Config(format!("invalid value for {key}: {raw}")))
        }

        if let Some(v) = lookup("QUIVER_DEFAULT_K") {
            self.search.default_k = parse("QUIVER_DEFAULT_K", v)?;
        }
        if let Some(v) = lookup("QUIVER_NPROBE") {
            self.search.nprobe = parse("QUIVER_NPROBE", v)?;
        }
        if let Some(v) = lookup("QUIVER_NPROBE_PCT") {
            self.search.nprobe_pct = parse("QUIVER_NPROBE_PCT", v)?;
        }
        if let Some(v) = lookup("QUIVER_MAX_CODES_PCT") {
            self.search.max_codes_pct = parse("QUIVER_MAX_CODES_PCT", v)?;
        }
        if let Some(v) = lookup("QUIVER_KMEANS_NITER") {
            self.clustering.niter = parse("QUIVER_KMEANS_NITER", v)?;
        }
        if let Some(v) = lookup("QUIVER_KMEANS_SEED") {
            self.clustering.seed = parse("QUIVER_KMEANS_SEED", v)?;
        }
        if let Some(v) = lookup("QUIVER_EMULATED_DEVICES") {
            self.accelerator.emulated_devices = parse("QUIVER_EMULATED_DEVICES", v)?;
        }
        if let Some(v) = lookup("QUIVER_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("QUIVER_LOG_FORMAT") {
            self.logging.format = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.search.default_k == 0 {
            return Err(QuiverError::Config("search.default_k must be positive".into()));
        }
        for (name, pct) in [
            ("search.nprobe_pct", self.search.nprobe_pct),
            ("search.max_codes_pct", self.search.max_codes_pct),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(QuiverError::Config(format!(
                    "{name} must be in range [0, 100], got {pct}"
                )));
            }
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(QuiverError::Config(format!(
                "logging.format must be text or json, got {}",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Percentage override built from the configured defaults, if any is set.
    pub fn default_override(&self) -> Option<crate::params::PercentageOverride> {
        (self.search.nprobe_pct > 0.0 || self.search.max_codes_pct > 0.0).then(|| {
            crate::params::PercentageOverride::new(self.search.nprobe_pct, self.search.max_codes_pct)
        })
    }
}
