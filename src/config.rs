//! Layered configuration: a TOML file merged with `DCS_`-prefixed
//! environment overrides via `figment`, deserialized into a typed tree. Only
//! a fixed set of recognised keys is typed; anything else in the file is
//! captured opaquely in `Config::extra` rather than rejected.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::DcsError;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub interface_name: String,
    pub backends: BackendsConfig,
    pub dcs: DcsSection,
    #[serde(default)]
    pub datalog: DatalogConfig,
    /// Keys outside the recognised set, preserved rather than rejected so a
    /// forward-compatible config file doesn't fail to load here.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendsConfig {
    pub hostapd: HostapdConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostapdConfig {
    pub control_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DcsSection {
    #[serde(default = "default_true")]
    pub trigger_csa: bool,
    pub dtims_for_csa: u32,
    pub algo_type: AlgoType,
    pub ewma: Option<EwmaConfig>,
    pub sample_and_hold: Option<SampleHoldConfig>,
    #[serde(default)]
    pub test: TestConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgoType {
    Ewma,
    SampleAndHold,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EwmaConfig {
    pub ewma_alpha: u32,
    pub threshold_percentage: i64,
    pub rounds_for_csa: u32,
    pub sec_per_scan: u64,
    pub sec_per_round: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SampleHoldConfig {
    pub rounds_for_eval: u32,
    pub threshold_percentage: i64,
    pub sec_per_scan: u64,
    pub sec_per_round: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestConfig {
    #[serde(default)]
    pub enabled: bool,
    pub filepath: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatalogConfig {
    pub root_dir: Option<PathBuf>,
    #[serde(default)]
    pub dcs: DatalogSinkConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatalogSinkConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl Config {
    /// Load from a TOML file at `path`, merged with `DCS_`-prefixed
    /// environment variables, then validate the recognised keys.
    pub fn load(path: &Path) -> Result<Self, DcsError> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("DCS_").split("__"))
            .extract()
            .map_err(|e| DcsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), DcsError> {
        if self.interface_name.trim().is_empty() {
            return Err(DcsError::Config("interface_name must not be empty".into()));
        }
        if self.dcs.dtims_for_csa < 1 {
            return Err(DcsError::Config("dcs.dtims_for_csa must be >= 1".into()));
        }
        match self.dcs.algo_type {
            AlgoType::Ewma => {
                let ewma = self
                    .dcs
                    .ewma
                    .as_ref()
                    .ok_or_else(|| DcsError::Config("dcs.algo_type = ewma requires dcs.ewma".into()))?;
                if !(1..=100).contains(&ewma.ewma_alpha) {
                    return Err(DcsError::Config("dcs.ewma.ewma_alpha must be in [1,100]".into()));
                }
                if ewma.rounds_for_csa < 1 {
                    return Err(DcsError::Config("dcs.ewma.rounds_for_csa must be >= 1".into()));
                }
            }
            AlgoType::SampleAndHold => {
                let sh = self.dcs.sample_and_hold.as_ref().ok_or_else(|| {
                    DcsError::Config("dcs.algo_type = sample_and_hold requires dcs.sample_and_hold".into())
                })?;
                if sh.rounds_for_eval < 1 {
                    return Err(DcsError::Config(
                        "dcs.sample_and_hold.rounds_for_eval must be >= 1".into(),
                    ));
                }
            }
        }
        if self.dcs.test.enabled && self.dcs.test.filepath.is_none() {
            return Err(DcsError::Config("dcs.test.enabled requires dcs.test.filepath".into()));
        }
        Ok(())
    }
}
