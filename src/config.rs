//! Planner configuration: sharing rules, caps, and solve budget.
//!
//! Values come from defaults, an optional TOML file, and `MIXPLAN_*`
//! environment variables, in that order of precedence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::errors::{PlanError, PlanResult};
use crate::model::OptimizationMode;
use crate::solver::SolveBudget;

pub const DEFAULT_MAX_MIXER_SIZE: u64 = 5;

/// Cap on peer blend candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerLimit {
    /// Up to half of each equal-allocation group (two for a group of three).
    HalfGroup,
    /// A flat cap across all groups.
    Global(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Largest mixer the hardware offers; bounds every factor.
    pub max_mixer_size: u64,
    /// Maximum level distance between a consumer and its provider.
    /// `None` allows any distance.
    pub max_level_diff: Option<usize>,
    /// Cap on the droplets a single share link may carry.
    pub max_sharing_volume: Option<u64>,
    /// Cap on the number of distinct inbound sources per node.
    pub max_shared_inputs: Option<u64>,
    /// Soft cap on raw reagent droplets per node, enforced via an
    /// objective penalty.
    pub max_reagent_input_per_node: Option<u64>,
    pub peer_limit: PeerLimit,
    /// Allow finished targets (roots) to feed other trees.
    pub enable_final_product_sharing: bool,
    pub mode: OptimizationMode,
    pub max_time_secs: Option<u64>,
    pub absolute_gap: Option<f64>,
    pub workers: Option<usize>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            max_mixer_size: DEFAULT_MAX_MIXER_SIZE,
            max_level_diff: None,
            max_sharing_volume: None,
            max_shared_inputs: None,
            max_reagent_input_per_node: None,
            peer_limit: PeerLimit::HalfGroup,
            enable_final_product_sharing: false,
            mode: OptimizationMode::Waste,
            max_time_secs: Some(2000),
            absolute_gap: Some(0.99),
            workers: Some(16),
        }
    }
}

impl PlanConfig {
    /// Load configuration with defaults, an optional TOML file, and
    /// `MIXPLAN_*` environment overrides layered on top.
    #[instrument(level = "debug")]
    pub fn load(path: Option<&Path>) -> PlanResult<Self> {
        let defaults = toml::to_string(&Self::default()).map_err(|e| PlanError::Config {
            message: format!("cannot serialize defaults: {e}"),
        })?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults,
            config::FileFormat::Toml,
        ));
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("MIXPLAN"))
            .build()
            .map_err(|e| PlanError::Config {
                message: e.to_string(),
            })?;

        let cfg: Self = settings.try_deserialize().map_err(|e| PlanError::Config {
            message: e.to_string(),
        })?;
        debug!(?cfg, "configuration loaded");
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> PlanResult<Self> {
        Self::load(Some(path))
    }

    /// Stable digest of the effective configuration, for tagging runs.
    pub fn config_hash(&self) -> PlanResult<String> {
        let canonical = toml::to_string(self).map_err(|e| PlanError::Config {
            message: format!("cannot serialize configuration: {e}"),
        })?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(hex::encode(digest))
    }

    pub fn budget(&self) -> SolveBudget {
        SolveBudget {
            max_time: self.max_time_secs.map(Duration::from_secs),
            absolute_gap: self.absolute_gap,
            workers: self.workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn given_no_config_when_loading_then_uses_defaults() {
        let cfg = PlanConfig::load(None).expect("config");
        assert_eq!(cfg.max_mixer_size, DEFAULT_MAX_MIXER_SIZE);
        assert_eq!(cfg.peer_limit, PeerLimit::HalfGroup);
        assert_eq!(cfg.mode, OptimizationMode::Waste);
        assert!(!cfg.enable_final_product_sharing);
    }

    #[test]
    fn given_toml_file_when_loading_then_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").expect("tempfile");
        writeln!(
            file,
            "max_mixer_size = 4\nmode = \"operations\"\nmax_level_diff = 1"
        )
        .expect("write");

        let cfg = PlanConfig::from_file(file.path()).expect("config");
        assert_eq!(cfg.max_mixer_size, 4);
        assert_eq!(cfg.mode, OptimizationMode::Operations);
        assert_eq!(cfg.max_level_diff, Some(1));
        // untouched fields keep their defaults
        assert_eq!(cfg.max_time_secs, Some(2000));
    }

    #[test]
    fn given_config_when_hashing_then_stable_and_sensitive() {
        let a = PlanConfig::default();
        let mut b = PlanConfig::default();
        assert_eq!(a.config_hash().unwrap(), a.config_hash().unwrap());

        b.max_mixer_size = 4;
        assert_ne!(a.config_hash().unwrap(), b.config_hash().unwrap());
    }

    #[test]
    fn given_config_when_building_budget_then_fields_carry_over() {
        let cfg = PlanConfig {
            max_time_secs: Some(10),
            workers: None,
            ..PlanConfig::default()
        };
        let budget = cfg.budget();
        assert_eq!(budget.max_time, Some(Duration::from_secs(10)));
        assert_eq!(budget.workers, None);
        assert_eq!(budget.absolute_gap, Some(0.99));
    }
}
