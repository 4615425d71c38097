use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::scheduler::SchedulingMethod;

// Default value functions for serde
fn default_experiment_name() -> String { "varmc".to_string() }
fn default_n_walkers() -> usize { 256 }
fn default_n_burn_in() -> usize { 500 }
fn default_n_inter_steps() -> usize { 10 }
fn default_proposal_stddev() -> f64 { 0.2 }
fn default_learning_rate() -> f64 { 1e-2 }
fn default_clip_range() -> f64 { 5.0 }
fn default_max_age() -> usize { 50 }
fn default_shared_modules() -> Vec<String> { vec!["jastrow".to_string()] }
fn default_log_interval() -> usize { 10 }
fn default_envelope_init() -> f64 { 1.0 }
fn default_jastrow_weight_init() -> f64 { 0.25 }
fn default_jastrow_scale_init() -> f64 { 1.0 }

// Re-export device config so callers configure the whole run from one place
pub use crate::distributed::sync::{CollectiveBackend, DeviceConfig};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmcConfig {
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,

    pub physical: PhysicalConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub mcmc: McmcConfig,

    pub optimization: OptimizationConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub devices: DeviceConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Geometry list: a base system plus per-target overrides.
///
/// Every override produces one target; with no overrides the base system is
/// the single target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhysicalConfig {
    pub base: PhysicalSystem,
    #[serde(default)]
    pub changes: Vec<PhysicalChange>,
}

/// One molecular geometry: ion positions (Bohr), charges, electron count,
/// and an optional reference energy (Hartree) for error reporting.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhysicalSystem {
    pub name: String,
    pub ion_positions: Vec<[f64; 3]>,
    pub ion_charges: Vec<f64>,
    pub n_electrons: usize,
    #[serde(default)]
    pub e_ref: Option<f64>,
}

/// Per-target override applied on top of the base system.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PhysicalChange {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ion_positions: Option<Vec<[f64; 3]>>,
    #[serde(default)]
    pub e_ref: Option<f64>,
}

impl PhysicalConfig {
    /// Expand base + changes into the ordered target list.
    pub fn expand(&self) -> Vec<PhysicalSystem> {
        if self.changes.is_empty() {
            return vec![self.base.clone()];
        }
        self.changes
            .iter()
            .enumerate()
            .map(|(i, change)| {
                let mut system = self.base.clone();
                if let Some(ref name) = change.name {
                    system.name = name.clone();
                } else {
                    system.name = format!("{}_{}", self.base.name, i);
                }
                if let Some(ref positions) = change.ion_positions {
                    system.ion_positions = positions.clone();
                }
                if change.e_ref.is_some() {
                    system.e_ref = change.e_ref;
                }
                system
            })
            .collect()
    }
}

/// Initial values for the reference trial wavefunction.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default = "default_envelope_init")]
    pub envelope_exponent_init: f64,
    #[serde(default = "default_jastrow_weight_init")]
    pub jastrow_weight_init: f64,
    #[serde(default = "default_jastrow_scale_init")]
    pub jastrow_scale_init: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            envelope_exponent_init: default_envelope_init(),
            jastrow_weight_init: default_jastrow_weight_init(),
            jastrow_scale_init: default_jastrow_scale_init(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McmcConfig {
    /// Walker population during optimization
    #[serde(default = "default_n_walkers")]
    pub n_walkers_opt: usize,

    /// Walker population during evaluation
    #[serde(default = "default_n_walkers")]
    pub n_walkers_eval: usize,

    /// Equilibration sweeps before the first optimizer update
    #[serde(default = "default_n_burn_in")]
    pub n_burn_in: usize,

    /// Decorrelation sweeps between successive updates of one target
    #[serde(default = "default_n_inter_steps")]
    pub n_inter_steps: usize,

    /// Stddev of the Gaussian move proposal (Bohr)
    #[serde(default = "default_proposal_stddev")]
    pub proposal_stddev: f64,

    /// Base RNG seed; each device shard derives its own stream from it
    #[serde(default)]
    pub seed: u64,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            n_walkers_opt: default_n_walkers(),
            n_walkers_eval: default_n_walkers(),
            n_burn_in: default_n_burn_in(),
            n_inter_steps: default_n_inter_steps(),
            proposal_stddev: default_proposal_stddev(),
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizationConfig {
    /// Per-target epoch budget; the run processes n_epochs * n_targets steps
    pub n_epochs: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default)]
    pub clipping: ClippingConfig,

    pub shared: SharedOptimizationConfig,
}

/// Outlier clipping window for local-energy samples, in units of the
/// sample stddev around the sample mean.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClippingConfig {
    #[serde(default = "default_clip_range")]
    pub range: f64,
}

impl Default for ClippingConfig {
    fn default() -> Self {
        Self { range: default_clip_range() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SharedOptimizationConfig {
    #[serde(default)]
    pub scheduling_method: SchedulingMethod,

    /// A target older than this is always selected next (stddev method)
    #[serde(default = "default_max_age")]
    pub max_age: usize,

    /// Module-path patterns selecting the shared parameter subset
    #[serde(default = "default_shared_modules")]
    pub shared_modules: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EvaluationConfig {
    /// Sampling epochs per target after optimization (0 = skip evaluation)
    #[serde(default)]
    pub n_epochs: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Run directory; a timestamped directory under ./runs when unset
    #[serde(default)]
    pub run_dir: Option<String>,

    /// Console log cadence in epochs
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            run_dir: None,
            log_interval: default_log_interval(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

/// Whether checkpoint cadence counts global epochs or the selected
/// target's own epochs.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointCadence {
    #[default]
    Global,
    PerTarget,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub cadence: CheckpointCadence,

    /// Checkpoint every this many epochs (0 = final checkpoint only)
    #[serde(default)]
    pub interval: usize,
}

impl VmcConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config: VmcConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as YAML (used for per-target config snapshots).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration constraints; fail fast, naming the offending
    /// value, before any state is allocated.
    pub fn validate(&self) -> anyhow::Result<()> {
        let systems = self.physical.expand();
        if systems.is_empty() {
            anyhow::bail!("physical configuration expands to zero systems");
        }
        for system in &systems {
            if system.ion_positions.len() != system.ion_charges.len() {
                anyhow::bail!(
                    "system {:?}: {} ion positions but {} charges",
                    system.name,
                    system.ion_positions.len(),
                    system.ion_charges.len()
                );
            }
            if system.ion_positions.is_empty() {
                anyhow::bail!("system {:?} has no ions", system.name);
            }
            if system.n_electrons == 0 {
                anyhow::bail!("system {:?} has no electrons", system.name);
            }
        }

        let d = self.devices.device_count;
        if d == 0 {
            anyhow::bail!("device_count must be at least 1");
        }
        if self.mcmc.n_walkers_opt == 0 || self.mcmc.n_walkers_eval == 0 {
            anyhow::bail!("walker counts must be positive");
        }
        if self.mcmc.n_walkers_opt % d != 0 {
            anyhow::bail!(
                "n_walkers_opt ({}) is not divisible by device_count ({})",
                self.mcmc.n_walkers_opt,
                d
            );
        }
        if self.mcmc.n_walkers_eval % d != 0 {
            anyhow::bail!(
                "n_walkers_eval ({}) is not divisible by device_count ({})",
                self.mcmc.n_walkers_eval,
                d
            );
        }
        if self.mcmc.proposal_stddev <= 0.0 {
            anyhow::bail!(
                "proposal_stddev must be positive, got {}",
                self.mcmc.proposal_stddev
            );
        }

        if self.optimization.learning_rate <= 0.0 {
            anyhow::bail!(
                "learning_rate must be positive, got {}",
                self.optimization.learning_rate
            );
        }
        if self.optimization.clipping.range <= 0.0 {
            anyhow::bail!(
                "clipping range must be positive, got {}",
                self.optimization.clipping.range
            );
        }
        if self.optimization.shared.max_age == 0 {
            anyhow::bail!("max_age must be a positive number of epochs");
        }
        // Compile once here so a bad pattern aborts before any model init.
        crate::params::ParamPartition::compile(&self.optimization.shared.shared_modules)
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        Ok(())
    }

    // Two-geometry H2 sample used by tests and as a starting template.
    #[allow(dead_code)]
    pub fn h2_sample() -> Self {
        Self {
            experiment_name: "h2_shared".to_string(),
            physical: PhysicalConfig {
                base: PhysicalSystem {
                    name: "H2".to_string(),
                    ion_positions: vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.4]],
                    ion_charges: vec![1.0, 1.0],
                    n_electrons: 2,
                    e_ref: Some(-1.1744),
                },
                changes: vec![
                    PhysicalChange {
                        name: Some("H2_d1.4".to_string()),
                        ion_positions: Some(vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.4]]),
                        e_ref: Some(-1.1744),
                    },
                    PhysicalChange {
                        name: Some("H2_d1.8".to_string()),
                        ion_positions: Some(vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.8]]),
                        e_ref: Some(-1.1550),
                    },
                ],
            },
            model: ModelConfig::default(),
            mcmc: McmcConfig {
                n_walkers_opt: 64,
                n_walkers_eval: 128,
                n_burn_in: 100,
                n_inter_steps: 5,
                proposal_stddev: 0.3,
                seed: 0,
            },
            optimization: OptimizationConfig {
                n_epochs: 50,
                learning_rate: default_learning_rate(),
                clipping: ClippingConfig::default(),
                shared: SharedOptimizationConfig {
                    scheduling_method: SchedulingMethod::RoundRobin,
                    max_age: default_max_age(),
                    shared_modules: default_shared_modules(),
                },
            },
            evaluation: EvaluationConfig { n_epochs: 20 },
            devices: DeviceConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_is_valid() {
        VmcConfig::h2_sample().validate().unwrap();
    }

    #[test]
    fn test_expand_applies_changes() {
        let config = VmcConfig::h2_sample();
        let systems = config.physical.expand();
        assert_eq!(systems.len(), 2);
        assert_eq!(systems[0].name, "H2_d1.4");
        assert_eq!(systems[1].ion_positions[1][2], 1.8);
        // Charges come from the base system
        assert_eq!(systems[1].ion_charges, vec![1.0, 1.0]);
    }

    #[test]
    fn test_expand_without_changes_is_base() {
        let mut config = VmcConfig::h2_sample();
        config.physical.changes.clear();
        let systems = config.physical.expand();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].name, "H2");
    }

    #[test]
    fn test_non_divisible_walker_count_rejected() {
        let mut config = VmcConfig::h2_sample();
        config.devices.device_count = 3;
        config.mcmc.n_walkers_opt = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not divisible"));
    }

    #[test]
    fn test_bad_shared_pattern_rejected() {
        let mut config = VmcConfig::h2_sample();
        config.optimization.shared.shared_modules = vec!["jastrow(".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_age_rejected() {
        let mut config = VmcConfig::h2_sample();
        config.optimization.shared.max_age = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = VmcConfig::h2_sample();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: VmcConfig = serde_yaml::from_str(&yaml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.experiment_name, config.experiment_name);
        assert_eq!(parsed.mcmc.n_walkers_opt, 64);
    }
}
