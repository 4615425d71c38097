//! Per-target state and run initialization.
//!
//! One `Wavefunction` per molecular geometry. Each is constructed with
//! fresh, independently-owned fields - sampler state, unique parameters,
//! clipping state and metrics are never shared between targets. Only the
//! shared parameter set and the optimizer state cross target boundaries,
//! and those are owned by the orchestrator.

use candle_core::Result;
use log::info;
use std::collections::HashMap;
use std::path::Path;

use crate::config::{PhysicalSystem, VmcConfig};
use crate::distributed::DeviceMesh;
use crate::logging::WavefunctionLogger;
use crate::mcmc::McmcState;
use crate::model::{build_model, EnvelopeJastrow, FixedParams};
use crate::optim::ClippingState;
use crate::params::{merge, param_count, same_structure, ParamPartition, Params};
use crate::scheduler::TargetStatus;

/// One trainable instance bound to a fixed molecular geometry.
pub struct Wavefunction {
    pub physical: PhysicalSystem,
    pub fixed: FixedParams,
    pub unique_params: Params,
    pub mcmc_state: Option<McmcState>,
    pub clipping: Option<ClippingState>,
    /// Running mean of the latest clipped energy samples
    pub e_mean: f64,
    /// Running stddev of the latest clipped energy samples
    pub e_std: f64,
    pub n_opt_epochs: usize,
    pub last_epoch_optimized: usize,
    pub logger: WavefunctionLogger,
}

impl Wavefunction {
    /// The scheduler's read-only view of this target.
    pub fn status(&self) -> TargetStatus {
        TargetStatus {
            last_epoch_optimized: self.last_epoch_optimized,
            energy_stddev: self.e_std,
        }
    }

    /// Save the full (shared + unique) parameter set to the job directory
    /// as safetensors. A no-op for file-less loggers.
    pub fn save_checkpoint(&self, shared_params: &Params, label: &str) -> Result<()> {
        let Some(job_dir) = self.logger.job_dir() else {
            return Ok(());
        };
        let merged = merge(shared_params, &self.unique_params)?;
        let tensors: HashMap<String, candle_core::Tensor> =
            merged.into_iter().collect();
        let path = job_dir.join(format!("params_{}.safetensors", label));
        candle_core::safetensors::save(&tensors, path)
    }
}

/// Everything `init_wavefunctions` hands to the orchestrator.
pub struct InitializedRun {
    pub model: EnvelopeJastrow,
    pub wavefunctions: Vec<Wavefunction>,
    pub shared_params: Params,
    pub partition: ParamPartition,
}

/// Build every target from the expanded geometry list.
///
/// The first target's split defines the canonical shared parameter set;
/// every other target must produce a structurally identical shared part,
/// and the pattern set must match at least one leaf.
pub fn init_wavefunctions(
    config: &VmcConfig,
    mesh: &DeviceMesh,
    run_dir: Option<&Path>,
) -> anyhow::Result<InitializedRun> {
    let systems = config.physical.expand();
    let partition = ParamPartition::compile(&config.optimization.shared.shared_modules)?;

    let mut wavefunctions = Vec::with_capacity(systems.len());
    let mut shared_params: Option<Params> = None;
    let mut model: Option<EnvelopeJastrow> = None;

    for (idx, system) in systems.iter().enumerate() {
        info!("initializing wavefunction {} ({})", idx, system.name);
        let (new_model, trainable, fixed) =
            build_model(&config.model, system, mesh.root_device())?;
        let (new_shared, unique) = partition.split(&trainable);

        if partition.matched_leaf_count(&trainable) == 0 {
            anyhow::bail!(
                "shared_modules {:?} match no parameter leaves",
                partition.patterns()
            );
        }

        match shared_params {
            None => {
                shared_params = Some(new_shared);
                model = Some(new_model);
            }
            Some(ref canonical) => {
                if !same_structure(canonical, &new_shared) {
                    anyhow::bail!(
                        "target {} ({}) produced a shared parameter set with a different \
                         structure; shared leaves must be identical across all geometries",
                        idx,
                        system.name
                    );
                }
                // The canonical copy from target 0 stays; later targets
                // only contribute their unique leaves.
            }
        }

        let logger = match run_dir {
            Some(dir) => WavefunctionLogger::new(dir, idx)?,
            None => WavefunctionLogger::disabled(idx),
        };
        logger.on_run_begin();
        logger.log_params(&serde_json::json!({
            "system": system.name,
            "n_ions": system.ion_positions.len(),
            "n_electrons": system.n_electrons,
            "e_ref": system.e_ref,
            "n_params": param_count(&trainable),
            "n_params_shared": shared_params.as_ref().map(param_count),
            "n_params_unique": param_count(&unique),
        }));
        if let Some(dir) = logger.job_dir() {
            config.save(dir.join("full_config.yml"))?;
        }

        wavefunctions.push(Wavefunction {
            physical: system.clone(),
            fixed,
            unique_params: unique,
            mcmc_state: None,
            clipping: None,
            e_mean: f64::NAN,
            e_std: f64::NAN,
            n_opt_epochs: 0,
            last_epoch_optimized: 0,
            logger,
        });
    }

    let (Some(shared_params), Some(model)) = (shared_params, model) else {
        anyhow::bail!("physical configuration expands to zero systems");
    };

    Ok(InitializedRun {
        model,
        wavefunctions,
        shared_params,
        partition,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::sync::{CollectiveBackend, DeviceConfig};

    fn mesh() -> DeviceMesh {
        DeviceMesh::new(&DeviceConfig {
            device_count: 1,
            backend: CollectiveBackend::Single,
        })
        .unwrap()
    }

    #[test]
    fn test_init_builds_one_target_per_geometry() {
        let config = VmcConfig::h2_sample();
        let run = init_wavefunctions(&config, &mesh(), None).unwrap();
        assert_eq!(run.wavefunctions.len(), 2);
        // Default patterns share the Jastrow leaves only.
        assert_eq!(run.shared_params.len(), 2);
        for wf in &run.wavefunctions {
            assert_eq!(wf.unique_params.len(), 1);
            assert!(wf.unique_params.contains_key("envelope.exponents"));
            assert!(wf.mcmc_state.is_none());
            assert_eq!(wf.n_opt_epochs, 0);
        }
    }

    #[test]
    fn test_init_rejects_pattern_matching_nothing() {
        let mut config = VmcConfig::h2_sample();
        config.optimization.shared.shared_modules = vec!["backflow".to_string()];
        let err = init_wavefunctions(&config, &mesh(), None).unwrap_err();
        assert!(err.to_string().contains("match no parameter leaves"));
    }

    #[test]
    fn test_targets_own_independent_state() {
        let config = VmcConfig::h2_sample();
        let mut run = init_wavefunctions(&config, &mesh(), None).unwrap();
        run.wavefunctions[0].e_std = 7.0;
        run.wavefunctions[0].n_opt_epochs = 3;
        assert!(run.wavefunctions[1].e_std.is_nan());
        assert_eq!(run.wavefunctions[1].n_opt_epochs, 0);
    }
}
