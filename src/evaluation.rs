//! Post-optimization evaluation.
//!
//! Each target's final wavefunction is sampled with the (typically larger)
//! evaluation walker population: per-target energy mean and standard
//! error, plus the error against the reference energy in milli-Hartree
//! when one is known, and an aggregate record across all targets.

use candle_core::Result;
use log::info;

use crate::config::VmcConfig;
use crate::distributed::DeviceMesh;
use crate::mcmc::{McmcState, MetropolisHastings, SamplerPhase};
use crate::model::WaveFunction;
use crate::params::{merge, Params};
use crate::stats::{nan_mean, nan_sem};
use crate::wavefunction::Wavefunction;

/// One target's evaluation result.
#[derive(Debug, Clone)]
pub struct WavefunctionEvaluation {
    pub name: String,
    pub e_mean: f64,
    pub e_mean_sigma: f64,
    /// `1e3 * (E - E_ref)`, when a reference energy is known
    pub error_mha: Option<f64>,
    pub sigma_error_mha: Option<f64>,
}

/// Aggregate across all targets with reference energies.
#[derive(Debug, Clone, Default)]
pub struct EvaluationSummary {
    pub per_target: Vec<WavefunctionEvaluation>,
    pub error_eval: Option<f64>,
    pub sigma_error_eval: Option<f64>,
    pub error_plus_2_stdev: Option<f64>,
}

/// Evaluate every target against the final shared parameter set.
pub fn evaluate_wavefunctions<M: WaveFunction>(
    config: &VmcConfig,
    mesh: &DeviceMesh,
    model: &M,
    wavefunctions: &mut [Wavefunction],
    shared_params: &Params,
) -> Result<EvaluationSummary> {
    let sampler = MetropolisHastings::new(&config.mcmc);
    let mut summary = EvaluationSummary::default();
    let mut error_set = Vec::new();
    let mut sigma_set = Vec::new();
    let mut error_plus_2_stdev_set = Vec::new();

    for (idx, wf) in wavefunctions.iter_mut().enumerate() {
        info!("evaluating wavefunction {} ({})", idx, wf.physical.name);
        let mut state = McmcState::resize_or_init(
            wf.mcmc_state.take(),
            config.mcmc.n_walkers_eval,
            &wf.physical,
            mesh,
            &config.mcmc,
        )?;
        let merged = merge(shared_params, &wf.unique_params)?;
        let params_view = mesh.replicate(&merged)?;
        let fixed_view = mesh.replicate(&wf.fixed)?;

        // A sampler that never went through optimization still needs its
        // equilibration before any sample is trusted.
        if state.phase == SamplerPhase::Initialized {
            state = sampler.run_burn_in(mesh, model, state, &params_view, &fixed_view)?;
        }

        let mut samples = Vec::new();
        for _ in 0..config.evaluation.n_epochs {
            state = sampler.run_inter_steps(mesh, model, state, &params_view, &fixed_view)?;
            let batch = state.build_batch();
            let energy_shards = mesh.for_each(|shard_idx, _device| {
                model.local_energy(
                    &params_view.shards()[shard_idx],
                    &fixed_view.shards()[shard_idx],
                    &batch.shards()[shard_idx],
                )
            })?;
            for shard in energy_shards {
                samples.extend(shard.to_vec1::<f64>()?);
            }
        }
        wf.mcmc_state = Some(state);

        let e_mean = nan_mean(&samples);
        let e_mean_sigma = nan_sem(&samples);
        wf.logger.log_metrics(
            "eval",
            &serde_json::json!({ "e_mean": e_mean, "e_mean_sigma": e_mean_sigma }),
        );

        let mut evaluation = WavefunctionEvaluation {
            name: wf.physical.name.clone(),
            e_mean,
            e_mean_sigma,
            error_mha: None,
            sigma_error_mha: None,
        };
        if let Some(e_ref) = wf.physical.e_ref {
            let error = 1e3 * (e_mean - e_ref);
            let sigma = 1e3 * e_mean_sigma;
            wf.logger.log_metrics(
                "eval",
                &serde_json::json!({
                    "error_eval": error,
                    "sigma_error_eval": sigma,
                    "error_plus_2_stdev": error + 2.0 * sigma,
                }),
            );
            evaluation.error_mha = Some(error);
            evaluation.sigma_error_mha = Some(sigma);
            error_set.push(error);
            sigma_set.push(sigma);
            error_plus_2_stdev_set.push(error + 2.0 * sigma);
        }
        summary.per_target.push(evaluation);
    }

    if !error_set.is_empty() {
        summary.error_eval = Some(nan_mean(&error_set));
        summary.sigma_error_eval = Some(nan_mean(&sigma_set));
        summary.error_plus_2_stdev = Some(nan_mean(&error_plus_2_stdev_set));
    }
    Ok(summary)
}
