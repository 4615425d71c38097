//! The shared-optimization epoch loop.
//!
//! One orchestrator drives the whole run: pick a target, merge its
//! parameters with the shared set, decorrelate its sampler, estimate the
//! clipped energy gradient across the device mesh, apply one optimizer
//! step, split the result back. Exactly one target is in flight per
//! epoch, so the shared parameter set and the optimizer state need no
//! locking - mutation happens strictly inside the synchronous step.
//!
//! Epochs run in strictly increasing order and every step blocks on the
//! full fork-join barrier before its reduction; a failure anywhere aborts
//! the run with no partial-epoch rollback.

use candle_core::Result;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use crate::config::{CheckpointCadence, VmcConfig};
use crate::distributed::{Collective, DeviceMesh, DeviceView};
use crate::logging::StepRecord;
use crate::mcmc::{McmcState, MetropolisHastings};
use crate::model::{FixedParams, WaveFunction};
use crate::optim::{init_clipping_state, AdamW, AdamWConfig, EnergyGradientEstimator};
use crate::params::{merge, ParamPartition, Params};
use crate::scheduler::{select_target, TargetStatus};
use crate::wavefunction::Wavefunction;

pub struct Orchestrator<'a, M: WaveFunction> {
    config: &'a VmcConfig,
    mesh: &'a DeviceMesh,
    collective: &'a dyn Collective,
    model: &'a M,
    partition: &'a ParamPartition,
    sampler: MetropolisHastings,
    estimator: EnergyGradientEstimator,
    headless: bool,
}

impl<'a, M: WaveFunction> Orchestrator<'a, M> {
    pub fn new(
        config: &'a VmcConfig,
        mesh: &'a DeviceMesh,
        collective: &'a dyn Collective,
        model: &'a M,
        partition: &'a ParamPartition,
        headless: bool,
    ) -> Self {
        Self {
            config,
            mesh,
            collective,
            model,
            partition,
            sampler: MetropolisHastings::new(&config.mcmc),
            estimator: EnergyGradientEstimator::new(&config.optimization.clipping),
            headless,
        }
    }

    /// Run `n_epochs * n_targets` scheduler steps against one evolving
    /// shared parameter set.
    ///
    /// Returns the updated targets, the final shared set, and the
    /// optimizer threaded through for a later resume.
    pub fn optimize_shared(
        &self,
        mut wavefunctions: Vec<Wavefunction>,
        mut shared_params: Params,
        initial_opt_state: Option<AdamW>,
    ) -> Result<(Vec<Wavefunction>, Params, AdamW)> {
        let n_wfs = wavefunctions.len();
        if n_wfs == 0 {
            return Err(candle_core::Error::Msg(
                "optimize_shared called with no wavefunctions".to_string(),
            ));
        }

        // Burn in every target against its own merged initial parameters,
        // and seed each device with the per-target fixed data once.
        let mut fixed_views: Vec<DeviceView<FixedParams>> = Vec::with_capacity(n_wfs);
        for (idx, wf) in wavefunctions.iter_mut().enumerate() {
            info!("running burn-in for wavefunction {}", idx);
            let state = McmcState::resize_or_init(
                wf.mcmc_state.take(),
                self.config.mcmc.n_walkers_opt,
                &wf.physical,
                self.mesh,
                &self.config.mcmc,
            )?;
            if wf.clipping.is_none() {
                wf.clipping = Some(init_clipping_state());
            }
            let merged = merge(&shared_params, &wf.unique_params)?;
            let params_view = self.mesh.replicate(&merged)?;
            let fixed_view = self.mesh.replicate(&wf.fixed)?;
            let state = self.sampler.run_burn_in(
                self.mesh,
                self.model,
                state,
                &params_view,
                &fixed_view,
            )?;
            info!(
                "wavefunction {} burned in: {} sweeps, acceptance {:.2}",
                idx, state.step_count, state.acceptance_rate
            );
            wf.mcmc_state = Some(state);
            fixed_views.push(fixed_view);
        }

        // The first target's merged structure keys the optimizer state for
        // the whole run.
        let mut optimizer = match initial_opt_state {
            Some(optimizer) => optimizer,
            None => {
                let first_merged = merge(&shared_params, &wavefunctions[0].unique_params)?;
                AdamW::new(
                    &first_merged,
                    AdamWConfig::with_lr(self.config.optimization.learning_rate),
                )?
            }
        };

        let epochs_total = self.config.optimization.n_epochs * n_wfs;
        let progress = if self.headless || epochs_total == 0 {
            None
        } else {
            let style = ProgressStyle::with_template(
                "{bar:40.cyan/dim} {pos:>6}/{len:6} [{elapsed}] {msg}",
            )
            .unwrap()
            .progress_chars("━━─");
            let pb = ProgressBar::new(epochs_total as u64);
            pb.set_style(style);
            Some(pb)
        };

        for n_epoch in 0..epochs_total {
            let statuses: Vec<TargetStatus> =
                wavefunctions.iter().map(|wf| wf.status()).collect();
            let index = select_target(n_epoch, &statuses, &self.config.optimization.shared);
            let wf = &mut wavefunctions[index];

            // Assemble the full parameter set and put it on every device.
            let merged = merge(&shared_params, &wf.unique_params)?;
            let params_view = self.mesh.replicate(&merged)?;

            // Decorrelate, then draw the batch the walkers sit on.
            let state = wf.mcmc_state.take().ok_or_else(|| {
                candle_core::Error::Msg(format!(
                    "wavefunction {} has no sampler state; burn-in did not run",
                    index
                ))
            })?;
            let state = self.sampler.run_inter_steps(
                self.mesh,
                self.model,
                state,
                &params_view,
                &fixed_views[index],
            )?;
            let batch = state.build_batch();

            let clipping = wf.clipping.take().unwrap_or_else(init_clipping_state);
            let (grads, new_clipping, stats) = self.estimator.estimate(
                self.mesh,
                self.collective,
                self.model,
                &params_view,
                &fixed_views[index],
                &batch,
                &clipping,
            )?;
            let new_params = optimizer.step(&merged, &grads)?;

            // The shared part becomes visible to every other target on its
            // next turn; the unique part goes back into this target only.
            let (new_shared, new_unique) = self.partition.split(&new_params);
            shared_params = new_shared;
            wf.unique_params = new_unique;

            wf.e_mean = stats.e_mean;
            wf.e_std = stats.e_std;
            wf.n_opt_epochs += 1;
            wf.last_epoch_optimized = n_epoch;
            wf.logger.log_step(&StepRecord {
                epoch: n_epoch,
                n_opt_epochs: wf.n_opt_epochs,
                stats: &stats,
                e_ref: wf.physical.e_ref,
                acceptance_rate: state.acceptance_rate,
                log_psi_mean: state.mean_log_psi_sqr(),
                learning_rate: optimizer.learning_rate(),
            });
            let acceptance_rate = state.acceptance_rate;
            wf.mcmc_state = Some(state);
            wf.clipping = Some(new_clipping);

            if let Some(pb) = &progress {
                pb.set_position((n_epoch + 1) as u64);
                pb.set_message(format!(
                    "wf{:03} E: {:.4} ± {:.4} | acc: {:.2}",
                    index, stats.e_mean, stats.e_std, acceptance_rate
                ));
            } else if self.headless
                && (n_epoch % self.config.output.log_interval == 0 || n_epoch + 1 == epochs_total)
            {
                println!(
                    "{}",
                    serde_json::json!({
                        "epoch": n_epoch,
                        "target": index,
                        "e_mean": stats.e_mean,
                        "e_std": stats.e_std,
                        "grad_norm": stats.grad_norm,
                        "acceptance_rate": acceptance_rate,
                    })
                );
            }

            self.maybe_checkpoint(n_epoch, index, &wavefunctions, &shared_params)?;
        }

        if let Some(pb) = progress {
            pb.finish_with_message("optimization done");
        }
        Ok((wavefunctions, shared_params, optimizer))
    }

    /// Periodic checkpoints per the configured cadence. `global` counts
    /// scheduler epochs and snapshots every target together; `per_target`
    /// counts the selected target's own epochs and snapshots just it.
    fn maybe_checkpoint(
        &self,
        n_epoch: usize,
        index: usize,
        wavefunctions: &[Wavefunction],
        shared_params: &Params,
    ) -> Result<()> {
        let checkpoint = &self.config.output.checkpoint;
        if checkpoint.interval == 0 {
            return Ok(());
        }
        match checkpoint.cadence {
            CheckpointCadence::Global => {
                if (n_epoch + 1) % checkpoint.interval == 0 {
                    info!("checkpointing all wavefunctions at epoch {}", n_epoch);
                    for wf in wavefunctions {
                        wf.save_checkpoint(shared_params, &format!("epoch{:06}", n_epoch + 1))?;
                    }
                }
            }
            CheckpointCadence::PerTarget => {
                let wf = &wavefunctions[index];
                if wf.n_opt_epochs % checkpoint.interval == 0 {
                    wf.save_checkpoint(shared_params, &format!("opt{:06}", wf.n_opt_epochs))?;
                }
            }
        }
        Ok(())
    }
}
