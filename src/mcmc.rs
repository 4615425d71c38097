//! Persistent Metropolis-Hastings walker ensembles.
//!
//! Every target owns one `McmcState`: its walker positions sharded across
//! the device mesh, the cached density used for acceptance, and the phase
//! of the burn-in state machine. The sampler is the run's data source -
//! each optimizer step consumes the batch the walkers currently sit on,
//! after a short decorrelation pass.
//!
//! Phases: `Initialized -> BurnedIn -> Steady`. Burn-in runs once per
//! target before any optimizer update trusts its samples; inter-step
//! sweeps run between successive updates of the same target.

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::config::{McmcConfig, PhysicalSystem};
use crate::distributed::{DeviceMesh, DeviceView};
use crate::model::{initial_positions, FixedParams, WaveFunction};
use crate::params::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerPhase {
    /// Walkers allocated, burn-in still pending
    Initialized,
    /// Equilibrated; optimizer updates may trust the samples
    BurnedIn,
    /// In the optimization loop, decorrelated between updates
    Steady,
}

/// One device's share of the walker population.
#[derive(Debug)]
pub struct WalkerShard {
    /// Walker positions, `[n_local, n_el, 3]`
    pub positions: Tensor,
    /// Cached `log psi^2` from the latest sweep, if any
    pub log_psi_sqr: Option<Tensor>,
    rng: StdRng,
}

impl WalkerShard {
    fn n_walkers(&self) -> usize {
        self.positions.dims()[0]
    }
}

/// Per-target sampler state: walker shards (one per device) plus
/// acceptance statistics for step-size diagnostics.
#[derive(Debug)]
pub struct McmcState {
    shards: Vec<WalkerShard>,
    pub phase: SamplerPhase,
    /// Total proposal sweeps run so far
    pub step_count: usize,
    /// Acceptance rate of the most recent sweep block
    pub acceptance_rate: f64,
}

impl McmcState {
    /// Allocate a fresh ensemble, or grow/shrink an existing one to
    /// `n_walkers` total.
    ///
    /// Growing repeats existing walkers; shrinking truncates. The walker
    /// count must divide evenly across the mesh - checked before any
    /// allocation happens.
    pub fn resize_or_init(
        state: Option<McmcState>,
        n_walkers: usize,
        system: &PhysicalSystem,
        mesh: &DeviceMesh,
        config: &McmcConfig,
    ) -> Result<McmcState> {
        let n_devices = mesh.device_count();
        if n_walkers == 0 || n_walkers % n_devices != 0 {
            return Err(candle_core::Error::Msg(format!(
                "walker count ({}) is not divisible by device count ({})",
                n_walkers, n_devices
            )));
        }
        let n_local = n_walkers / n_devices;

        match state {
            None => {
                let shards = mesh
                    .devices()
                    .iter()
                    .enumerate()
                    .map(|(idx, device)| {
                        let mut rng = StdRng::seed_from_u64(
                            config.seed.wrapping_add(idx as u64),
                        );
                        let positions =
                            initial_positions(system, n_local, &mut rng, device)?;
                        Ok(WalkerShard {
                            positions,
                            log_psi_sqr: None,
                            rng,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(McmcState {
                    shards,
                    phase: SamplerPhase::Initialized,
                    step_count: 0,
                    acceptance_rate: 0.0,
                })
            }
            Some(mut state) => {
                mesh.check_shards(state.shards.len())?;
                for shard in &mut state.shards {
                    shard.positions = resize_walkers(&shard.positions, n_local)?;
                    // Cached densities no longer line up with the walkers.
                    shard.log_psi_sqr = None;
                }
                Ok(state)
            }
        }
    }

    /// Total walker count across all devices.
    pub fn total_walkers(&self) -> usize {
        self.shards.iter().map(|s| s.n_walkers()).sum()
    }

    /// The current per-device position batch.
    pub fn build_batch(&self) -> DeviceView<Tensor> {
        DeviceView::from_shards(self.shards.iter().map(|s| s.positions.clone()).collect())
    }

    /// Mean of the cached log density across all walkers; `None` until a
    /// sweep has run. Logged as a sampler diagnostic.
    pub fn mean_log_psi_sqr(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for shard in &self.shards {
            let cached = shard.log_psi_sqr.as_ref()?;
            let values = cached.to_vec1::<f64>().ok()?;
            sum += values.iter().filter(|x| x.is_finite()).sum::<f64>();
            count += values.iter().filter(|x| x.is_finite()).count();
        }
        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }
}

/// Grow (by repetition) or shrink (by truncation) a `[n, n_el, 3]` walker
/// tensor to `n_target` rows, preserving existing walkers.
fn resize_walkers(positions: &Tensor, n_target: usize) -> Result<Tensor> {
    let n_current = positions.dims()[0];
    if n_target == n_current {
        return Ok(positions.clone());
    }
    if n_target < n_current {
        return positions.narrow(0, 0, n_target);
    }
    let mut pieces = vec![positions.clone()];
    let mut have = n_current;
    while have < n_target {
        let take = (n_target - have).min(n_current);
        pieces.push(positions.narrow(0, 0, take)?);
        have += take;
    }
    let refs: Vec<&Tensor> = pieces.iter().collect();
    Tensor::cat(&refs, 0)
}

/// The Metropolis-Hastings driver. Holds only configuration; all mutable
/// state lives in the per-target `McmcState`.
pub struct MetropolisHastings {
    config: McmcConfig,
}

impl MetropolisHastings {
    pub fn new(config: &McmcConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Equilibrate a freshly initialized (or resized) ensemble.
    pub fn run_burn_in<M: WaveFunction>(
        &self,
        mesh: &DeviceMesh,
        model: &M,
        state: McmcState,
        params: &DeviceView<Params>,
        fixed: &DeviceView<FixedParams>,
    ) -> Result<McmcState> {
        let mut state = self.run_sweeps(mesh, model, state, params, fixed, self.config.n_burn_in)?;
        state.phase = SamplerPhase::BurnedIn;
        Ok(state)
    }

    /// Short decorrelation pass between successive optimizer updates of
    /// the same target.
    pub fn run_inter_steps<M: WaveFunction>(
        &self,
        mesh: &DeviceMesh,
        model: &M,
        state: McmcState,
        params: &DeviceView<Params>,
        fixed: &DeviceView<FixedParams>,
    ) -> Result<McmcState> {
        let mut state =
            self.run_sweeps(mesh, model, state, params, fixed, self.config.n_inter_steps)?;
        state.phase = SamplerPhase::Steady;
        Ok(state)
    }

    /// Run `n_sweeps` Metropolis sweeps on every shard, fork-joined across
    /// the mesh. The cached density is recomputed first since parameters
    /// have typically changed since the last call.
    fn run_sweeps<M: WaveFunction>(
        &self,
        mesh: &DeviceMesh,
        model: &M,
        state: McmcState,
        params: &DeviceView<Params>,
        fixed: &DeviceView<FixedParams>,
        n_sweeps: usize,
    ) -> Result<McmcState> {
        mesh.check_shards(state.shards.len())?;
        mesh.check_shards(params.len())?;
        mesh.check_shards(fixed.len())?;

        let stddev = self.config.proposal_stddev;
        let McmcState {
            shards,
            phase,
            step_count,
            ..
        } = state;

        let results = mesh.map_shards(shards, |idx, device, shard| {
            sweep_shard(
                model,
                shard,
                &params.shards()[idx],
                &fixed.shards()[idx],
                device,
                stddev,
                n_sweeps,
            )
        })?;

        let mut shards = Vec::with_capacity(results.len());
        let mut acceptance_sum = 0.0;
        for (shard, acceptance) in results {
            acceptance_sum += acceptance;
            shards.push(shard);
        }
        let n_shards = shards.len();
        Ok(McmcState {
            shards,
            phase,
            step_count: step_count + n_sweeps,
            acceptance_rate: if n_sweeps == 0 {
                0.0
            } else {
                acceptance_sum / n_shards as f64
            },
        })
    }
}

/// One shard's sweep block. Returns the updated shard and its mean
/// acceptance rate over the block.
fn sweep_shard<M: WaveFunction>(
    model: &M,
    mut shard: WalkerShard,
    params: &Params,
    fixed: &FixedParams,
    device: &Device,
    proposal_stddev: f64,
    n_sweeps: usize,
) -> Result<(WalkerShard, f64)> {
    let (n_local, n_el, _) = shard.positions.dims3()?;
    let normal = Normal::new(0.0, proposal_stddev)
        .map_err(|e| candle_core::Error::Msg(format!("invalid proposal stddev: {}", e)))?;

    let mut log_psi = model.log_psi_sqr(params, fixed, &shard.positions)?;
    let mut accepted = 0.0;

    for _ in 0..n_sweeps {
        let noise: Vec<f64> = (0..n_local * n_el * 3)
            .map(|_| normal.sample(&mut shard.rng))
            .collect();
        let step = Tensor::from_vec(noise, (n_local, n_el, 3), device)?;
        let proposed = (&shard.positions + &step)?;
        let log_psi_new = model.log_psi_sqr(params, fixed, &proposed)?;

        // Acceptance in log space: u < psi_new^2 / psi_old^2. A non-finite
        // proposed density compares false everywhere, so the move is
        // rejected rather than raised.
        let delta = (&log_psi_new - &log_psi)?;
        let log_u: Vec<f64> = (0..n_local)
            .map(|_| shard.rng.random::<f64>().max(f64::MIN_POSITIVE).ln())
            .collect();
        let log_u = Tensor::from_vec(log_u, (n_local,), device)?;
        let finite = (&log_psi_new - &log_psi_new)?.eq(0f64)?;
        let accept = (log_u.lt(&delta)? * &finite)?;

        let mask = accept.to_dtype(DType::F64)?;
        let keep = ((&mask * -1.0)? + 1.0)?;
        let mask3 = mask.reshape((n_local, 1, 1))?;
        let keep3 = keep.reshape((n_local, 1, 1))?;
        shard.positions = (proposed.broadcast_mul(&mask3)?
            + shard.positions.broadcast_mul(&keep3)?)?;
        // Select, don't blend: a rejected NaN density must not leak into
        // the cache through 0 * NaN.
        log_psi = accept.where_cond(&log_psi_new, &log_psi)?;

        accepted += mask.mean_all()?.to_vec0::<f64>()?;
    }

    shard.log_psi_sqr = Some(log_psi);
    let rate = if n_sweeps == 0 {
        0.0
    } else {
        accepted / n_sweeps as f64
    };
    Ok((shard, rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmcConfig;
    use crate::distributed::sync::{CollectiveBackend, DeviceConfig};
    use crate::model::build_model;

    fn mesh(n: usize) -> DeviceMesh {
        DeviceMesh::new(&DeviceConfig {
            device_count: n,
            backend: CollectiveBackend::CpuStaging,
        })
        .unwrap()
    }

    fn hydrogen() -> PhysicalSystem {
        PhysicalSystem {
            name: "H".to_string(),
            ion_positions: vec![[0.0, 0.0, 0.0]],
            ion_charges: vec![1.0],
            n_electrons: 1,
            e_ref: None,
        }
    }

    #[test]
    fn test_non_divisible_walker_count_fails_before_allocation() {
        let mesh = mesh(3);
        let err = McmcState::resize_or_init(
            None,
            10,
            &hydrogen(),
            &mesh,
            &McmcConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not divisible"));
    }

    #[test]
    fn test_fresh_init_shapes_and_phase() {
        let mesh = mesh(2);
        let state =
            McmcState::resize_or_init(None, 8, &hydrogen(), &mesh, &McmcConfig::default())
                .unwrap();
        assert_eq!(state.phase, SamplerPhase::Initialized);
        assert_eq!(state.total_walkers(), 8);
        let batch = state.build_batch();
        assert_eq!(batch.len(), 2);
        for shard in batch.shards() {
            assert_eq!(shard.dims(), &[4, 1, 3]);
        }
    }

    #[test]
    fn test_resize_preserves_existing_walkers() {
        let mesh = mesh(2);
        let config = McmcConfig::default();
        let state =
            McmcState::resize_or_init(None, 4, &hydrogen(), &mesh, &config).unwrap();
        let before: Vec<Vec<Vec<f64>>> =
            state.shards[0].positions.to_vec3::<f64>().unwrap();

        // Grow: the first two walkers of each shard must be untouched.
        let grown = McmcState::resize_or_init(Some(state), 8, &hydrogen(), &mesh, &config)
            .unwrap();
        assert_eq!(grown.total_walkers(), 8);
        let after = grown.shards[0].positions.to_vec3::<f64>().unwrap();
        assert_eq!(&after[..2], &before[..]);
        // The synthesized remainder repeats existing walkers.
        assert_eq!(&after[2..4], &before[..]);

        // Shrink back down: truncation keeps the head.
        let shrunk = McmcState::resize_or_init(Some(grown), 4, &hydrogen(), &mesh, &config)
            .unwrap();
        assert_eq!(shrunk.total_walkers(), 4);
        let final_pos = shrunk.shards[0].positions.to_vec3::<f64>().unwrap();
        assert_eq!(&final_pos[..], &before[..]);
    }

    #[test]
    fn test_burn_in_advances_phase_and_counts_steps() {
        let mesh = mesh(1);
        let vmc = VmcConfig::h2_sample();
        let system = hydrogen();
        let (model, params, fixed) =
            build_model(&vmc.model, &system, mesh.root_device()).unwrap();
        let mcmc_config = McmcConfig {
            n_walkers_opt: 16,
            n_burn_in: 25,
            n_inter_steps: 5,
            ..McmcConfig::default()
        };
        let state =
            McmcState::resize_or_init(None, 16, &system, &mesh, &mcmc_config).unwrap();
        let params_view = mesh.replicate(&params).unwrap();
        let fixed_view = mesh.replicate(&fixed).unwrap();

        let sampler = MetropolisHastings::new(&mcmc_config);
        let state = sampler
            .run_burn_in(&mesh, &model, state, &params_view, &fixed_view)
            .unwrap();
        assert_eq!(state.phase, SamplerPhase::BurnedIn);
        assert_eq!(state.step_count, 25);
        assert!(state.acceptance_rate > 0.0 && state.acceptance_rate <= 1.0);
        assert!(state.mean_log_psi_sqr().is_some());

        let state = sampler
            .run_inter_steps(&mesh, &model, state, &params_view, &fixed_view)
            .unwrap();
        assert_eq!(state.phase, SamplerPhase::Steady);
        assert_eq!(state.step_count, 30);
        // Positions stayed finite through the whole run.
        for shard in state.build_batch().shards() {
            for x in shard.flatten_all().unwrap().to_vec1::<f64>().unwrap() {
                assert!(x.is_finite());
            }
        }
    }

    /// Density that is NaN beyond `|z| > 2`: walkers must never cross the
    /// wall, because a non-finite proposal is a rejection.
    struct WalledDensity;

    impl WaveFunction for WalledDensity {
        fn log_psi_sqr(
            &self,
            _params: &Params,
            _fixed: &FixedParams,
            positions: &Tensor,
        ) -> Result<Tensor> {
            let n = positions.dims()[0];
            let flat = positions.flatten_all()?.to_vec1::<f64>()?;
            let per_walker = flat.len() / n;
            let values: Vec<f64> = flat
                .chunks(per_walker)
                .map(|walker| {
                    if walker.iter().any(|x| x.abs() > 2.0) {
                        f64::NAN
                    } else {
                        0.0
                    }
                })
                .collect();
            Tensor::from_vec(values, (n,), positions.device())
        }

        fn local_energy(
            &self,
            _params: &Params,
            _fixed: &FixedParams,
            positions: &Tensor,
        ) -> Result<Tensor> {
            Tensor::zeros((positions.dims()[0],), DType::F64, positions.device())
        }

        fn param_grads(
            &self,
            _params: &Params,
            _fixed: &FixedParams,
            _positions: &Tensor,
        ) -> Result<Params> {
            Ok(Params::new())
        }
    }

    #[test]
    fn test_non_finite_density_rejects_the_move() {
        let mesh = mesh(1);
        let system = hydrogen();
        let mcmc_config = McmcConfig {
            n_burn_in: 50,
            proposal_stddev: 0.5,
            seed: 3,
            ..McmcConfig::default()
        };
        // Start everyone at the origin, well inside the wall.
        let mut state =
            McmcState::resize_or_init(None, 8, &system, &mesh, &mcmc_config).unwrap();
        let zeros = Tensor::zeros((8, 1, 3), DType::F64, mesh.root_device()).unwrap();
        state.shards[0].positions = zeros;

        let fixed = FixedParams::new(&system, mesh.root_device()).unwrap();
        let params_view = mesh.replicate(&Params::new()).unwrap();
        let fixed_view = mesh.replicate(&fixed).unwrap();

        let sampler = MetropolisHastings::new(&mcmc_config);
        let state = sampler
            .run_burn_in(&mesh, &WalledDensity, state, &params_view, &fixed_view)
            .unwrap();
        for x in state.shards[0]
            .positions
            .flatten_all()
            .unwrap()
            .to_vec1::<f64>()
            .unwrap()
        {
            assert!(x.abs() <= 2.0, "walker escaped the wall: {}", x);
        }
        // Inside the wall the density is flat, so plenty of moves were
        // still accepted.
        assert!(state.acceptance_rate > 0.0);
    }
}
