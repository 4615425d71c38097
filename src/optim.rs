//! Value/gradient estimation and the optimizer.
//!
//! # Why a custom AdamW?
//!
//! Parameters here are free tensors in a named tree, not framework
//! variables: every epoch merges a different target's unique leaves with
//! the shared set before the step and re-splits afterwards. The optimizer
//! therefore takes explicit gradient trees keyed by parameter name and
//! returns a new parameter tree, keeping its moment buffers keyed the same
//! way. The moment structure is fixed at creation; every target must
//! produce a merged tree of identical structure for the whole run.

use candle_core::{Result, Tensor};

use crate::config::ClippingConfig;
use crate::distributed::{
    reduce_param_trees, Collective, DeviceMesh, DeviceView, ReduceOp,
};
use crate::model::{FixedParams, WaveFunction};
use crate::params::Params;
use crate::stats::{nan_mean, nan_std};

/// Outlier bounds for local-energy samples: values outside
/// `center +/- half_width` are clamped before they reach the gradient.
#[derive(Debug, Clone, Copy)]
pub struct ClippingState {
    pub center: f64,
    pub half_width: f64,
}

/// Fresh clipping state: the first step runs unclipped, then the window
/// tracks the sample distribution.
pub fn init_clipping_state() -> ClippingState {
    ClippingState {
        center: 0.0,
        half_width: f64::INFINITY,
    }
}

impl ClippingState {
    fn clip(&self, value: f64) -> f64 {
        if !self.half_width.is_finite() {
            return value;
        }
        value.clamp(self.center - self.half_width, self.center + self.half_width)
    }
}

/// Per-step statistics bundle handed to the logger and the running
/// metrics. Raw samples keep their non-finite entries; only aggregation
/// filters them.
#[derive(Debug, Clone)]
pub struct StepStats {
    pub e_loc_unclipped: Vec<f64>,
    pub e_loc_clipped: Vec<f64>,
    pub e_mean: f64,
    pub e_std: f64,
    pub grad_norm: f64,
}

/// Clipped VMC energy-gradient estimator.
///
/// Per device shard: local energies, then the covariance gradient
/// `mean[(E_clip - E_mean) * d log psi^2 / d theta]` with the mean taken
/// over that shard's walkers; shards are mean-reduced into one canonical
/// gradient tree. Non-finite samples contribute zero weight.
pub struct EnergyGradientEstimator {
    clip_range: f64,
}

impl EnergyGradientEstimator {
    pub fn new(config: &ClippingConfig) -> Self {
        Self {
            clip_range: config.range,
        }
    }

    pub fn estimate<M: WaveFunction>(
        &self,
        mesh: &DeviceMesh,
        collective: &dyn Collective,
        model: &M,
        params: &DeviceView<Params>,
        fixed: &DeviceView<FixedParams>,
        batch: &DeviceView<Tensor>,
        clipping: &ClippingState,
    ) -> Result<(Params, ClippingState, StepStats)> {
        mesh.check_shards(params.len())?;
        mesh.check_shards(fixed.len())?;
        mesh.check_shards(batch.len())?;

        // Pass 1: local energies on every device, gathered for the global
        // clipping window and sample statistics.
        let energy_shards = mesh.for_each(|idx, _device| {
            model.local_energy(
                &params.shards()[idx],
                &fixed.shards()[idx],
                &batch.shards()[idx],
            )
        })?;
        let mut e_unclipped = Vec::new();
        let mut shard_sizes = Vec::with_capacity(energy_shards.len());
        for shard in &energy_shards {
            let values = shard.to_vec1::<f64>()?;
            shard_sizes.push(values.len());
            e_unclipped.extend(values);
        }

        let e_clipped: Vec<f64> = e_unclipped.iter().map(|&e| clipping.clip(e)).collect();
        let e_mean = nan_mean(&e_clipped);
        let e_std = nan_std(&e_clipped);

        // Centered weights; non-finite samples drop out of the gradient
        // but stay in the raw stats.
        let weights: Vec<f64> = e_clipped
            .iter()
            .map(|&e| if e.is_finite() { e - e_mean } else { 0.0 })
            .collect();
        let mut weight_shards = Vec::with_capacity(shard_sizes.len());
        let mut offset = 0;
        for &size in &shard_sizes {
            weight_shards.push(weights[offset..offset + size].to_vec());
            offset += size;
        }

        // Pass 2: per-device covariance gradients, then a mean reduction
        // across the mesh.
        let grad_shards = mesh.for_each(|idx, device| {
            let leaf_grads = model.param_grads(
                &params.shards()[idx],
                &fixed.shards()[idx],
                &batch.shards()[idx],
            )?;
            let n_local = shard_sizes[idx];
            let w = Tensor::from_vec(weight_shards[idx].clone(), (n_local,), device)?;
            let mut tree = Params::new();
            for (name, per_walker) in leaf_grads {
                let mut w_shape = vec![n_local];
                w_shape.extend(std::iter::repeat(1).take(per_walker.dims().len() - 1));
                let weighted = per_walker.broadcast_mul(&w.reshape(w_shape)?)?;
                tree.insert(name, weighted.mean(0)?);
            }
            Ok(tree)
        })?;
        let grads = reduce_param_trees(
            collective,
            mesh,
            &DeviceView::from_shards(grad_shards),
            ReduceOp::Mean,
        )?;

        let mut grad_norm_sq = 0.0;
        for leaf in grads.values() {
            grad_norm_sq += leaf.sqr()?.sum_all()?.to_vec0::<f64>()?;
        }

        let new_clipping = if e_mean.is_finite() && e_std.is_finite() {
            ClippingState {
                center: e_mean,
                half_width: self.clip_range * e_std,
            }
        } else {
            *clipping
        };

        let stats = StepStats {
            e_loc_unclipped: e_unclipped,
            e_loc_clipped: e_clipped,
            e_mean,
            e_std,
            grad_norm: grad_norm_sq.sqrt(),
        };
        Ok((grads, new_clipping, stats))
    }
}

/// AdamW optimizer configuration.
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            // Energy minimization has no use for decay toward zero
            weight_decay: 0.0,
        }
    }
}

impl AdamWConfig {
    pub fn with_lr(lr: f64) -> Self {
        Self {
            lr,
            ..Default::default()
        }
    }
}

/// AdamW over a named parameter tree, with explicit gradients.
///
/// This instance *is* the opaque optimizer state of the run: one copy,
/// threaded epoch to epoch across all targets.
///
/// For each parameter theta with gradient g:
/// ```text
/// m = b1 * m + (1 - b1) * g
/// v = b2 * v + (1 - b2) * g^2
/// theta = theta - lr * (m_hat / (sqrt(v_hat) + eps) + lambda * theta)
/// ```
pub struct AdamW {
    m: Params,
    v: Params,
    config: AdamWConfig,
    step_count: usize,
}

impl AdamW {
    /// Create the optimizer, keying moment buffers to the merged parameter
    /// structure. That structure is frozen for the run.
    pub fn new(params: &Params, config: AdamWConfig) -> Result<Self> {
        let mut m = Params::new();
        let mut v = Params::new();
        for (name, tensor) in params {
            let zeros = tensor.zeros_like()?;
            m.insert(name.clone(), zeros.clone());
            v.insert(name.clone(), zeros);
        }
        Ok(Self {
            m,
            v,
            config,
            step_count: 0,
        })
    }

    /// One update with explicit gradients; returns the new parameter tree.
    ///
    /// The gradient tree must carry exactly the parameters this optimizer
    /// was created with, at identical shapes.
    pub fn step(&mut self, params: &Params, grads: &Params) -> Result<Params> {
        if params.len() != self.m.len() || grads.len() != self.m.len() {
            return Err(candle_core::Error::Msg(format!(
                "optimizer state holds {} parameters but received {} params / {} grads; \
                 merged parameter structure must be identical across targets",
                self.m.len(),
                params.len(),
                grads.len()
            )));
        }
        self.step_count += 1;
        let t = self.step_count as f64;
        let bias_correction1 = 1.0 - self.config.beta1.powf(t);
        let bias_correction2 = 1.0 - self.config.beta2.powf(t);

        let mut updated = Params::new();
        for (name, param) in params {
            let grad = grads.get(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("missing gradient for parameter {:?}", name))
            })?;
            let m_t = self.m.get_mut(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("unknown parameter: {}", name))
            })?;
            let v_t = self.v.get_mut(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("unknown parameter: {}", name))
            })?;
            if grad.dims() != param.dims() || m_t.dims() != param.dims() {
                return Err(candle_core::Error::Msg(format!(
                    "shape mismatch for parameter {:?}: param {:?}, grad {:?}, moment {:?}",
                    name,
                    param.dims(),
                    grad.dims(),
                    m_t.dims()
                )));
            }

            let new_m = ((m_t.clone() * self.config.beta1)?
                + (grad.clone() * (1.0 - self.config.beta1))?)?;
            let new_v = ((v_t.clone() * self.config.beta2)?
                + (grad.sqr()? * (1.0 - self.config.beta2))?)?;
            *m_t = new_m.clone();
            *v_t = new_v.clone();

            let m_hat = (&new_m / bias_correction1)?;
            let v_hat = (&new_v / bias_correction2)?;
            let denom = (v_hat.sqrt()? + self.config.eps)?;
            let adam_update = (m_hat.div(&denom)? * self.config.lr)?;
            let decayed = (param * (self.config.lr * self.config.weight_decay))?;
            let new_param = param.sub(&adam_update)?.sub(&decayed)?;
            updated.insert(name.clone(), new_param);
        }
        Ok(updated)
    }

    #[allow(dead_code)]
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, PhysicalSystem, VmcConfig};
    use crate::distributed::sync::{CollectiveBackend, DeviceConfig};
    use crate::distributed::create_collective;
    use crate::mcmc::McmcState;
    use crate::model::build_model;
    use candle_core::Device;

    fn leaf(values: Vec<f64>) -> Tensor {
        let n = values.len();
        Tensor::from_vec(values, (n,), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_adamw_first_step_magnitude() {
        let mut params = Params::new();
        params.insert("jastrow.weight".to_string(), leaf(vec![1.0]));
        let mut opt = AdamW::new(&params, AdamWConfig::with_lr(0.1)).unwrap();

        let mut grads = Params::new();
        grads.insert("jastrow.weight".to_string(), leaf(vec![4.0]));
        let updated = opt.step(&params, &grads).unwrap();
        let value = updated["jastrow.weight"].to_vec1::<f64>().unwrap()[0];
        // Bias-corrected first step moves by ~lr against the gradient.
        assert!((value - 0.9).abs() < 1e-6, "got {}", value);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_adamw_rejects_unknown_parameter() {
        let mut params = Params::new();
        params.insert("jastrow.weight".to_string(), leaf(vec![1.0]));
        let mut opt = AdamW::new(&params, AdamWConfig::default()).unwrap();

        let mut other = Params::new();
        other.insert("backflow.scale".to_string(), leaf(vec![1.0]));
        let mut grads = Params::new();
        grads.insert("backflow.scale".to_string(), leaf(vec![0.5]));
        assert!(opt.step(&other, &grads).is_err());
    }

    #[test]
    fn test_adamw_rejects_shape_mismatch() {
        let mut params = Params::new();
        params.insert("envelope.exponents".to_string(), leaf(vec![1.0, 2.0]));
        let mut opt = AdamW::new(&params, AdamWConfig::default()).unwrap();

        let mut bad = Params::new();
        bad.insert("envelope.exponents".to_string(), leaf(vec![1.0, 2.0, 3.0]));
        let mut grads = Params::new();
        grads.insert("envelope.exponents".to_string(), leaf(vec![0.1, 0.1, 0.1]));
        assert!(opt.step(&bad, &grads).is_err());
    }

    #[test]
    fn test_clipping_window() {
        let state = ClippingState {
            center: -1.0,
            half_width: 0.5,
        };
        assert_eq!(state.clip(-3.0), -1.5);
        assert_eq!(state.clip(4.0), -0.5);
        assert_eq!(state.clip(-1.2), -1.2);
        // Fresh state passes everything through.
        assert_eq!(init_clipping_state().clip(1e9), 1e9);
    }

    #[test]
    fn test_estimator_zero_variance_at_exact_ground_state() {
        // With the exact hydrogen ground state the local energy is
        // constant, so the covariance gradient vanishes.
        let device_config = DeviceConfig {
            device_count: 1,
            backend: CollectiveBackend::CpuStaging,
        };
        let mesh = DeviceMesh::new(&device_config).unwrap();
        let collective = create_collective(&device_config).unwrap();

        let system = PhysicalSystem {
            name: "H".to_string(),
            ion_positions: vec![[0.0, 0.0, 0.0]],
            ion_charges: vec![1.0],
            n_electrons: 1,
            e_ref: Some(-0.5),
        };
        let model_config = ModelConfig {
            envelope_exponent_init: 1.0,
            jastrow_weight_init: 0.0,
            jastrow_scale_init: 1.0,
        };
        let (model, params, fixed) =
            build_model(&model_config, &system, mesh.root_device()).unwrap();

        let vmc = VmcConfig::h2_sample();
        let state = McmcState::resize_or_init(None, 32, &system, &mesh, &vmc.mcmc).unwrap();
        let params_view = mesh.replicate(&params).unwrap();
        let fixed_view = mesh.replicate(&fixed).unwrap();
        let batch = state.build_batch();

        let estimator = EnergyGradientEstimator::new(&vmc.optimization.clipping);
        let (grads, new_clipping, stats) = estimator
            .estimate(
                &mesh,
                collective.as_ref(),
                &model,
                &params_view,
                &fixed_view,
                &batch,
                &init_clipping_state(),
            )
            .unwrap();

        assert!((stats.e_mean + 0.5).abs() < 1e-3, "E = {}", stats.e_mean);
        assert!(stats.grad_norm < 1e-3, "grad_norm = {}", stats.grad_norm);
        assert_eq!(grads.len(), params.len());
        assert!((new_clipping.center + 0.5).abs() < 1e-3);
        assert_eq!(stats.e_loc_unclipped.len(), 32);
    }
}
