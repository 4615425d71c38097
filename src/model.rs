//! Trial wavefunction interface and the reference model.
//!
//! The core never looks inside a wavefunction: it only needs the log
//! density for Metropolis acceptance, per-walker local energies for the
//! objective, and per-walker parameter gradients for the estimator. All
//! three are behind the `WaveFunction` trait so a richer ansatz can be
//! swapped in without touching the orchestration.
//!
//! The reference model is a product of exponential envelopes (one exponent
//! per ion) and a Pade electron-electron Jastrow factor:
//!
//! ```text
//! log psi^2 = -2 sum_{i,j} alpha_j |r_i - R_j|
//!             + 2 w sum_{i<k} r_ik / (1 + s^2 r_ik)
//! ```
//!
//! Envelope exponents depend on the geometry and stay unique per target;
//! the Jastrow factor transfers across geometries and is shared by the
//! default module patterns. The kinetic part of the local energy uses a
//! central finite-difference Laplacian of log psi; parameter gradients are
//! analytic.

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::config::{ModelConfig, PhysicalSystem};
use crate::distributed::Replicate;
use crate::params::Params;

/// Finite-difference step for the Laplacian (Bohr).
const FD_STEP: f64 = 1e-3;

/// Non-trainable per-target data: geometry tensors and the constant
/// ion-ion repulsion energy.
#[derive(Debug, Clone)]
pub struct FixedParams {
    /// Ion positions, `[n_ion, 3]`
    pub ion_positions: Tensor,
    /// Ion charges, `[n_ion]`
    pub ion_charges: Tensor,
    /// Ion-ion repulsion energy (Hartree)
    pub e_ion_ion: f64,
}

impl FixedParams {
    pub fn new(system: &PhysicalSystem, device: &Device) -> Result<Self> {
        let n_ion = system.ion_positions.len();
        let flat: Vec<f64> = system
            .ion_positions
            .iter()
            .flat_map(|p| p.iter().copied())
            .collect();
        let ion_positions = Tensor::from_vec(flat, (n_ion, 3), device)?;
        let ion_charges = Tensor::from_vec(system.ion_charges.clone(), (n_ion,), device)?;

        let mut e_ion_ion = 0.0;
        for a in 0..n_ion {
            for b in (a + 1)..n_ion {
                let pa = system.ion_positions[a];
                let pb = system.ion_positions[b];
                let dist = ((pa[0] - pb[0]).powi(2)
                    + (pa[1] - pb[1]).powi(2)
                    + (pa[2] - pb[2]).powi(2))
                .sqrt();
                e_ion_ion += system.ion_charges[a] * system.ion_charges[b] / dist;
            }
        }
        Ok(Self {
            ion_positions,
            ion_charges,
            e_ion_ion,
        })
    }

    pub fn n_ions(&self) -> usize {
        self.ion_positions.dims()[0]
    }
}

impl Replicate for FixedParams {
    fn copy_to(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            ion_positions: self.ion_positions.to_device(device)?,
            ion_charges: self.ion_charges.to_device(device)?,
            e_ion_ion: self.e_ion_ion,
        })
    }
}

/// Probability density and local-energy interface the sampler and the
/// estimator are written against.
pub trait WaveFunction: Send + Sync {
    /// `log psi^2` per walker; `positions` is `[n, n_el, 3]`, result `[n]`.
    fn log_psi_sqr(&self, params: &Params, fixed: &FixedParams, positions: &Tensor)
        -> Result<Tensor>;

    /// Local energy `H psi / psi` per walker, `[n]`. Entries may be
    /// non-finite for pathological walkers; callers absorb those.
    fn local_energy(&self, params: &Params, fixed: &FixedParams, positions: &Tensor)
        -> Result<Tensor>;

    /// Per-walker gradients of `log psi^2` w.r.t. every parameter leaf:
    /// same keys as `params`, leaf shapes `[n, ...leaf]`.
    fn param_grads(&self, params: &Params, fixed: &FixedParams, positions: &Tensor)
        -> Result<Params>;
}

/// The reference envelope x Jastrow ansatz. Stateless; everything lives in
/// the parameter tree and the fixed params.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeJastrow;

fn get_leaf<'a>(params: &'a Params, name: &str) -> Result<&'a Tensor> {
    params.get(name).ok_or_else(|| {
        candle_core::Error::Msg(format!("parameter {:?} missing from tree", name))
    })
}

fn leaf_scalar(params: &Params, name: &str) -> Result<f64> {
    let values = get_leaf(params, name)?.flatten_all()?.to_vec1::<f64>()?;
    values.first().copied().ok_or_else(|| {
        candle_core::Error::Msg(format!("parameter {:?} is empty", name))
    })
}

/// Electron-ion distances: `[n, n_el, 3]` x `[n_ion, 3]` -> `[n, n_el, n_ion]`.
fn electron_ion_distances(positions: &Tensor, ions: &Tensor) -> Result<Tensor> {
    let (n_ion, _) = ions.dims2()?;
    let diff = positions
        .unsqueeze(2)?
        .broadcast_sub(&ions.reshape((1, 1, n_ion, 3))?)?;
    diff.sqr()?.sum(3)?.sqrt()
}

/// Pairwise electron distances `[n, n_el, n_el]`, zero on the diagonal.
fn electron_electron_distances(positions: &Tensor) -> Result<Tensor> {
    let diff = positions
        .unsqueeze(2)?
        .broadcast_sub(&positions.unsqueeze(1)?)?;
    diff.sqr()?.sum(3)?.sqrt()
}

fn identity_matrix(n: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f64; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Tensor::from_vec(data, (n, n), device)
}

impl EnvelopeJastrow {
    /// Pair sums used by both the density and the gradients:
    /// `(sum_{i<k} u(r_ik), sum_{i<k} r^2/(1+s^2 r)^2)`, both `[n]`.
    fn jastrow_sums(&self, positions: &Tensor, scale: f64) -> Result<(Tensor, Tensor)> {
        let r = electron_electron_distances(positions)?;
        let denom = ((&r * (scale * scale))? + 1.0)?;
        // Diagonal entries are zero and contribute nothing to either sum.
        let u = r.div(&denom)?;
        let du = r.sqr()?.div(&denom.sqr()?)?;
        let pair_u = (u.sum(2)?.sum(1)? * 0.5)?;
        let pair_du = (du.sum(2)?.sum(1)? * 0.5)?;
        Ok((pair_u, pair_du))
    }
}

impl WaveFunction for EnvelopeJastrow {
    fn log_psi_sqr(
        &self,
        params: &Params,
        fixed: &FixedParams,
        positions: &Tensor,
    ) -> Result<Tensor> {
        let n_ion = fixed.n_ions();
        let alpha = get_leaf(params, "envelope.exponents")?;
        let weight = leaf_scalar(params, "jastrow.weight")?;
        let scale = leaf_scalar(params, "jastrow.scale")?;

        let d_ei = electron_ion_distances(positions, &fixed.ion_positions)?;
        let envelope = d_ei
            .broadcast_mul(&alpha.reshape((1, 1, n_ion))?)?
            .sum(2)?
            .sum(1)?;
        let (pair_u, _) = self.jastrow_sums(positions, scale)?;
        (envelope * (-2.0))? + (pair_u * (2.0 * weight))?
    }

    fn local_energy(
        &self,
        params: &Params,
        fixed: &FixedParams,
        positions: &Tensor,
    ) -> Result<Tensor> {
        let (n, n_el, _) = positions.dims3()?;
        let device = positions.device();
        let l0 = self.log_psi_sqr(params, fixed, positions)?;

        // Kinetic energy from L = log psi^2 via central differences:
        //   -1/2 nabla^2 psi / psi = -1/2 (nabla^2 L / 2 + |nabla L|^2 / 4)
        let mut laplacian = Tensor::zeros((n,), DType::F64, device)?;
        let mut grad_sq = Tensor::zeros((n,), DType::F64, device)?;
        for electron in 0..n_el {
            for axis in 0..3 {
                let mut offset = vec![0f64; n_el * 3];
                offset[electron * 3 + axis] = FD_STEP;
                let step = Tensor::from_vec(offset, (1, n_el, 3), device)?;
                let l_plus =
                    self.log_psi_sqr(params, fixed, &positions.broadcast_add(&step)?)?;
                let l_minus =
                    self.log_psi_sqr(params, fixed, &positions.broadcast_sub(&step)?)?;
                let first = ((&l_plus - &l_minus)? / (2.0 * FD_STEP))?;
                let second = (((&l_plus + &l_minus)? - (&l0 * 2.0)?)? / (FD_STEP * FD_STEP))?;
                laplacian = (laplacian + second)?;
                grad_sq = (grad_sq + first.sqr()?)?;
            }
        }
        let kinetic = (((laplacian * 0.5)? + (grad_sq * 0.25)?)? * (-0.5))?;

        // Electron-ion attraction; a walker sitting on a nucleus yields an
        // infinite term, which downstream treats as a rejected sample.
        let n_ion = fixed.n_ions();
        let d_ei = electron_ion_distances(positions, &fixed.ion_positions)?;
        let v_en = fixed
            .ion_charges
            .reshape((1, 1, n_ion))?
            .broadcast_div(&d_ei)?
            .sum(2)?
            .sum(1)?
            .neg()?;

        // Electron-electron repulsion; pad the diagonal with ones so the
        // self-interaction terms become exactly n_el, subtracted below.
        let r_ee = electron_electron_distances(positions)?;
        let eye = identity_matrix(n_el, device)?.reshape((1, n_el, n_el))?;
        let inv = r_ee.broadcast_add(&eye)?.recip()?;
        let v_ee = ((inv.sum(2)?.sum(1)? - n_el as f64)? * 0.5)?;

        ((kinetic + v_en)? + v_ee)? + fixed.e_ion_ion
    }

    fn param_grads(
        &self,
        params: &Params,
        fixed: &FixedParams,
        positions: &Tensor,
    ) -> Result<Params> {
        let (n, _, _) = positions.dims3()?;
        let weight = leaf_scalar(params, "jastrow.weight")?;
        let scale = leaf_scalar(params, "jastrow.scale")?;

        let d_ei = electron_ion_distances(positions, &fixed.ion_positions)?;
        let grad_alpha = (d_ei.sum(1)? * (-2.0))?; // [n, n_ion]

        let (pair_u, pair_du) = self.jastrow_sums(positions, scale)?;
        let grad_weight = (pair_u * 2.0)?.reshape((n, 1))?;
        let grad_scale = (pair_du * (-4.0 * weight * scale))?.reshape((n, 1))?;

        let mut grads = Params::new();
        grads.insert("envelope.exponents".to_string(), grad_alpha);
        grads.insert("jastrow.weight".to_string(), grad_weight);
        grads.insert("jastrow.scale".to_string(), grad_scale);
        Ok(grads)
    }
}

/// Build the reference model for one geometry: the density functions, the
/// initial trainable parameters, and the fixed params.
///
/// Envelope exponents start at `Z_j * envelope_exponent_init`, the
/// hydrogenic cusp value for `init = 1`.
pub fn build_model(
    config: &ModelConfig,
    system: &PhysicalSystem,
    device: &Device,
) -> Result<(EnvelopeJastrow, Params, FixedParams)> {
    let fixed = FixedParams::new(system, device)?;
    let exponents: Vec<f64> = system
        .ion_charges
        .iter()
        .map(|z| z * config.envelope_exponent_init)
        .collect();
    let n_ion = exponents.len();

    let mut params = Params::new();
    params.insert(
        "envelope.exponents".to_string(),
        Tensor::from_vec(exponents, (n_ion,), device)?,
    );
    params.insert(
        "jastrow.weight".to_string(),
        Tensor::from_vec(vec![config.jastrow_weight_init], (1,), device)?,
    );
    params.insert(
        "jastrow.scale".to_string(),
        Tensor::from_vec(vec![config.jastrow_scale_init], (1,), device)?,
    );
    Ok((EnvelopeJastrow, params, fixed))
}

/// Initial walker positions for a geometry: electrons assigned to ions
/// round-robin with unit Gaussian offsets.
pub fn initial_positions(
    system: &PhysicalSystem,
    n_walkers: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Tensor> {
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| candle_core::Error::Msg(format!("invalid init distribution: {}", e)))?;
    let n_el = system.n_electrons;
    let n_ion = system.ion_positions.len();
    let mut data = Vec::with_capacity(n_walkers * n_el * 3);
    for _ in 0..n_walkers {
        for electron in 0..n_el {
            let center = system.ion_positions[electron % n_ion];
            for axis in 0..3 {
                data.push(center[axis] + normal.sample(rng));
            }
        }
    }
    Tensor::from_vec(data, (n_walkers, n_el, 3), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn hydrogen() -> PhysicalSystem {
        PhysicalSystem {
            name: "H".to_string(),
            ion_positions: vec![[0.0, 0.0, 0.0]],
            ion_charges: vec![1.0],
            n_electrons: 1,
            e_ref: Some(-0.5),
        }
    }

    fn hydrogen_model() -> (EnvelopeJastrow, Params, FixedParams) {
        let config = ModelConfig {
            envelope_exponent_init: 1.0,
            jastrow_weight_init: 0.0,
            jastrow_scale_init: 1.0,
        };
        build_model(&config, &hydrogen(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_hydrogen_ground_state_energy_is_exact() {
        // With alpha = Z = 1 and no Jastrow the ansatz is the exact 1s
        // ground state: E_loc = -0.5 Ha at every point away from the
        // nucleus.
        let (model, params, fixed) = hydrogen_model();
        let positions = Tensor::from_vec(
            vec![0.9f64, 0.2, -0.4, -1.3, 0.7, 0.5, 0.1, -2.0, 0.6],
            (3, 1, 3),
            &Device::Cpu,
        )
        .unwrap();
        let e_loc = model
            .local_energy(&params, &fixed, &positions)
            .unwrap()
            .to_vec1::<f64>()
            .unwrap();
        for e in e_loc {
            assert!((e + 0.5).abs() < 1e-4, "E_loc = {}", e);
        }
    }

    #[test]
    fn test_param_grads_match_finite_differences() {
        let config = ModelConfig {
            envelope_exponent_init: 0.9,
            jastrow_weight_init: 0.3,
            jastrow_scale_init: 0.8,
        };
        let system = PhysicalSystem {
            name: "H2".to_string(),
            ion_positions: vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.4]],
            ion_charges: vec![1.0, 1.0],
            n_electrons: 2,
            e_ref: None,
        };
        let (model, params, fixed) = build_model(&config, &system, &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let positions = initial_positions(&system, 4, &mut rng, &Device::Cpu).unwrap();

        let analytic = model.param_grads(&params, &fixed, &positions).unwrap();
        let eps = 1e-6;
        for (name, leaf) in &params {
            let flat = leaf.flatten_all().unwrap().to_vec1::<f64>().unwrap();
            for idx in 0..flat.len() {
                let mut bumped = flat.clone();
                bumped[idx] += eps;
                let mut perturbed = params.clone();
                perturbed.insert(
                    name.clone(),
                    Tensor::from_vec(bumped, leaf.dims().to_vec(), &Device::Cpu).unwrap(),
                );
                let l_plus = model
                    .log_psi_sqr(&perturbed, &fixed, &positions)
                    .unwrap()
                    .to_vec1::<f64>()
                    .unwrap();
                let l_base = model
                    .log_psi_sqr(&params, &fixed, &positions)
                    .unwrap()
                    .to_vec1::<f64>()
                    .unwrap();
                let grad_fd: Vec<f64> = l_plus
                    .iter()
                    .zip(&l_base)
                    .map(|(p, b)| (p - b) / eps)
                    .collect();
                let grad_leaf = analytic[name]
                    .to_dtype(DType::F64)
                    .unwrap()
                    .reshape((positions.dims()[0], flat.len()))
                    .unwrap()
                    .to_vec2::<f64>()
                    .unwrap();
                for (walker, fd) in grad_fd.iter().enumerate() {
                    assert!(
                        (grad_leaf[walker][idx] - fd).abs() < 1e-4,
                        "{}[{}] walker {}: analytic {} vs fd {}",
                        name,
                        idx,
                        walker,
                        grad_leaf[walker][idx],
                        fd
                    );
                }
            }
        }
    }

    #[test]
    fn test_density_symmetric_under_electron_exchange() {
        let config = ModelConfig::default();
        let system = PhysicalSystem {
            name: "He".to_string(),
            ion_positions: vec![[0.0, 0.0, 0.0]],
            ion_charges: vec![2.0],
            n_electrons: 2,
            e_ref: None,
        };
        let (model, params, fixed) = build_model(&config, &system, &Device::Cpu).unwrap();
        let a = Tensor::from_vec(
            vec![0.5f64, 0.1, -0.3, -0.8, 0.4, 0.2],
            (1, 2, 3),
            &Device::Cpu,
        )
        .unwrap();
        let b = Tensor::from_vec(
            vec![-0.8f64, 0.4, 0.2, 0.5, 0.1, -0.3],
            (1, 2, 3),
            &Device::Cpu,
        )
        .unwrap();
        let la = model.log_psi_sqr(&params, &fixed, &a).unwrap().to_vec1::<f64>().unwrap();
        let lb = model.log_psi_sqr(&params, &fixed, &b).unwrap().to_vec1::<f64>().unwrap();
        assert!((la[0] - lb[0]).abs() < 1e-12);
    }

    #[test]
    fn test_ion_ion_energy() {
        let system = PhysicalSystem {
            name: "H2".to_string(),
            ion_positions: vec![[0.0, 0.0, 0.0], [0.0, 0.0, 2.0]],
            ion_charges: vec![1.0, 1.0],
            n_electrons: 2,
            e_ref: None,
        };
        let fixed = FixedParams::new(&system, &Device::Cpu).unwrap();
        assert!((fixed.e_ion_ion - 0.5).abs() < 1e-12);
    }
}
