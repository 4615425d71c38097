//! Multi-Device Replication Layer
//!
//! Keeps the shared optimization state bit-identical across parallel
//! compute devices and reduces per-device estimates back to one canonical
//! copy.
//!
//! # Architecture
//!
//! - `DeviceMesh` - fixed pool of devices with an explicit fork-join
//!   primitive (one task per device, full join before any reduction)
//! - `Collective` - trait for broadcast / mean / sum collectives
//! - `CpuStagingCollective` - default backend staging shards through CPU
//! - `SingleDeviceCollective` - passthrough for single-device runs
//!
//! # Usage
//!
//! ```ignore
//! let mesh = DeviceMesh::new(&config.devices)?;
//! let collective = create_collective(&config.devices)?;
//!
//! // At setup: seed every device with the same data
//! let fixed = mesh.replicate(&fixed_params)?;
//!
//! // In the epoch loop, after per-device gradient shards:
//! let grad = collective.reduce(&mesh, &shards, ReduceOp::Mean)?;
//! ```

pub mod mesh;
pub mod staging;
pub mod sync;

// Re-exports for convenience
pub use mesh::{is_consistent, DeviceMesh, DeviceView, Replicate};
pub use staging::{CpuStagingCollective, SingleDeviceCollective};
pub use sync::{Collective, CollectiveBackend, DeviceConfig, ReduceOp};

use candle_core::{Result, Tensor};

use crate::params::Params;

/// Create a collective based on configuration.
///
/// The backend is resolved exactly once at startup; using `single` with
/// more than one device is a configuration error.
pub fn create_collective(config: &DeviceConfig) -> Result<Box<dyn Collective>> {
    match config.backend {
        CollectiveBackend::Single => {
            if config.device_count > 1 {
                return Err(candle_core::Error::Msg(format!(
                    "collective backend 'single' cannot drive {} devices; use 'cpu'",
                    config.device_count
                )));
            }
            Ok(Box::new(SingleDeviceCollective))
        }
        CollectiveBackend::CpuStaging => Ok(Box::new(CpuStagingCollective)),
    }
}

/// Reduce per-device parameter trees leaf-by-leaf into one canonical tree.
///
/// Every shard must carry the same leaves; a missing leaf on any device is
/// a structure mismatch and fails the step.
pub fn reduce_param_trees(
    collective: &dyn Collective,
    mesh: &DeviceMesh,
    shards: &DeviceView<Params>,
    op: ReduceOp,
) -> Result<Params> {
    mesh.check_shards(shards.len())?;
    let mut reduced = Params::new();
    for name in shards.root().keys() {
        let leaf_shards = shards
            .iter()
            .map(|tree| {
                tree.get(name).cloned().ok_or_else(|| {
                    candle_core::Error::Msg(format!(
                        "parameter {:?} missing from a device shard during reduction",
                        name
                    ))
                })
            })
            .collect::<Result<Vec<Tensor>>>()?;
        let leaf = collective.reduce(mesh, &DeviceView::from_shards(leaf_shards), op)?;
        reduced.insert(name.clone(), leaf);
    }
    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_backend_rejects_multi_device() {
        let config = DeviceConfig {
            device_count: 2,
            backend: CollectiveBackend::Single,
        };
        assert!(create_collective(&config).is_err());
    }

    #[test]
    fn test_reduce_param_trees_mean() {
        let config = DeviceConfig {
            device_count: 2,
            backend: CollectiveBackend::CpuStaging,
        };
        let mesh = DeviceMesh::new(&config).unwrap();
        let collective = create_collective(&config).unwrap();

        let mut a = Params::new();
        a.insert(
            "jastrow.weight".to_string(),
            Tensor::from_vec(vec![1.0f64], (1,), mesh.root_device()).unwrap(),
        );
        let mut b = Params::new();
        b.insert(
            "jastrow.weight".to_string(),
            Tensor::from_vec(vec![3.0f64], (1,), mesh.root_device()).unwrap(),
        );

        let view = DeviceView::from_shards(vec![a, b]);
        let reduced =
            reduce_param_trees(collective.as_ref(), &mesh, &view, ReduceOp::Mean).unwrap();
        assert_eq!(
            reduced["jastrow.weight"].to_vec1::<f64>().unwrap(),
            vec![2.0]
        );
    }
}
