//! CPU-based collective backend.
//!
//! Reduces device shards by staging them through CPU memory, combining
//! them there, and copying the result back out. Requires no external
//! dependencies; bandwidth-bound for large trees, which is fine at the
//! parameter counts this crate moves per epoch.

use candle_core::{Device, Result, Tensor};

use super::mesh::{DeviceMesh, DeviceView};
use super::sync::{Collective, ReduceOp};

/// Passthrough collective for single-device runs.
pub struct SingleDeviceCollective;

impl Collective for SingleDeviceCollective {
    fn reduce(
        &self,
        mesh: &DeviceMesh,
        view: &DeviceView<Tensor>,
        _op: ReduceOp,
    ) -> Result<Tensor> {
        mesh.check_shards(view.len())?;
        if view.len() != 1 {
            return Err(candle_core::Error::Msg(format!(
                "single-device collective invoked with {} shards",
                view.len()
            )));
        }
        view.root().to_device(mesh.root_device())
    }

    fn broadcast(&self, mesh: &DeviceMesh, root: &Tensor) -> Result<DeviceView<Tensor>> {
        mesh.replicate(root)
    }
}

/// CPU-staged collective.
///
/// Shards are copied to CPU, summed there, optionally divided by the
/// device count, and the canonical result lands on the root device. The
/// combine is associative and independent of which device held which
/// shard.
pub struct CpuStagingCollective;

impl Collective for CpuStagingCollective {
    fn reduce(
        &self,
        mesh: &DeviceMesh,
        view: &DeviceView<Tensor>,
        op: ReduceOp,
    ) -> Result<Tensor> {
        mesh.check_shards(view.len())?;
        let mut acc = view.root().to_device(&Device::Cpu)?;
        for shard in view.shards().iter().skip(1) {
            if shard.dims() != acc.dims() {
                return Err(candle_core::Error::Msg(format!(
                    "collective shard shape mismatch: {:?} vs {:?}",
                    shard.dims(),
                    acc.dims()
                )));
            }
            acc = acc.add(&shard.to_device(&Device::Cpu)?)?;
        }
        let combined = match op {
            ReduceOp::Sum => acc,
            ReduceOp::Mean => (acc / view.len() as f64)?,
        };
        combined.to_device(mesh.root_device())
    }

    fn broadcast(&self, mesh: &DeviceMesh, root: &Tensor) -> Result<DeviceView<Tensor>> {
        mesh.replicate(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::sync::{CollectiveBackend, DeviceConfig};

    fn mesh(n: usize) -> DeviceMesh {
        DeviceMesh::new(&DeviceConfig {
            device_count: n,
            backend: CollectiveBackend::CpuStaging,
        })
        .unwrap()
    }

    fn shard(mesh: &DeviceMesh, values: Vec<f64>) -> Tensor {
        Tensor::from_vec(values, (2,), mesh.root_device()).unwrap()
    }

    #[test]
    fn test_mean_reduce() {
        let m = mesh(4);
        let view = DeviceView::from_shards(vec![
            shard(&m, vec![1.0, 2.0]),
            shard(&m, vec![3.0, 4.0]),
            shard(&m, vec![5.0, 6.0]),
            shard(&m, vec![7.0, 8.0]),
        ]);
        let reduced = CpuStagingCollective
            .reduce(&m, &view, ReduceOp::Mean)
            .unwrap();
        assert_eq!(reduced.to_vec1::<f64>().unwrap(), vec![4.0, 5.0]);
    }

    #[test]
    fn test_sum_reduce() {
        let m = mesh(2);
        let view = DeviceView::from_shards(vec![
            shard(&m, vec![1.0, 2.0]),
            shard(&m, vec![10.0, 20.0]),
        ]);
        let reduced = CpuStagingCollective
            .reduce(&m, &view, ReduceOp::Sum)
            .unwrap();
        assert_eq!(reduced.to_vec1::<f64>().unwrap(), vec![11.0, 22.0]);
    }

    #[test]
    fn test_all_reduce_leaves_every_device_identical() {
        let m = mesh(2);
        let view = DeviceView::from_shards(vec![
            shard(&m, vec![2.0, 4.0]),
            shard(&m, vec![4.0, 8.0]),
        ]);
        let synced = CpuStagingCollective
            .all_reduce(&m, &view, ReduceOp::Mean)
            .unwrap();
        for s in synced.shards() {
            assert_eq!(s.to_vec1::<f64>().unwrap(), vec![3.0, 6.0]);
        }
    }

    #[test]
    fn test_reduce_rejects_wrong_shard_count() {
        let m = mesh(2);
        let view = DeviceView::from_shards(vec![shard(&m, vec![1.0, 2.0])]);
        assert!(CpuStagingCollective
            .reduce(&m, &view, ReduceOp::Mean)
            .is_err());
    }

    #[test]
    fn test_single_device_passthrough() {
        let m = mesh(1);
        let view = DeviceView::from_shards(vec![shard(&m, vec![1.5, -2.5])]);
        let reduced = SingleDeviceCollective
            .reduce(&m, &view, ReduceOp::Mean)
            .unwrap();
        assert_eq!(reduced.to_vec1::<f64>().unwrap(), vec![1.5, -2.5]);
    }
}
