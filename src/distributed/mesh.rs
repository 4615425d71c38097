//! Device mesh and replicated views.
//!
//! The mesh owns the ordered set of participating compute devices (device 0
//! is the root) and provides the explicit fork-join primitive the epoch
//! loop is built on: dispatch one task per device, join all of them, then
//! reduce. There is no partial join; a failure on any device aborts the
//! whole step.

use candle_core::{Device, Result, Tensor};

use crate::params::Params;
use super::sync::DeviceConfig;

/// One logical replica of data per participating device.
///
/// Immediately after a broadcast all shards are element-wise identical;
/// after device-local computation they differ until the next reduction.
#[derive(Debug, Clone)]
pub struct DeviceView<T> {
    shards: Vec<T>,
}

impl<T> DeviceView<T> {
    pub fn from_shards(shards: Vec<T>) -> Self {
        Self { shards }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// The root device's shard (device index 0).
    pub fn root(&self) -> &T {
        &self.shards[0]
    }

    pub fn shards(&self) -> &[T] {
        &self.shards
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.shards.iter()
    }
}

/// Data that can be copied onto a device, preserving structure.
pub trait Replicate: Sized {
    fn copy_to(&self, device: &Device) -> Result<Self>;
}

impl Replicate for Tensor {
    fn copy_to(&self, device: &Device) -> Result<Self> {
        self.to_device(device)
    }
}

impl Replicate for Params {
    fn copy_to(&self, device: &Device) -> Result<Self> {
        self.iter()
            .map(|(name, t)| Ok((name.clone(), t.to_device(device)?)))
            .collect()
    }
}

/// Fixed-size pool of compute devices executing data-parallel shards.
///
/// Created once at process start; the device count is a constant for the
/// run. Mismatched shard counts anywhere downstream are fatal
/// configuration errors, never silently re-sharded.
#[derive(Debug)]
pub struct DeviceMesh {
    devices: Vec<Device>,
}

impl DeviceMesh {
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        if config.device_count == 0 {
            return Err(candle_core::Error::Msg(
                "device_count must be at least 1".to_string(),
            ));
        }
        let devices = (0..config.device_count)
            .map(Device::cuda_if_available)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { devices })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The root device (device index 0); canonical copies live here.
    pub fn root_device(&self) -> &Device {
        &self.devices[0]
    }

    fn check_view(&self, shard_count: usize) -> Result<()> {
        if shard_count != self.devices.len() {
            return Err(candle_core::Error::Msg(format!(
                "device view has {} shards but the mesh has {} devices; \
                 the device count must stay constant for the whole run",
                shard_count,
                self.devices.len()
            )));
        }
        Ok(())
    }

    /// Fork-join: run `f` once per device and join all tasks.
    ///
    /// Results come back in device order. The join is a full barrier; the
    /// first error (or panic) on any device fails the whole call.
    pub fn for_each<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize, &Device) -> Result<T> + Sync,
    {
        if self.devices.len() == 1 {
            return Ok(vec![f(0, &self.devices[0])?]);
        }
        let results: Vec<Result<T>> = std::thread::scope(|s| {
            let f = &f;
            let handles: Vec<_> = self
                .devices
                .iter()
                .enumerate()
                .map(|(idx, dev)| s.spawn(move || f(idx, dev)))
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(_) => Err(candle_core::Error::Msg(
                        "device task panicked".to_string(),
                    )),
                })
                .collect()
        });
        results.into_iter().collect()
    }

    /// Fork-join over owned per-device state.
    ///
    /// Each shard is moved into its device's task and the transformed
    /// shards are joined back in device order. Shard count must match the
    /// device count exactly.
    pub fn map_shards<S, T, F>(&self, shards: Vec<S>, f: F) -> Result<Vec<T>>
    where
        S: Send,
        T: Send,
        F: Fn(usize, &Device, S) -> Result<T> + Sync,
    {
        self.check_view(shards.len())?;
        if self.devices.len() == 1 {
            let mut iter = shards.into_iter();
            return match iter.next() {
                Some(shard) => Ok(vec![f(0, &self.devices[0], shard)?]),
                None => Err(candle_core::Error::Msg(
                    "map_shards called with no shards".to_string(),
                )),
            };
        }
        let results: Vec<Result<T>> = std::thread::scope(|s| {
            let f = &f;
            let handles: Vec<_> = self
                .devices
                .iter()
                .zip(shards)
                .enumerate()
                .map(|(idx, (dev, shard))| s.spawn(move || f(idx, dev, shard)))
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(_) => Err(candle_core::Error::Msg(
                        "device task panicked".to_string(),
                    )),
                })
                .collect()
        });
        results.into_iter().collect()
    }

    /// Tile `value` so every device holds a copy of the root data.
    ///
    /// Used once at setup to seed shared parameters and fixed data
    /// identically everywhere; after this call every shard is bit-identical
    /// to `value`.
    pub fn replicate<T: Replicate>(&self, value: &T) -> Result<DeviceView<T>> {
        let shards = self
            .devices
            .iter()
            .map(|d| value.copy_to(d))
            .collect::<Result<Vec<_>>>()?;
        Ok(DeviceView::from_shards(shards))
    }

    /// Materialize one canonical copy from the root device, discarding the
    /// rest; used for logging and checkpointing.
    pub fn to_root<T: Replicate>(&self, view: &DeviceView<T>) -> Result<T> {
        self.check_view(view.len())?;
        view.root().copy_to(self.root_device())
    }

    /// Validate that a view's shard count matches this mesh.
    pub fn check_shards(&self, shard_count: usize) -> Result<()> {
        self.check_view(shard_count)
    }
}

/// Diagnostic check that all device copies are numerically equal.
///
/// Tolerant elementwise compare, used for debugging parameter drift; the
/// main loop never depends on it.
#[allow(dead_code)]
pub fn is_consistent(view: &DeviceView<Tensor>, tol: f64) -> Result<bool> {
    if view.len() <= 1 {
        return Ok(true);
    }
    let reference = view
        .root()
        .flatten_all()?
        .to_dtype(candle_core::DType::F64)?
        .to_vec1::<f64>()?;
    for shard in view.shards().iter().skip(1) {
        let values = shard
            .flatten_all()?
            .to_dtype(candle_core::DType::F64)?
            .to_vec1::<f64>()?;
        if values.len() != reference.len() {
            return Ok(false);
        }
        for (a, b) in reference.iter().zip(values.iter()) {
            if (a - b).abs() > tol + tol * a.abs() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}
