//! Core trait and types for cross-device collectives.
//!
//! This module defines the `Collective` trait that all backends must
//! implement, the tagged reduction ops, and the device-layer configuration.

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use super::mesh::{DeviceMesh, DeviceView};

/// Collective backend selection, resolved to a concrete implementation
/// once at startup.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CollectiveBackend {
    /// No cross-device traffic (single device mode)
    Single,
    /// CPU-based staging and reduction
    #[default]
    #[serde(alias = "cpu")]
    CpuStaging,
}

impl std::str::FromStr for CollectiveBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" | "none" => Ok(CollectiveBackend::Single),
            "cpu" | "cpu_staging" | "cpustaging" => Ok(CollectiveBackend::CpuStaging),
            _ => Err(format!(
                "Unknown collective backend: {}. Valid options: single, cpu",
                s
            )),
        }
    }
}

/// Reduction applied across device shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Average the shards (gradient/loss estimates)
    Mean,
    /// Sum the shards (counts, padded gathers)
    Sum,
}

/// Configuration for the device layer.
///
/// The device count is queried once at process start and treated as a
/// constant for the run; shard counts everywhere must match it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Number of participating compute devices
    #[serde(default = "default_device_count")]
    pub device_count: usize,

    /// Collective backend
    #[serde(default)]
    pub backend: CollectiveBackend,
}

fn default_device_count() -> usize {
    1
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            backend: CollectiveBackend::default(),
        }
    }
}

/// Trait for cross-device collective operations.
///
/// Implementations must be associative and device-count-invariant: each
/// device processes an independent shard of the walker batch, and the
/// reduced result must not depend on which device held which shard.
pub trait Collective: Send + Sync {
    /// Reduce a view to one canonical tensor on the root device.
    fn reduce(&self, mesh: &DeviceMesh, view: &DeviceView<Tensor>, op: ReduceOp)
        -> Result<Tensor>;

    /// Overwrite every device's copy with `root`'s data.
    ///
    /// After this call all shards are bit-identical to the root tensor.
    fn broadcast(&self, mesh: &DeviceMesh, root: &Tensor) -> Result<DeviceView<Tensor>>;

    /// Reduce, then broadcast the result back to every device.
    fn all_reduce(
        &self,
        mesh: &DeviceMesh,
        view: &DeviceView<Tensor>,
        op: ReduceOp,
    ) -> Result<DeviceView<Tensor>> {
        let reduced = self.reduce(mesh, view, op)?;
        self.broadcast(mesh, &reduced)
    }
}
