//! Scheduling policy: which target gets the next optimization epoch.
//!
//! Two methods. `round_robin` cycles through the targets in index order.
//! `stddev` prioritizes the noisiest (least converged) target, with a
//! round-robin warm-up so every target has non-degenerate statistics first
//! and a starvation guard so no target waits longer than `max_age` epochs.
//! Both are fully deterministic given identical metric histories.

use serde::{Deserialize, Serialize};

use crate::config::SharedOptimizationConfig;

/// Target selection method.
///
/// Parsed from configuration; an unsupported name fails at parse time with
/// an error naming the offending value.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMethod {
    #[default]
    RoundRobin,
    Stddev,
}

impl std::str::FromStr for SchedulingMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" => Ok(SchedulingMethod::RoundRobin),
            "stddev" => Ok(SchedulingMethod::Stddev),
            _ => Err(format!(
                "Unsupported scheduling method: {}. Valid options: round_robin, stddev",
                s
            )),
        }
    }
}

impl std::fmt::Display for SchedulingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingMethod::RoundRobin => write!(f, "round_robin"),
            SchedulingMethod::Stddev => write!(f, "stddev"),
        }
    }
}

/// The per-target state the policy reads: when the target was last
/// optimized and the running stddev of its latest objective samples.
#[derive(Debug, Clone, Copy)]
pub struct TargetStatus {
    pub last_epoch_optimized: usize,
    pub energy_stddev: f64,
}

/// Index of the target to optimize at epoch `n_epoch`.
///
/// The decision depends only on state from earlier epochs; there is no
/// lookahead.
pub fn select_target(
    n_epoch: usize,
    targets: &[TargetStatus],
    config: &SharedOptimizationConfig,
) -> usize {
    let n_targets = targets.len();
    match config.scheduling_method {
        SchedulingMethod::RoundRobin => n_epoch % n_targets,
        SchedulingMethod::Stddev => {
            // Warm-up: every target gets 10 round-robin updates before
            // adaptive selection starts.
            if n_epoch < n_targets * 10 {
                return n_epoch % n_targets;
            }
            // Starvation guard: any target older than max_age wins,
            // oldest first.
            let ages: Vec<usize> = targets
                .iter()
                .map(|t| n_epoch - t.last_epoch_optimized)
                .collect();
            if ages.iter().any(|&age| age > config.max_age) {
                return argmax_usize(&ages);
            }
            // Otherwise the noisiest target; non-finite stddev ranks
            // below everything so degenerate statistics are never preferred.
            let stddevs: Vec<f64> = targets
                .iter()
                .map(|t| {
                    if t.energy_stddev.is_finite() {
                        t.energy_stddev
                    } else {
                        f64::NEG_INFINITY
                    }
                })
                .collect();
            argmax_f64(&stddevs)
        }
    }
}

// Ties break to the lowest index: strict > while scanning.
fn argmax_usize(values: &[usize]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

fn argmax_f64(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}
