//! Per-target metric logging.
//!
//! Every wavefunction gets its own job directory under the run directory
//! (`wf000`, `wf001`, ...) holding a JSON-lines step log and its
//! checkpoints. Writes are best-effort: a failed metric write warns and
//! moves on, it never aborts the optimization.

use log::{info, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::optim::StepStats;
use crate::stats::nan_mean;

/// Job directory name for target `idx`.
pub fn idx_to_job_name(idx: usize) -> String {
    format!("wf{:03}", idx)
}

/// Create (or reuse) a job directory under `parent`.
pub fn setup_job_dir(parent: &Path, name: &str) -> std::io::Result<PathBuf> {
    let job_dir = parent.join(name);
    if job_dir.exists() {
        warn!(
            "directory {} already exists; results may be overwritten",
            job_dir.display()
        );
    } else {
        fs::create_dir_all(&job_dir)?;
    }
    Ok(job_dir)
}

/// One optimization step, flattened for the JSONL log.
#[derive(Debug)]
pub struct StepRecord<'a> {
    pub epoch: usize,
    pub n_opt_epochs: usize,
    pub stats: &'a StepStats,
    pub e_ref: Option<f64>,
    pub acceptance_rate: f64,
    pub log_psi_mean: Option<f64>,
    pub learning_rate: f64,
}

/// Logger bound to a single wavefunction.
pub struct WavefunctionLogger {
    prefix: String,
    job_dir: Option<PathBuf>,
    steps_path: Option<PathBuf>,
}

impl WavefunctionLogger {
    /// Logger writing into `run_dir/<job name>/steps.json`.
    pub fn new(run_dir: &Path, idx: usize) -> std::io::Result<Self> {
        let name = idx_to_job_name(idx);
        let job_dir = setup_job_dir(run_dir, &name)?;
        let steps_path = job_dir.join("steps.json");
        Ok(Self {
            prefix: name,
            job_dir: Some(job_dir),
            steps_path: Some(steps_path),
        })
    }

    /// Logger that keeps console output but writes no files; used by tests
    /// and dry runs.
    pub fn disabled(idx: usize) -> Self {
        Self {
            prefix: idx_to_job_name(idx),
            job_dir: None,
            steps_path: None,
        }
    }

    pub fn job_dir(&self) -> Option<&Path> {
        self.job_dir.as_deref()
    }

    pub fn on_run_begin(&self) {
        info!("[{}] run started", self.prefix);
    }

    pub fn on_run_end(&self) {
        info!("[{}] run finished", self.prefix);
    }

    /// Record run-level parameters (parameter counts, geometry, ...).
    pub fn log_params(&self, params: &serde_json::Value) {
        if let Some(ref dir) = self.job_dir {
            let path = dir.join("params.json");
            match serde_json::to_string_pretty(params) {
                Ok(text) => {
                    if let Err(e) = fs::write(&path, text) {
                        warn!("[{}] failed to write {}: {}", self.prefix, path.display(), e);
                    }
                }
                Err(e) => warn!("[{}] failed to serialize params: {}", self.prefix, e),
            }
        }
    }

    /// Append a typed metrics record to the step log.
    pub fn log_metrics(&self, metric_type: &str, metrics: &serde_json::Value) {
        let mut record = serde_json::json!({ "type": metric_type });
        if let (Some(obj), Some(extra)) = (record.as_object_mut(), metrics.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.append_line(&record);
    }

    /// Append one optimization step record.
    pub fn log_step(&self, record: &StepRecord<'_>) {
        let stats = record.stats;
        let n_clipped = stats
            .e_loc_unclipped
            .iter()
            .zip(&stats.e_loc_clipped)
            .filter(|(unclipped, clipped)| unclipped.is_finite() && unclipped != clipped)
            .count();
        let line = serde_json::json!({
            "type": "opt",
            "epoch": record.epoch,
            "n_opt_epochs": record.n_opt_epochs,
            "e_mean": stats.e_mean,
            "e_std": stats.e_std,
            "e_mean_unclipped": nan_mean(&stats.e_loc_unclipped),
            "n_clipped": n_clipped,
            "e_ref": record.e_ref,
            "grad_norm": stats.grad_norm,
            "acceptance_rate": record.acceptance_rate,
            "log_psi_mean": record.log_psi_mean,
            "learning_rate": record.learning_rate,
        });
        self.append_line(&line);
    }

    fn append_line(&self, value: &serde_json::Value) {
        if let Some(ref path) = self.steps_path {
            if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(file, "{}", value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_names_are_stable() {
        assert_eq!(idx_to_job_name(0), "wf000");
        assert_eq!(idx_to_job_name(42), "wf042");
    }

    #[test]
    fn test_disabled_logger_writes_nothing() {
        let logger = WavefunctionLogger::disabled(1);
        assert!(logger.job_dir().is_none());
        // Must not panic or create files.
        logger.on_run_begin();
        logger.log_metrics("eval", &serde_json::json!({ "e_mean": -1.0 }));
        logger.on_run_end();
    }

    #[test]
    fn test_step_log_is_json_lines() {
        let dir = std::env::temp_dir().join(format!("varmc_log_test_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let logger = WavefunctionLogger::new(&dir, 0).unwrap();
        let stats = StepStats {
            e_loc_unclipped: vec![-1.0, -1.2, f64::NAN],
            e_loc_clipped: vec![-1.0, -1.2, f64::NAN],
            e_mean: -1.1,
            e_std: 0.1,
            grad_norm: 0.5,
        };
        logger.log_step(&StepRecord {
            epoch: 3,
            n_opt_epochs: 1,
            stats: &stats,
            e_ref: Some(-1.17),
            acceptance_rate: 0.6,
            log_psi_mean: Some(-3.2),
            learning_rate: 1e-2,
        });
        logger.log_metrics("eval", &serde_json::json!({ "e_mean": -1.15 }));

        let contents =
            fs::read_to_string(dir.join("wf000").join("steps.json")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "opt");
        assert_eq!(first["epoch"], 3);
        assert!((first["e_mean"].as_f64().unwrap() + 1.1).abs() < 1e-12);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["type"], "eval");

        let _ = fs::remove_dir_all(&dir);
    }
}
