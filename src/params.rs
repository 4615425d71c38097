//! Parameter tree partitioning for shared optimization.
//!
//! Trainable parameters live in a flat map keyed by dotted module paths
//! (`envelope.exponents`, `jastrow.weight`). Shared optimization splits that
//! tree into the subset common to all wavefunctions and the per-geometry
//! remainder, and merges them back before every optimizer step.
//!
//! The module patterns are compiled into a single alternation regex once,
//! when the configuration is loaded - never inside the epoch loop.

use candle_core::{Result, Tensor};
use regex::Regex;
use std::collections::BTreeMap;

/// A named parameter tree. BTreeMap keeps leaf iteration order stable so
/// serialization and device transfers are deterministic.
pub type Params = BTreeMap<String, Tensor>;

/// Classifies parameter leaves as shared vs. unique by module-path pattern.
#[derive(Debug, Clone)]
pub struct ParamPartition {
    patterns: Vec<String>,
    regex: Regex,
}

impl ParamPartition {
    /// Compile an ordered list of module-name patterns into one alternation.
    ///
    /// A leaf whose dotted path matches any pattern is classified as shared.
    /// Invalid patterns are configuration errors and abort the run.
    pub fn compile(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(candle_core::Error::Msg(
                "shared_modules is empty: shared optimization needs at least one module pattern"
                    .to_string(),
            ));
        }
        let alternation = format!("({})", patterns.join("|"));
        let regex = Regex::new(&alternation).map_err(|e| {
            candle_core::Error::Msg(format!(
                "invalid shared_modules pattern {:?}: {}",
                alternation, e
            ))
        })?;
        Ok(Self {
            patterns: patterns.to_vec(),
            regex,
        })
    }

    /// The patterns this partition was compiled from.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Split `params` into (shared, unique) by path match.
    ///
    /// Deterministic for identical inputs; the union of the two maps is
    /// always the full input tree.
    pub fn split(&self, params: &Params) -> (Params, Params) {
        let mut shared = Params::new();
        let mut unique = Params::new();
        for (name, tensor) in params {
            if self.regex.is_match(name) {
                shared.insert(name.clone(), tensor.clone());
            } else {
                unique.insert(name.clone(), tensor.clone());
            }
        }
        (shared, unique)
    }

    /// Number of leaves of `params` the pattern set matches.
    ///
    /// A pattern matching zero leaves is a silent configuration bug
    /// upstream; callers should assert this is non-zero after model init.
    pub fn matched_leaf_count(&self, params: &Params) -> usize {
        params.keys().filter(|name| self.regex.is_match(name)).count()
    }
}

/// Disjoint union of two partitions of a parameter tree.
///
/// A key present in both maps means the shared and unique sets overlap,
/// which would let one side silently shadow the other - raised as a
/// configuration error instead, naming the first offending key.
pub fn merge(a: &Params, b: &Params) -> Result<Params> {
    let mut merged = a.clone();
    for (name, tensor) in b {
        if merged.insert(name.clone(), tensor.clone()).is_some() {
            return Err(candle_core::Error::Msg(format!(
                "parameter {:?} is present in both partitions; shared and unique sets must be disjoint",
                name
            )));
        }
    }
    Ok(merged)
}

/// Total number of scalar parameters in the tree.
pub fn param_count(params: &Params) -> usize {
    params.values().map(|t| t.elem_count()).sum()
}

/// True when both trees hold the same leaves with identical shapes.
///
/// The optimizer state is keyed to the merged parameter structure; every
/// target must produce the same structure for the whole run.
pub fn same_structure(a: &Params, b: &Params) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|((ka, ta), (kb, tb))| ka == kb && ta.dims() == tb.dims())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sample_params() -> Params {
        let dev = Device::Cpu;
        let mut p = Params::new();
        p.insert(
            "envelope.exponents".to_string(),
            Tensor::from_vec(vec![1.0f64, 2.0], (2,), &dev).unwrap(),
        );
        p.insert(
            "jastrow.weight".to_string(),
            Tensor::from_vec(vec![0.5f64], (1,), &dev).unwrap(),
        );
        p.insert(
            "jastrow.scale".to_string(),
            Tensor::from_vec(vec![1.5f64], (1,), &dev).unwrap(),
        );
        p
    }

    fn leaf_values(p: &Params) -> Vec<(String, Vec<f64>)> {
        p.iter()
            .map(|(k, t)| (k.clone(), t.flatten_all().unwrap().to_vec1::<f64>().unwrap()))
            .collect()
    }

    #[test]
    fn test_split_merge_round_trip() {
        let params = sample_params();
        let partition = ParamPartition::compile(&["jastrow".to_string()]).unwrap();
        let (shared, unique) = partition.split(&params);
        assert_eq!(shared.len(), 2);
        assert_eq!(unique.len(), 1);
        let merged = merge(&shared, &unique).unwrap();
        assert_eq!(leaf_values(&merged), leaf_values(&params));
    }

    #[test]
    fn test_split_is_idempotent_on_shared() {
        let params = sample_params();
        let partition = ParamPartition::compile(&["jastrow".to_string()]).unwrap();
        let (shared, _) = partition.split(&params);
        let (shared_again, leftover) = partition.split(&shared);
        assert_eq!(leftover.len(), 0);
        assert_eq!(leaf_values(&shared_again), leaf_values(&shared));
    }

    #[test]
    fn test_merge_overlap_is_an_error() {
        let params = sample_params();
        let err = merge(&params, &params).unwrap_err();
        assert!(err.to_string().contains("both partitions"));
    }

    #[test]
    fn test_matched_leaf_count() {
        let params = sample_params();
        let partition = ParamPartition::compile(&["jastrow".to_string()]).unwrap();
        assert_eq!(partition.matched_leaf_count(&params), 2);
        let none = ParamPartition::compile(&["backflow".to_string()]).unwrap();
        assert_eq!(none.matched_leaf_count(&params), 0);
    }

    #[test]
    fn test_empty_pattern_list_rejected() {
        assert!(ParamPartition::compile(&[]).is_err());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(ParamPartition::compile(&["jastrow(".to_string()]).is_err());
    }

    #[test]
    fn test_same_structure() {
        let a = sample_params();
        let b = sample_params();
        assert!(same_structure(&a, &b));
        let mut c = sample_params();
        c.remove("jastrow.scale");
        assert!(!same_structure(&a, &c));
    }
}
