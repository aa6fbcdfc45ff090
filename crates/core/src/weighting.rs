//! Bit-weighting functions: bit-width vector → scalar compression cost.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use qexplore_common::ExplorerError;

use crate::layers::LayerKind;

/// Read-only description of a registered layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub name: String,
    pub kind: LayerKind,
    pub num_params: usize,
}

/// Maps a bit-width vector (registry order) to a cost. Lower is better.
pub trait BitWeighting: Send + Sync {
    fn cost(&self, bits: &[u32], layers: &[LayerInfo]) -> f64;
}

impl<F> BitWeighting for F
where
    F: Fn(&[u32], &[LayerInfo]) -> f64 + Send + Sync,
{
    fn cost(&self, bits: &[u32], layers: &[LayerInfo]) -> f64 {
        self(bits, layers)
    }
}

/// Built-in weighting functions, selected by name in the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingFunction {
    /// Σ bits.
    BitsSum,
    /// Σ bits / layers.
    BitsMean,
    /// max bits.
    BitsMax,
    /// Σ bits · params: model size in bits.
    ParamWeightedBits,
    /// Σ bits · params / Σ params: average bits per parameter.
    ParamWeightedMean,
}

impl WeightingFunction {
    pub const ALL: [Self; 5] = [
        Self::BitsSum,
        Self::BitsMean,
        Self::BitsMax,
        Self::ParamWeightedBits,
        Self::ParamWeightedMean,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::BitsSum => "bits_sum",
            Self::BitsMean => "bits_mean",
            Self::BitsMax => "bits_max",
            Self::ParamWeightedBits => "param_weighted_bits",
            Self::ParamWeightedMean => "param_weighted_mean",
        }
    }
}

impl BitWeighting for WeightingFunction {
    fn cost(&self, bits: &[u32], layers: &[LayerInfo]) -> f64 {
        let params = || layers.iter().map(|l| l.num_params as f64);
        match self {
            Self::BitsSum => bits.iter().map(|&b| b as f64).sum(),
            Self::BitsMean => {
                if bits.is_empty() {
                    0.0
                } else {
                    bits.iter().map(|&b| b as f64).sum::<f64>() / bits.len() as f64
                }
            }
            Self::BitsMax => bits.iter().copied().max().unwrap_or(0) as f64,
            Self::ParamWeightedBits => bits.iter().zip(params()).map(|(&b, p)| b as f64 * p).sum(),
            Self::ParamWeightedMean => {
                let total: f64 = params().sum();
                if total == 0.0 {
                    return 0.0;
                }
                bits.iter().zip(params()).map(|(&b, p)| b as f64 * p).sum::<f64>() / total
            }
        }
    }
}

impl fmt::Display for WeightingFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WeightingFunction {
    type Err = ExplorerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL.into_iter().find(|w| w.name() == s).ok_or_else(|| {
            let known: Vec<&str> = Self::ALL.iter().map(|w| w.name()).collect();
            ExplorerError::config(format!(
                "unknown bit weighting function '{s}' (known: {})",
                known.join(", ")
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers() -> Vec<LayerInfo> {
        [("conv1", 100), ("conv2", 300)]
            .into_iter()
            .map(|(n, p)| LayerInfo {
                name: n.to_string(),
                kind: LayerKind::Conv2d,
                num_params: p,
            })
            .collect()
    }

    #[test]
    fn builtin_costs() {
        let l = layers();
        let bits = [4, 8];
        assert_eq!(WeightingFunction::BitsSum.cost(&bits, &l), 12.0);
        assert_eq!(WeightingFunction::BitsMean.cost(&bits, &l), 6.0);
        assert_eq!(WeightingFunction::BitsMax.cost(&bits, &l), 8.0);
        assert_eq!(WeightingFunction::ParamWeightedBits.cost(&bits, &l), 2800.0);
        assert_eq!(WeightingFunction::ParamWeightedMean.cost(&bits, &l), 7.0);
    }

    #[test]
    fn parses_names() {
        for w in WeightingFunction::ALL {
            assert_eq!(w.name().parse::<WeightingFunction>().unwrap(), w);
        }
        let err = "bits_cubed".parse::<WeightingFunction>().unwrap_err();
        assert!(matches!(err, ExplorerError::Configuration(_)));
    }

    #[test]
    fn closures_are_weightings() {
        let squared =
            |bits: &[u32], _: &[LayerInfo]| -> f64 { bits.iter().map(|&b| (b * b) as f64).sum() };
        let w: &dyn BitWeighting = &squared;
        assert_eq!(w.cost(&[2, 3], &layers()), 13.0);
    }
}
