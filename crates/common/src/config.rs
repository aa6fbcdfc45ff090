//! Workload configuration for an exploration run.
//!
//! Serialised as JSON. Optional fields carry `#[serde(default)]` values so a
//! workload only has to name the model, the datasets and the search bounds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ExplorerError, Result};

/// Smallest bit width any quantizer supports (signed symmetric grid).
pub const MIN_SUPPORTED_BITS: u32 = 2;
/// Largest bit width any quantizer supports.
pub const MAX_SUPPORTED_BITS: u32 = 16;

/// Dataset key used for calibration statistics.
pub const CALIBRATE_DATASET: &str = "calibrate";
/// Dataset key used for the full-precision baseline.
pub const BASELINE_DATASET: &str = "baseline";
/// Dataset key used to score individuals during the search.
pub const EXPLORATION_DATASET: &str = "exploration";

/// A complete exploration workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub model: ModelConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    pub exploration: ExplorationConfig,
    /// Directory for result artifacts and the run log.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

// ── Model ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identity, used in artifact file names.
    #[serde(rename = "type")]
    pub name: String,
    /// Architecture description (JSON).
    pub architecture: PathBuf,
    /// Trained weights (safetensors).
    pub weights: PathBuf,
    #[serde(default)]
    pub quantizable_layers: LayerSelector,
}

/// Which layer types take part in the exploration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSelector {
    #[default]
    Conv2d,
    Linear,
    Conv2dAndLinear,
}

// ── Datasets ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Dataset identity, used in artifact file names.
    #[serde(rename = "type")]
    pub name: String,
    /// Sample file (see [`crate::data`]).
    pub path: PathBuf,
    /// Use at most this many samples.
    #[serde(default)]
    pub sample_limit: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub selection: SampleSelection,
}

/// How `sample_limit` samples are picked from the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SampleSelection {
    /// The first `sample_limit` samples in file order.
    #[default]
    Sequential,
    /// A seeded random subset, identical for every pass.
    FixedRandom { seed: u64 },
}

// ── Calibration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Where calibration parameters are written and read.
    #[serde(default = "default_calibration_file")]
    pub file: PathBuf,
    #[serde(default)]
    pub method: CalibrationMethod,
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            file: default_calibration_file(),
            method: CalibrationMethod::default(),
            datasets: BTreeMap::new(),
        }
    }
}

/// Range estimator for activation quantizers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum CalibrationMethod {
    /// Absolute maximum seen.
    Max,
    /// Histogram of `|x|`, clipped at the given percentile (0–100).
    Percentile { percentile: f64 },
}

impl Default for CalibrationMethod {
    fn default() -> Self {
        Self::Percentile { percentile: 99.99 }
    }
}

// ── Exploration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationConfig {
    pub datasets: BTreeMap<String, DatasetConfig>,
    /// Inclusive `[lower, upper]` bit-width bounds per layer.
    pub bit_widths: [u32; 2],
    /// Accuracy floor; individuals below it are infeasible.
    pub minimum_accuracy: f64,
    /// Name of a built-in weighting function (e.g. `bits_sum`).
    pub bit_weighting_function: String,
    #[serde(default)]
    pub nsga: NsgaConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Evaluation cache entries; 0 disables the cache.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl ExplorationConfig {
    pub fn lower_bits(&self) -> u32 {
        self.bit_widths[0]
    }

    pub fn upper_bits(&self) -> u32 {
        self.bit_widths[1]
    }
}

/// NSGA-II hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsgaConfig {
    #[serde(default = "default_pop_size")]
    pub pop_size: usize,
    #[serde(default = "default_offsprings")]
    pub offsprings: usize,
    #[serde(default = "default_generations")]
    pub generations: usize,
    /// Per-variable SBX probability.
    #[serde(default = "default_crossover_prob")]
    pub crossover_prob: f64,
    #[serde(default = "default_crossover_eta")]
    pub crossover_eta: f64,
    /// Per-individual polynomial mutation probability.
    #[serde(default = "default_mutation_prob")]
    pub mutation_prob: f64,
    #[serde(default = "default_mutation_eta")]
    pub mutation_eta: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for NsgaConfig {
    fn default() -> Self {
        Self {
            pop_size: default_pop_size(),
            offsprings: default_offsprings(),
            generations: default_generations(),
            crossover_prob: default_crossover_prob(),
            crossover_eta: default_crossover_eta(),
            mutation_prob: default_mutation_prob(),
            mutation_eta: default_mutation_eta(),
            seed: default_seed(),
        }
    }
}

/// How a generation's individuals are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RunnerConfig {
    /// One individual at a time on the shared model.
    #[default]
    Sequential,
    /// A rayon pool; every worker evaluates on its own model replica.
    Parallel { num_workers: usize },
}

/// What to do when scoring one individual fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Surface the error and stop the run.
    #[default]
    Abort,
    /// Score the individual with zero accuracy and continue.
    MarkInfeasible,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}
fn default_calibration_file() -> PathBuf {
    PathBuf::from("calibration.safetensors")
}
fn default_batch_size() -> usize {
    64
}
fn default_cache_size() -> usize {
    1000
}
fn default_pop_size() -> usize {
    20
}
fn default_offsprings() -> usize {
    10
}
fn default_generations() -> usize {
    10
}
fn default_crossover_prob() -> f64 {
    0.9
}
fn default_crossover_eta() -> f64 {
    3.0
}
fn default_mutation_prob() -> f64 {
    0.9
}
fn default_mutation_eta() -> f64 {
    3.0
}
fn default_seed() -> u64 {
    1
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Workload {
    /// Load and validate a workload from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ExplorerError::config(format!("cannot read workload {}: {e}", path.display()))
        })?;
        let workload: Self = serde_json::from_str(&json)
            .map_err(|e| ExplorerError::config(format!("malformed workload {}: {e}", path.display())))?;
        workload.validate()?;
        Ok(workload)
    }

    /// Save the workload as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject values the search cannot run with.
    pub fn validate(&self) -> Result<()> {
        let ex = &self.exploration;
        let [lower, upper] = ex.bit_widths;
        if lower > upper {
            return Err(ExplorerError::config(format!(
                "bit_widths lower bound {lower} exceeds upper bound {upper}"
            )));
        }
        if lower < MIN_SUPPORTED_BITS || upper > MAX_SUPPORTED_BITS {
            return Err(ExplorerError::config(format!(
                "bit_widths [{lower}, {upper}] outside supported range \
                 [{MIN_SUPPORTED_BITS}, {MAX_SUPPORTED_BITS}]"
            )));
        }
        if !(0.0..=1.0).contains(&ex.minimum_accuracy) {
            return Err(ExplorerError::config(format!(
                "minimum_accuracy {} outside [0, 1]",
                ex.minimum_accuracy
            )));
        }
        if ex.bit_weighting_function.trim().is_empty() {
            return Err(ExplorerError::config("bit_weighting_function is empty"));
        }
        if !ex.datasets.contains_key(EXPLORATION_DATASET) {
            return Err(ExplorerError::config(format!(
                "exploration.datasets has no '{EXPLORATION_DATASET}' entry"
            )));
        }

        let nsga = &ex.nsga;
        if nsga.pop_size == 0 || nsga.offsprings == 0 || nsga.generations == 0 {
            return Err(ExplorerError::config(
                "nsga pop_size, offsprings and generations must be positive",
            ));
        }
        for (name, p) in [
            ("crossover_prob", nsga.crossover_prob),
            ("mutation_prob", nsga.mutation_prob),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ExplorerError::config(format!("nsga {name} {p} outside [0, 1]")));
            }
        }
        if nsga.crossover_eta <= 0.0 || nsga.mutation_eta <= 0.0 {
            return Err(ExplorerError::config("nsga distribution indices must be positive"));
        }
        if let RunnerConfig::Parallel { num_workers: 0 } = ex.runner {
            return Err(ExplorerError::config("parallel runner needs at least one worker"));
        }

        for (key, ds) in ex.datasets.iter().chain(self.calibration.datasets.iter()) {
            if ds.batch_size == 0 {
                return Err(ExplorerError::config(format!("dataset '{key}' has batch_size 0")));
            }
        }
        if let CalibrationMethod::Percentile { percentile } = self.calibration.method {
            if !(0.0..=100.0).contains(&percentile) || percentile == 0.0 {
                return Err(ExplorerError::config(format!(
                    "calibration percentile {percentile} outside (0, 100]"
                )));
            }
        }
        Ok(())
    }

    /// The dataset that scores individuals.
    pub fn exploration_dataset(&self) -> Result<&DatasetConfig> {
        self.exploration
            .datasets
            .get(EXPLORATION_DATASET)
            .ok_or_else(|| ExplorerError::config("no exploration dataset configured"))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "model": {
            "type": "lenet5",
            "architecture": "models/lenet5.json",
            "weights": "models/lenet5.safetensors"
        },
        "exploration": {
            "datasets": {
                "exploration": { "type": "mnist", "path": "data/mnist_val.smp", "sample_limit": 512 }
            },
            "bit_widths": [2, 8],
            "minimum_accuracy": 0.9,
            "bit_weighting_function": "bits_sum"
        }
    }"#;

    #[test]
    fn minimal_workload_fills_defaults() {
        let w: Workload = serde_json::from_str(MINIMAL).unwrap();
        w.validate().unwrap();
        assert_eq!(w.model.quantizable_layers, LayerSelector::Conv2d);
        assert_eq!(w.calibration.method, CalibrationMethod::Percentile { percentile: 99.99 });
        assert_eq!(w.exploration.nsga.seed, 1);
        assert_eq!(w.exploration.runner, RunnerConfig::Sequential);
        assert_eq!(w.exploration.on_failure, FailurePolicy::Abort);
        assert_eq!(w.exploration.cache_size, 1000);
        let ds = w.exploration_dataset().unwrap();
        assert_eq!(ds.batch_size, 64);
        assert_eq!(ds.sample_limit, Some(512));
        assert_eq!(ds.selection, SampleSelection::Sequential);
        assert_eq!(w.results_dir, PathBuf::from("results"));
    }

    #[test]
    fn tagged_enums_parse() {
        let runner: RunnerConfig =
            serde_json::from_str(r#"{ "kind": "parallel", "num_workers": 4 }"#).unwrap();
        assert_eq!(runner, RunnerConfig::Parallel { num_workers: 4 });
        let sel: SampleSelection =
            serde_json::from_str(r#"{ "kind": "fixed_random", "seed": 7 }"#).unwrap();
        assert_eq!(sel, SampleSelection::FixedRandom { seed: 7 });
        let m: CalibrationMethod = serde_json::from_str(r#"{ "method": "max" }"#).unwrap();
        assert_eq!(m, CalibrationMethod::Max);
        let p: FailurePolicy = serde_json::from_str(r#""mark_infeasible""#).unwrap();
        assert_eq!(p, FailurePolicy::MarkInfeasible);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut w: Workload = serde_json::from_str(MINIMAL).unwrap();
        w.exploration.bit_widths = [8, 4];
        assert!(matches!(w.validate(), Err(ExplorerError::Configuration(_))));
    }

    #[test]
    fn rejects_unsupported_bounds_and_accuracy() {
        let mut w: Workload = serde_json::from_str(MINIMAL).unwrap();
        w.exploration.bit_widths = [1, 8];
        assert!(w.validate().is_err());

        let mut w: Workload = serde_json::from_str(MINIMAL).unwrap();
        w.exploration.minimum_accuracy = 1.2;
        assert!(w.validate().is_err());
    }

    #[test]
    fn rejects_missing_exploration_dataset() {
        let mut w: Workload = serde_json::from_str(MINIMAL).unwrap();
        w.exploration.datasets.clear();
        assert!(w.validate().is_err());
        assert!(w.exploration_dataset().is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let mut w: Workload = serde_json::from_str(MINIMAL).unwrap();
        w.exploration.runner = RunnerConfig::Parallel { num_workers: 0 };
        assert!(w.validate().is_err());
    }

    #[test]
    fn workload_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workload.json");
        let w: Workload = serde_json::from_str(MINIMAL).unwrap();
        w.save(&path).unwrap();
        let loaded = Workload::load(&path).unwrap();
        assert_eq!(loaded.exploration.bit_widths, [2, 8]);
        assert_eq!(loaded.model.name, "lenet5");
    }

    #[test]
    fn missing_workload_is_configuration_error() {
        let err = Workload::load(Path::new("/nonexistent/workload.json")).unwrap_err();
        assert!(err.is_fatal_setup());
    }
}
