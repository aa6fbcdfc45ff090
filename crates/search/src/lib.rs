//! # qexplore-search: Bit-Width Exploration
//!
//! Searches the per-layer bit-width space of a calibrated model for the
//! Pareto front of accuracy versus bit-weighted cost.
//!
//! ```text
//! Workload ──► QuantizationExplorer ──► LayerwiseQuantizationProblem
//!                                            │ F = [-acc, cost], G = [min_acc - acc]
//!                                            ▼
//!                     nsga2::minimize ◄── PopulationRunner ◄── Evaluator (LRU)
//!                                            │
//!                                            ▼
//!                                    ExplorationResult (JSON)
//! ```

pub mod accuracy;
pub mod evaluator;
pub mod explorer;
pub mod nsga2;
pub mod problem;
pub mod results;
pub mod runner;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use accuracy::{AccuracyFunction, ClassificationAccuracy};
pub use evaluator::Evaluator;
pub use explorer::{ExplorerOptions, QuantizationExplorer};
pub use nsga2::{minimize, Nsga2, OptimizationResult, Problem, ProblemOutput};
pub use problem::LayerwiseQuantizationProblem;
pub use results::{
    collect_results, load_result, save_result, write_candidates_csv, ExplorationResult,
    ResultsCollection, RunInfo, SelectedCandidate, SelectionPolicy,
};
pub use runner::{runner_from_config, ParallelRunner, PopulationRunner, SequentialRunner};
pub use types::{BitWidthVector, Individual, ParetoPoint, Score};
