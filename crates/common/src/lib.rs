//! # qexplore-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`Workload`]**: exploration workload (serialised as JSON).
//! * **[`ExplorerError`]**: error taxonomy and [`Result`] alias.
//! * **[`SampleDataset`]** / **[`DataLoader`]**: sample files and batching.
//! * **[`LoggingContext`]**: console and run-log setup.
//! * **[`progress_bar`]**: optional progress reporting.

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod progress;

pub use config::{
    CalibrationConfig, CalibrationMethod, DatasetConfig, ExplorationConfig, FailurePolicy,
    LayerSelector, ModelConfig, NsgaConfig, RunnerConfig, SampleSelection, Workload,
    BASELINE_DATASET, CALIBRATE_DATASET, EXPLORATION_DATASET, MAX_SUPPORTED_BITS,
    MIN_SUPPORTED_BITS,
};
pub use data::{batch_to_tensors, build_dataloaders, write_sample_file, DataLoader, SampleDataset};
pub use error::{ExplorerError, Result};
pub use logging::LoggingContext;
pub use progress::progress_bar;
