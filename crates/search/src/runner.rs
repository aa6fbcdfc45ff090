//! Population runners: sequential or a rayon pool of model replicas.
//!
//! [`run`](PopulationRunner::run) scores every individual and returns one
//! result per input vector, in input order.
//! [`run_until_error`](PopulationRunner::run_until_error) stops at the first
//! failure instead.

use indicatif::ProgressBar;
use rayon::prelude::*;
use rayon::ThreadPool;

use qexplore_common::{progress_bar, ExplorerError, Result, RunnerConfig};
use qexplore_core::QuantizedModel;

use crate::evaluator::Evaluator;
use crate::types::{BitWidthVector, Score};

/// A failed evaluation and the population index it belongs to.
#[derive(Debug)]
pub struct Failure {
    pub index: usize,
    pub error: ExplorerError,
}

pub trait PopulationRunner: Send + Sync {
    fn run(
        &self,
        evaluator: &Evaluator,
        model: &mut QuantizedModel,
        population: &[BitWidthVector],
    ) -> Vec<Result<Score>>;

    /// Scores in input order, or the first failure seen. No new evaluation
    /// starts once a failure is observed.
    fn run_until_error(
        &self,
        evaluator: &Evaluator,
        model: &mut QuantizedModel,
        population: &[BitWidthVector],
    ) -> std::result::Result<Vec<Score>, Failure>;

    fn name(&self) -> &'static str;
}

fn individuals_bar(len: usize, visible: bool) -> ProgressBar {
    progress_bar(len as u64, "individuals", visible).unwrap_or_else(|_| ProgressBar::hidden())
}

/// Evaluates individuals one after another on the shared model.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialRunner {
    pub progress: bool,
}

impl PopulationRunner for SequentialRunner {
    fn run(
        &self,
        evaluator: &Evaluator,
        model: &mut QuantizedModel,
        population: &[BitWidthVector],
    ) -> Vec<Result<Score>> {
        let pb = individuals_bar(population.len(), self.progress);
        let scores = population
            .iter()
            .enumerate()
            .map(|(i, bits)| {
                let score = evaluator.evaluate(i, bits, model);
                pb.inc(1);
                score
            })
            .collect();
        pb.finish_and_clear();
        scores
    }

    fn run_until_error(
        &self,
        evaluator: &Evaluator,
        model: &mut QuantizedModel,
        population: &[BitWidthVector],
    ) -> std::result::Result<Vec<Score>, Failure> {
        let pb = individuals_bar(population.len(), self.progress);
        let scores = population
            .iter()
            .enumerate()
            .map(|(index, bits)| {
                let score = evaluator
                    .evaluate(index, bits, model)
                    .map_err(|error| Failure { index, error });
                pb.inc(1);
                score
            })
            .collect();
        pb.finish_and_clear();
        scores
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

/// Evaluates individuals concurrently. Each worker owns a replica of the
/// model, so no two evaluations share quantiser state.
pub struct ParallelRunner {
    pool: ThreadPool,
    num_workers: usize,
    progress: bool,
}

impl ParallelRunner {
    pub fn new(num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(ExplorerError::config("parallel runner needs at least one worker"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("qexplore-eval-{i}"))
            .build()
            .map_err(|e| ExplorerError::config(format!("thread pool: {e}")))?;
        Ok(Self {
            pool,
            num_workers,
            progress: false,
        })
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }
}

impl PopulationRunner for ParallelRunner {
    fn run(
        &self,
        evaluator: &Evaluator,
        model: &mut QuantizedModel,
        population: &[BitWidthVector],
    ) -> Vec<Result<Score>> {
        let base: &QuantizedModel = model;
        let pb = individuals_bar(population.len(), self.progress);
        let scores = self.pool.install(|| {
            population
                .par_iter()
                .enumerate()
                .map_init(
                    || base.replicate(),
                    |replica, (i, bits)| {
                        let score = evaluator.evaluate(i, bits, replica);
                        pb.inc(1);
                        score
                    },
                )
                .collect()
        });
        pb.finish_and_clear();
        scores
    }

    fn run_until_error(
        &self,
        evaluator: &Evaluator,
        model: &mut QuantizedModel,
        population: &[BitWidthVector],
    ) -> std::result::Result<Vec<Score>, Failure> {
        let base: &QuantizedModel = model;
        let pb = individuals_bar(population.len(), self.progress);
        // rayon stops handing out items once an `Err` is collected.
        let scores = self.pool.install(|| {
            population
                .par_iter()
                .enumerate()
                .map_init(
                    || base.replicate(),
                    |replica, (index, bits)| {
                        let score = evaluator
                            .evaluate(index, bits, replica)
                            .map_err(|error| Failure { index, error });
                        pb.inc(1);
                        score
                    },
                )
                .collect()
        });
        pb.finish_and_clear();
        scores
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}

pub fn runner_from_config(cfg: RunnerConfig, progress: bool) -> Result<Box<dyn PopulationRunner>> {
    Ok(match cfg {
        RunnerConfig::Sequential => Box::new(SequentialRunner { progress }),
        RunnerConfig::Parallel { num_workers } => {
            Box::new(ParallelRunner::new(num_workers)?.with_progress(progress))
        }
    })
}
