//! Layer-wise quantisation as a constrained two-objective problem.
//!
//! Objectives (both minimised): `[-accuracy, bit-weighted cost]`.
//! Constraint: `minimum_accuracy - accuracy <= 0`.

use qexplore_common::{ExplorerError, FailurePolicy, Result};
use qexplore_core::QuantizedModel;

use crate::evaluator::Evaluator;
use crate::nsga2::{Problem, ProblemOutput};
use crate::runner::{Failure, PopulationRunner};
use crate::types::{BitWidthVector, Score};

pub struct LayerwiseQuantizationProblem {
    model: QuantizedModel,
    evaluator: Evaluator,
    runner: Box<dyn PopulationRunner>,
    lower: u32,
    upper: u32,
    minimum_accuracy: f64,
    on_failure: FailurePolicy,
}

impl LayerwiseQuantizationProblem {
    pub fn new(
        model: QuantizedModel,
        evaluator: Evaluator,
        runner: Box<dyn PopulationRunner>,
        bit_widths: [u32; 2],
        minimum_accuracy: f64,
    ) -> Result<Self> {
        let [lower, upper] = bit_widths;
        if lower > upper {
            return Err(ExplorerError::config(format!(
                "bit width bounds [{lower}, {upper}] are inverted"
            )));
        }
        let (min, max) = model.bit_limits();
        if lower < min || upper > max {
            return Err(ExplorerError::config(format!(
                "bit width bounds [{lower}, {upper}] exceed the supported range [{min}, {max}]"
            )));
        }
        let model = model.with_bit_limits(lower, upper);
        Ok(Self {
            model,
            evaluator,
            runner,
            lower,
            upper,
            minimum_accuracy,
            on_failure: FailurePolicy::default(),
        })
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn model(&self) -> &QuantizedModel {
        &self.model
    }

    pub fn into_model(self) -> QuantizedModel {
        self.model
    }

    fn to_bit_widths(&self, x: &[i64]) -> Result<BitWidthVector> {
        let n = self.model.num_layers();
        let invalid = |reason: &'static str| {
            Err(ExplorerError::InvalidBitWidths {
                reason,
                got: x.iter().map(|&v| v.clamp(0, u32::MAX as i64) as u32).collect(),
                expected: n,
                min: self.lower,
                max: self.upper,
            })
        };
        if x.len() != n {
            return invalid("length does not match the number of quantizable layers");
        }
        match BitWidthVector::from_decision(x) {
            Some(bits) if bits.0.iter().all(|&b| (self.lower..=self.upper).contains(&b)) => {
                Ok(bits)
            }
            _ => invalid("value out of range"),
        }
    }

    /// Replace a failed evaluation by accuracy 0 at the real cost.
    fn mark_infeasible(&self, index: usize, bits: &BitWidthVector, result: Result<Score>) -> Result<Score> {
        match result {
            Ok(score) => Ok(score),
            Err(e) if e.is_fatal_setup() => Err(e),
            Err(e) => {
                tracing::warn!(index, bits = %bits, error = %e, "evaluation failed; marking infeasible");
                Ok(Score {
                    accuracy: 0.0,
                    cost: self.model.bit_weighted_cost(bits.as_slice()),
                })
            }
        }
    }

    fn score_population(&mut self, population: &[BitWidthVector]) -> Result<Vec<Score>> {
        match self.on_failure {
            FailurePolicy::Abort => self
                .runner
                .run_until_error(&self.evaluator, &mut self.model, population)
                .map_err(|Failure { index, error }| {
                    if error.is_fatal_setup() {
                        error
                    } else {
                        ExplorerError::Evaluation {
                            index,
                            source: Box::new(error),
                        }
                    }
                }),
            FailurePolicy::MarkInfeasible => {
                let results = self.runner.run(&self.evaluator, &mut self.model, population);
                population
                    .iter()
                    .zip(results)
                    .enumerate()
                    .map(|(index, (bits, result))| self.mark_infeasible(index, bits, result))
                    .collect()
            }
        }
    }
}

impl Problem for LayerwiseQuantizationProblem {
    fn n_var(&self) -> usize {
        self.model.num_layers()
    }

    fn n_obj(&self) -> usize {
        2
    }

    fn n_ieq_constr(&self) -> usize {
        1
    }

    fn bounds(&self) -> (Vec<i64>, Vec<i64>) {
        let n = self.n_var();
        (vec![self.lower as i64; n], vec![self.upper as i64; n])
    }

    fn evaluate(&mut self, x: &[Vec<i64>]) -> Result<ProblemOutput> {
        let population = x
            .iter()
            .map(|row| self.to_bit_widths(row))
            .collect::<Result<Vec<_>>>()?;

        let scores = self.score_population(&population)?;

        let mut out = ProblemOutput {
            f: Vec::with_capacity(population.len()),
            g: Vec::with_capacity(population.len()),
        };
        for score in scores {
            out.f.push(score.objectives().to_vec());
            out.g.push(vec![self.minimum_accuracy - score.accuracy]);
        }
        tracing::debug!(
            individuals = population.len(),
            runner = self.runner.name(),
            "population evaluated"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accuracy::ClassificationAccuracy;
    use crate::nsga2::{minimize, Nsga2};
    use crate::runner::{ParallelRunner, SequentialRunner};
    use crate::test_support::{calibrated_model, loader};
    use qexplore_common::{DataLoader, NsgaConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn constant(acc: f64) -> Evaluator {
        Evaluator::new(
            loader(),
            Arc::new(move |_: &QuantizedModel, _: &DataLoader| -> Result<f64> { Ok(acc) }),
            0,
        )
    }

    fn problem(evaluator: Evaluator, min_acc: f64) -> LayerwiseQuantizationProblem {
        LayerwiseQuantizationProblem::new(
            calibrated_model(3),
            evaluator,
            Box::new(SequentialRunner::default()),
            [4, 8],
            min_acc,
        )
        .unwrap()
    }

    #[test]
    fn objectives_and_constraint() {
        let mut p = problem(constant(0.9), 0.8);
        assert_eq!(p.n_var(), 3);
        assert_eq!(p.bounds(), (vec![4; 3], vec![8; 3]));
        let out = p
            .evaluate(&[vec![4, 4, 4], vec![8, 8, 8], vec![6, 6, 6]])
            .unwrap();
        assert_eq!(
            out.f,
            vec![vec![-0.9, 12.0], vec![-0.9, 24.0], vec![-0.9, 18.0]]
        );
        for g in &out.g {
            assert!((g[0] + 0.1).abs() < 1e-9);
        }
    }

    #[test]
    fn shortfall_is_positive_violation() {
        let mut p = problem(constant(0.65), 0.70);
        let out = p.evaluate(&[vec![6, 6, 6]]).unwrap();
        assert!((out.g[0][0] - 0.05).abs() < 1e-9);
    }

    #[test]
    fn out_of_bounds_row_is_fatal() {
        let mut p = problem(constant(0.9), 0.8);
        let err = p.evaluate(&[vec![4, 4, 4], vec![9, 4, 4]]).unwrap_err();
        assert!(matches!(err, ExplorerError::InvalidBitWidths { .. }));
        let err = p.evaluate(&[vec![4, 4]]).unwrap_err();
        assert!(err.is_fatal_setup());
    }

    #[test]
    fn inverted_or_unsupported_bounds_rejected() {
        let build = |bounds| {
            LayerwiseQuantizationProblem::new(
                calibrated_model(2),
                constant(0.5),
                Box::new(SequentialRunner::default()),
                bounds,
                0.1,
            )
        };
        assert!(build([8, 4]).is_err());
        assert!(build([1, 8]).is_err());
        assert!(build([4, 17]).is_err());
        assert!(build([5, 5]).is_ok());
    }

    fn failing() -> Evaluator {
        Evaluator::new(
            loader(),
            Arc::new(|m: &QuantizedModel, _: &DataLoader| -> Result<f64> {
                if m.layer_bit_widths()[0] == 4 {
                    Err(ExplorerError::Dataset("corrupt batch".into()))
                } else {
                    Ok(0.9)
                }
            }),
            0,
        )
    }

    #[test]
    fn abort_policy_surfaces_index() {
        let mut p = problem(failing(), 0.5);
        let err = p.evaluate(&[vec![8, 8, 8], vec![4, 8, 8]]).unwrap_err();
        match err {
            ExplorerError::Evaluation { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn mark_infeasible_policy_continues() {
        let mut p = problem(failing(), 0.5).with_failure_policy(FailurePolicy::MarkInfeasible);
        let out = p.evaluate(&[vec![8, 8, 8], vec![4, 8, 8]]).unwrap();
        assert_eq!(out.f[0], vec![-0.9, 24.0]);
        assert_eq!(out.f[1], vec![-0.0, 20.0]);
        assert!((out.g[1][0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn parallel_runner_gives_same_rows() {
        let rows = vec![vec![4, 5, 6], vec![8, 8, 8], vec![4, 4, 4], vec![7, 5, 4]];
        let base = calibrated_model(3);
        let twin = base.replicate();
        let mut seq = LayerwiseQuantizationProblem::new(
            base,
            Evaluator::new(loader(), Arc::new(ClassificationAccuracy::default()), 0),
            Box::new(SequentialRunner::default()),
            [4, 8],
            0.0,
        )
        .unwrap();
        let mut par = LayerwiseQuantizationProblem::new(
            twin,
            Evaluator::new(loader(), Arc::new(ClassificationAccuracy::default()), 0),
            Box::new(ParallelRunner::new(2).unwrap()),
            [4, 8],
            0.0,
        )
        .unwrap();
        for _ in 0..5 {
            let a = seq.evaluate(&rows).unwrap();
            let b = par.evaluate(&rows).unwrap();
            assert_eq!(a.f, b.f);
            assert_eq!(a.g, b.g);
        }
    }

    #[test]
    fn abort_policy_stops_evaluating() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let evaluator = Evaluator::new(
            loader(),
            Arc::new(move |_: &QuantizedModel, _: &DataLoader| -> Result<f64> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExplorerError::Dataset("unreadable batch".into()))
            }),
            0,
        );
        let mut p = problem(evaluator, 0.5);
        let rows: Vec<Vec<i64>> = (0..10).map(|i| vec![4, 4, 4 + i % 5]).collect();
        let err = p.evaluate(&rows).unwrap_err();
        assert!(matches!(err, ExplorerError::Evaluation { index: 0, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn small_search_finds_feasible_front() {
        // Accuracy grows with total bits; the front trades it against cost.
        let evaluator = Evaluator::new(
            loader(),
            Arc::new(|m: &QuantizedModel, _: &DataLoader| -> Result<f64> {
                let total: u32 = m.layer_bit_widths().iter().sum();
                Ok(total as f64 / 24.0)
            }),
            100,
        );
        let mut p = problem(evaluator, 0.6);
        let cfg = NsgaConfig {
            pop_size: 8,
            offsprings: 4,
            generations: 4,
            ..NsgaConfig::default()
        };
        let res = minimize(&mut p, &Nsga2::from_config(&cfg), cfg.generations, cfg.seed, true).unwrap();
        let f = res.f().expect("feasible solutions");
        for row in f {
            assert!(-row[0] >= 0.6);
        }
        assert_eq!(res.history.len(), res.n_gen);
    }
}
