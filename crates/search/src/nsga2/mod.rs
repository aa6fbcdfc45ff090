//! NSGA-II over integer decision variables.
//!
//! The engine knows nothing about quantisation: it drives any [`Problem`]
//! that maps decision vectors to objective rows `F` (minimised) and
//! inequality-constraint rows `G` (feasible when `<= 0`).

pub mod algorithm;
pub mod operators;
pub mod ranking;

use qexplore_common::Result;

pub use algorithm::{minimize, Generation, Nsga2, OptimizationResult};
pub use operators::{rounding_repair, IntegerRandomSampling, PolynomialMutation, SbxCrossover};

/// Objective and constraint rows, one per evaluated decision vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProblemOutput {
    pub f: Vec<Vec<f64>>,
    pub g: Vec<Vec<f64>>,
}

/// A minimisation problem over bounded integer vectors.
pub trait Problem {
    fn n_var(&self) -> usize;
    fn n_obj(&self) -> usize;
    fn n_ieq_constr(&self) -> usize;
    /// Inclusive `(lower, upper)` bound per variable.
    fn bounds(&self) -> (Vec<i64>, Vec<i64>);
    /// Score a whole population; row `i` of the output belongs to `x[i]`.
    fn evaluate(&mut self, x: &[Vec<i64>]) -> Result<ProblemOutput>;
}

/// An evaluated member of the population.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub x: Vec<i64>,
    pub f: Vec<f64>,
    pub g: Vec<f64>,
    /// Total constraint violation.
    pub cv: f64,
    /// Non-domination rank; `usize::MAX` for infeasible candidates.
    pub rank: usize,
    pub crowding: f64,
}

impl Candidate {
    pub fn new(x: Vec<i64>, f: Vec<f64>, g: Vec<f64>) -> Self {
        let cv = ranking::constraint_violation(&g);
        Self {
            x,
            f,
            g,
            cv,
            rank: usize::MAX,
            crowding: 0.0,
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.cv <= 0.0
    }
}
