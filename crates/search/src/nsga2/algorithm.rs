//! Generation loop.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use qexplore_common::{ExplorerError, NsgaConfig, Result};

use super::operators::{rounding_repair, IntegerRandomSampling, PolynomialMutation, SbxCrossover};
use super::ranking::{binary_tournament, rank_and_crowding_survival};
use super::{Candidate, Problem};

/// Mating rounds per generation spent trying to find unique offspring.
const MAX_MATING_ITERATIONS: usize = 100;

/// NSGA-II configuration.
#[derive(Debug, Clone)]
pub struct Nsga2 {
    pub pop_size: usize,
    pub n_offsprings: usize,
    pub sampling: IntegerRandomSampling,
    pub crossover: SbxCrossover,
    pub mutation: PolynomialMutation,
    /// Drop offspring already present in the population or the offspring.
    pub eliminate_duplicates: bool,
}

impl Nsga2 {
    pub fn from_config(cfg: &NsgaConfig) -> Self {
        Self {
            pop_size: cfg.pop_size,
            n_offsprings: cfg.offsprings,
            sampling: IntegerRandomSampling,
            crossover: SbxCrossover::new(cfg.crossover_prob, cfg.crossover_eta),
            mutation: PolynomialMutation::new(cfg.mutation_prob, cfg.mutation_eta),
            eliminate_duplicates: true,
        }
    }
}

/// Snapshot after one generation.
#[derive(Debug, Clone)]
pub struct Generation {
    /// 1-based generation number.
    pub n_gen: usize,
    /// Evaluations so far.
    pub n_evals: usize,
    /// Survivors.
    pub pop: Vec<Candidate>,
    /// Individuals evaluated in this generation (the initial population in
    /// generation 1).
    pub off: Vec<Candidate>,
}

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Final population.
    pub pop: Vec<Candidate>,
    /// Feasible non-dominated members of the final population.
    pub opt: Vec<Candidate>,
    pub history: Vec<Generation>,
    pub n_gen: usize,
    pub n_evals: usize,
    pub exec_time: Duration,
}

impl OptimizationResult {
    /// Objective rows of the optimum; `None` if nothing was feasible.
    pub fn f(&self) -> Option<Vec<Vec<f64>>> {
        if self.opt.is_empty() {
            None
        } else {
            Some(self.opt.iter().map(|c| c.f.clone()).collect())
        }
    }

    pub fn x(&self) -> Vec<Vec<i64>> {
        self.opt.iter().map(|c| c.x.clone()).collect()
    }
}

/// Run NSGA-II for `n_gen` generations. Deterministic for a fixed `seed`
/// as long as the problem is.
pub fn minimize<P: Problem + ?Sized>(
    problem: &mut P,
    algorithm: &Nsga2,
    n_gen: usize,
    seed: u64,
    save_history: bool,
) -> Result<OptimizationResult> {
    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(seed);
    let (xl, xu) = problem.bounds();
    if xl.len() != problem.n_var() || xu.len() != problem.n_var() {
        return Err(ExplorerError::config("bounds do not match the number of variables"));
    }
    if algorithm.pop_size == 0 {
        return Err(ExplorerError::config("population size must be positive"));
    }

    let mut history = Vec::new();
    let mut seen: HashSet<Vec<i64>> = HashSet::new();

    // Initial population.
    let mut initial = Vec::with_capacity(algorithm.pop_size);
    let mut attempts = 0;
    while initial.len() < algorithm.pop_size && attempts < MAX_MATING_ITERATIONS {
        for x in algorithm
            .sampling
            .sample(algorithm.pop_size - initial.len(), &xl, &xu, &mut rng)
        {
            if !algorithm.eliminate_duplicates || seen.insert(x.clone()) {
                initial.push(x);
            }
        }
        attempts += 1;
    }
    let off = evaluate(problem, initial)?;
    let mut n_evals = off.len();
    let mut pop = rank_and_crowding_survival(off.clone(), algorithm.pop_size);
    log_generation(1, n_evals, &pop);
    if save_history {
        history.push(Generation {
            n_gen: 1,
            n_evals,
            pop: pop.clone(),
            off,
        });
    }

    let mut last_gen = 1;
    for gen in 2..=n_gen {
        let offspring = mate(algorithm, &pop, &xl, &xu, &mut rng);
        if offspring.is_empty() {
            tracing::warn!(generation = gen, "no new offspring could be generated; stopping");
            break;
        }
        let off = evaluate(problem, offspring)?;
        n_evals += off.len();
        let mut merged = pop;
        merged.extend(off.iter().cloned());
        pop = rank_and_crowding_survival(merged, algorithm.pop_size);
        log_generation(gen, n_evals, &pop);
        if save_history {
            history.push(Generation {
                n_gen: gen,
                n_evals,
                pop: pop.clone(),
                off,
            });
        }
        last_gen = gen;
    }

    let opt: Vec<Candidate> = pop
        .iter()
        .filter(|c| c.is_feasible() && c.rank == 0)
        .cloned()
        .collect();
    Ok(OptimizationResult {
        pop,
        opt,
        history,
        n_gen: last_gen,
        n_evals,
        exec_time: start.elapsed(),
    })
}

fn evaluate<P: Problem + ?Sized>(problem: &mut P, x: Vec<Vec<i64>>) -> Result<Vec<Candidate>> {
    let out = problem.evaluate(&x)?;
    if out.f.len() != x.len() || out.g.len() != x.len() {
        return Err(ExplorerError::config(format!(
            "problem returned {} objective and {} constraint rows for {} individuals",
            out.f.len(),
            out.g.len(),
            x.len()
        )));
    }
    let (n_obj, n_constr) = (problem.n_obj(), problem.n_ieq_constr());
    x.into_iter()
        .zip(out.f.into_iter().zip(out.g))
        .map(|(x, (f, g))| {
            if f.len() != n_obj || g.len() != n_constr {
                return Err(ExplorerError::config("problem returned a malformed row"));
            }
            Ok(Candidate::new(x, f, g))
        })
        .collect()
}

/// Tournament selection, SBX, polynomial mutation and rounding repair until
/// `n_offsprings` unique children exist or the mating budget runs out.
fn mate(
    algorithm: &Nsga2,
    pop: &[Candidate],
    xl: &[i64],
    xu: &[i64],
    rng: &mut StdRng,
) -> Vec<Vec<i64>> {
    let mut known: HashSet<Vec<i64>> = pop.iter().map(|c| c.x.clone()).collect();
    let mut offspring = Vec::with_capacity(algorithm.n_offsprings);
    for _ in 0..MAX_MATING_ITERATIONS {
        while offspring.len() < algorithm.n_offsprings {
            let p1 = &pop[binary_tournament(pop, rng)];
            let p2 = &pop[binary_tournament(pop, rng)];
            let to_f64 = |x: &[i64]| x.iter().map(|&v| v as f64).collect::<Vec<_>>();
            let (mut c1, mut c2) = algorithm
                .crossover
                .cross(&to_f64(&p1.x), &to_f64(&p2.x), xl, xu, rng);
            algorithm.mutation.mutate(&mut c1, xl, xu, rng);
            algorithm.mutation.mutate(&mut c2, xl, xu, rng);
            let mut produced = false;
            for child in [c1, c2] {
                if offspring.len() >= algorithm.n_offsprings {
                    break;
                }
                let child = rounding_repair(&child, xl, xu);
                if !algorithm.eliminate_duplicates || known.insert(child.clone()) {
                    offspring.push(child);
                    produced = true;
                }
            }
            if !produced {
                break;
            }
        }
        if offspring.len() >= algorithm.n_offsprings {
            break;
        }
    }
    offspring
}

fn log_generation(gen: usize, n_evals: usize, pop: &[Candidate]) {
    let n_nds = pop.iter().filter(|c| c.is_feasible() && c.rank == 0).count();
    let cv_min = pop.iter().map(|c| c.cv).fold(f64::INFINITY, f64::min);
    let cv_avg = pop.iter().map(|c| c.cv).sum::<f64>() / pop.len().max(1) as f64;
    tracing::info!(
        generation = gen,
        n_evals,
        n_nds,
        cv_min,
        cv_avg,
        "generation finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nsga2::ProblemOutput;

    /// Two conflicting objectives over integer vectors with a sum floor.
    struct Toy {
        evaluations: Vec<Vec<i64>>,
    }

    impl Problem for Toy {
        fn n_var(&self) -> usize {
            3
        }
        fn n_obj(&self) -> usize {
            2
        }
        fn n_ieq_constr(&self) -> usize {
            1
        }
        fn bounds(&self) -> (Vec<i64>, Vec<i64>) {
            (vec![2; 3], vec![8; 3])
        }
        fn evaluate(&mut self, x: &[Vec<i64>]) -> Result<ProblemOutput> {
            let mut out = ProblemOutput::default();
            for row in x {
                self.evaluations.push(row.clone());
                let sum: i64 = row.iter().sum();
                let quality = 1.0 - 1.0 / sum as f64;
                out.f.push(vec![-quality, sum as f64]);
                out.g.push(vec![10.0 - sum as f64]);
            }
            Ok(out)
        }
    }

    fn algorithm() -> Nsga2 {
        Nsga2::from_config(&NsgaConfig {
            pop_size: 8,
            offsprings: 4,
            generations: 5,
            ..NsgaConfig::default()
        })
    }

    #[test]
    fn same_seed_same_run() {
        let mut a = Toy { evaluations: Vec::new() };
        let mut b = Toy { evaluations: Vec::new() };
        let ra = minimize(&mut a, &algorithm(), 5, 1, true).unwrap();
        let rb = minimize(&mut b, &algorithm(), 5, 1, true).unwrap();
        assert_eq!(a.evaluations, b.evaluations);
        assert_eq!(ra.x(), rb.x());
        assert_eq!(ra.history.len(), 5);
        assert_eq!(ra.n_evals, a.evaluations.len());
    }

    #[test]
    fn offspring_in_bounds_and_new() {
        let mut p = Toy { evaluations: Vec::new() };
        let res = minimize(&mut p, &algorithm(), 6, 3, true).unwrap();
        assert!(p.evaluations.iter().flatten().all(|&v| (2..=8).contains(&v)));
        for pair in res.history.windows(2) {
            let previous: HashSet<&Vec<i64>> = pair[0].pop.iter().map(|c| &c.x).collect();
            let off: HashSet<&Vec<i64>> = pair[1].off.iter().map(|c| &c.x).collect();
            assert_eq!(off.len(), pair[1].off.len());
            assert!(off.is_disjoint(&previous));
        }
    }

    #[test]
    fn optimum_is_feasible_front() {
        let mut p = Toy { evaluations: Vec::new() };
        let res = minimize(&mut p, &algorithm(), 5, 1, true).unwrap();
        let f = res.f().unwrap();
        assert!(!f.is_empty());
        assert!(res.opt.iter().all(|c| c.g[0] <= 0.0));
        assert_eq!(res.pop.len(), 8);
    }

    #[test]
    fn all_infeasible_has_no_optimum() {
        struct Impossible;
        impl Problem for Impossible {
            fn n_var(&self) -> usize {
                2
            }
            fn n_obj(&self) -> usize {
                2
            }
            fn n_ieq_constr(&self) -> usize {
                1
            }
            fn bounds(&self) -> (Vec<i64>, Vec<i64>) {
                (vec![2, 2], vec![4, 4])
            }
            fn evaluate(&mut self, x: &[Vec<i64>]) -> Result<ProblemOutput> {
                Ok(ProblemOutput {
                    f: x.iter().map(|r| vec![0.0, r[0] as f64]).collect(),
                    g: x.iter().map(|_| vec![1.0]).collect(),
                })
            }
        }
        let res = minimize(&mut Impossible, &algorithm(), 3, 1, false).unwrap();
        assert!(res.f().is_none());
        assert!(res.history.is_empty());
    }

    #[test]
    fn errors_propagate() {
        struct Failing;
        impl Problem for Failing {
            fn n_var(&self) -> usize {
                1
            }
            fn n_obj(&self) -> usize {
                2
            }
            fn n_ieq_constr(&self) -> usize {
                1
            }
            fn bounds(&self) -> (Vec<i64>, Vec<i64>) {
                (vec![2], vec![8])
            }
            fn evaluate(&mut self, _: &[Vec<i64>]) -> Result<ProblemOutput> {
                Err(ExplorerError::InvalidAccuracy(2.0))
            }
        }
        assert!(minimize(&mut Failing, &algorithm(), 2, 1, false).is_err());
    }
}
