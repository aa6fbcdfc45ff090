//! Non-dominated sorting, crowding distance, selection and survival.

use std::cmp::Ordering;

use rand::Rng;

use super::Candidate;

/// `a` Pareto-dominates `b` (all objectives minimised).
pub fn dominates(a: &[f64], b: &[f64]) -> bool {
    let mut strictly_better = false;
    for (x, y) in a.iter().zip(b) {
        if x > y {
            return false;
        }
        if x < y {
            strictly_better = true;
        }
    }
    strictly_better
}

/// Sum of positive constraint values.
pub fn constraint_violation(g: &[f64]) -> f64 {
    g.iter().map(|v| v.max(0.0)).sum()
}

/// Fronts of indices into `f`; front 0 is non-dominated.
pub fn fast_non_dominated_sort(f: &[&[f64]]) -> Vec<Vec<usize>> {
    let n = f.len();
    let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut domination_count = vec![0usize; n];
    let mut fronts: Vec<Vec<usize>> = Vec::new();
    let mut current = Vec::new();

    for i in 0..n {
        for j in (i + 1)..n {
            if dominates(f[i], f[j]) {
                dominated_by[i].push(j);
                domination_count[j] += 1;
            } else if dominates(f[j], f[i]) {
                dominated_by[j].push(i);
                domination_count[i] += 1;
            }
        }
    }
    for (i, &count) in domination_count.iter().enumerate() {
        if count == 0 {
            current.push(i);
        }
    }
    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            for &j in &dominated_by[i] {
                domination_count[j] -= 1;
                if domination_count[j] == 0 {
                    next.push(j);
                }
            }
        }
        next.sort_unstable();
        fronts.push(current);
        current = next;
    }
    fronts
}

/// Crowding distance of each point within one front; extremes are infinite.
pub fn crowding_distance(f: &[&[f64]]) -> Vec<f64> {
    let n = f.len();
    if n <= 2 {
        return vec![f64::INFINITY; n];
    }
    let n_obj = f[0].len();
    let mut distance = vec![0.0; n];
    let mut idx: Vec<usize> = (0..n).collect();
    for m in 0..n_obj {
        idx.sort_by(|&a, &b| f[a][m].partial_cmp(&f[b][m]).unwrap_or(Ordering::Equal));
        let lo = f[idx[0]][m];
        let hi = f[idx[n - 1]][m];
        distance[idx[0]] = f64::INFINITY;
        distance[idx[n - 1]] = f64::INFINITY;
        let span = hi - lo;
        if span <= 0.0 {
            continue;
        }
        for k in 1..n - 1 {
            distance[idx[k]] += (f[idx[k + 1]][m] - f[idx[k - 1]][m]) / span;
        }
    }
    distance
}

/// Constraint-domination binary tournament; returns the winner's index.
///
/// Lower violation wins; among feasible candidates Pareto dominance decides,
/// then larger crowding distance, then a coin flip.
pub fn binary_tournament<R: Rng>(pop: &[Candidate], rng: &mut R) -> usize {
    let a = rng.gen_range(0..pop.len());
    let b = rng.gen_range(0..pop.len());
    let (ca, cb) = (&pop[a], &pop[b]);
    let coin = |rng: &mut R| if rng.gen::<bool>() { a } else { b };

    if ca.cv > 0.0 || cb.cv > 0.0 {
        return match ca.cv.partial_cmp(&cb.cv) {
            Some(Ordering::Less) => a,
            Some(Ordering::Greater) => b,
            _ => coin(rng),
        };
    }
    if dominates(&ca.f, &cb.f) {
        return a;
    }
    if dominates(&cb.f, &ca.f) {
        return b;
    }
    match ca.crowding.partial_cmp(&cb.crowding) {
        Some(Ordering::Greater) => a,
        Some(Ordering::Less) => b,
        _ => coin(rng),
    }
}

/// Keep `n` candidates: feasible ones by rank then crowding, then infeasible
/// ones by ascending violation. Survivors carry their rank and crowding.
pub fn rank_and_crowding_survival(pop: Vec<Candidate>, n: usize) -> Vec<Candidate> {
    let (feasible, mut infeasible): (Vec<Candidate>, Vec<Candidate>) =
        pop.into_iter().partition(|c| c.cv <= 0.0);

    let mut survivors = Vec::with_capacity(n);
    if !feasible.is_empty() {
        let objectives: Vec<&[f64]> = feasible.iter().map(|c| c.f.as_slice()).collect();
        let fronts = fast_non_dominated_sort(&objectives);
        let mut slots: Vec<Option<Candidate>> = feasible.into_iter().map(Some).collect();
        for (rank, front) in fronts.iter().enumerate() {
            if survivors.len() >= n {
                break;
            }
            let front_f: Vec<&[f64]> = front
                .iter()
                .filter_map(|&i| slots[i].as_ref().map(|c| c.f.as_slice()))
                .collect();
            let crowding = crowding_distance(&front_f);
            let mut members: Vec<(usize, f64)> = front.iter().copied().zip(crowding).collect();
            if survivors.len() + members.len() > n {
                members.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
                members.truncate(n - survivors.len());
            }
            for (i, d) in members {
                if let Some(mut c) = slots[i].take() {
                    c.rank = rank;
                    c.crowding = d;
                    survivors.push(c);
                }
            }
        }
    }

    if survivors.len() < n {
        infeasible.sort_by(|a, b| a.cv.partial_cmp(&b.cv).unwrap_or(Ordering::Equal));
        for mut c in infeasible.into_iter().take(n - survivors.len()) {
            c.rank = usize::MAX;
            c.crowding = 0.0;
            survivors.push(c);
        }
    }
    survivors
}
