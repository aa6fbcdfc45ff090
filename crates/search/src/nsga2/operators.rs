//! Variation operators over integer decision vectors.
//!
//! Crossover and mutation work in floating point; [`rounding_repair`] maps the
//! result back onto the integer lattice inside the bounds.

use rand::Rng;

/// Uniform integer sampling inside `[xl, xu]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerRandomSampling;

impl IntegerRandomSampling {
    pub fn sample<R: Rng>(&self, n: usize, xl: &[i64], xu: &[i64], rng: &mut R) -> Vec<Vec<i64>> {
        (0..n).map(|_| self.sample_one(xl, xu, rng)).collect()
    }

    pub fn sample_one<R: Rng>(&self, xl: &[i64], xu: &[i64], rng: &mut R) -> Vec<i64> {
        xl.iter()
            .zip(xu)
            .map(|(&lo, &hi)| rng.gen_range(lo..=hi))
            .collect()
    }
}

/// Round to the nearest integer and clamp into `[xl, xu]`.
pub fn rounding_repair(x: &[f64], xl: &[i64], xu: &[i64]) -> Vec<i64> {
    x.iter()
        .zip(xl.iter().zip(xu))
        .map(|(&v, (&lo, &hi))| (v.round() as i64).clamp(lo, hi))
        .collect()
}

// ── SBX ─────────────────────────────────────────────────────────────────────

/// Simulated binary crossover with bound handling.
#[derive(Debug, Clone, Copy)]
pub struct SbxCrossover {
    /// Probability that a mating pair is crossed at all.
    pub prob: f64,
    /// Per-variable crossover probability.
    pub prob_var: f64,
    /// Distribution index; larger keeps children closer to parents.
    pub eta: f64,
    /// Probability of swapping the two children's values per variable.
    pub prob_exch: f64,
}

impl SbxCrossover {
    pub fn new(prob_var: f64, eta: f64) -> Self {
        Self {
            prob: 0.9,
            prob_var,
            eta,
            prob_exch: 0.5,
        }
    }

    pub fn cross<R: Rng>(
        &self,
        p1: &[f64],
        p2: &[f64],
        xl: &[i64],
        xu: &[i64],
        rng: &mut R,
    ) -> (Vec<f64>, Vec<f64>) {
        let mut c1 = p1.to_vec();
        let mut c2 = p2.to_vec();
        if rng.gen::<f64>() >= self.prob {
            return (c1, c2);
        }
        for i in 0..p1.len() {
            if rng.gen::<f64>() >= self.prob_var {
                continue;
            }
            if (p1[i] - p2[i]).abs() <= 1e-14 {
                continue;
            }
            let (lo, hi) = (xl[i] as f64, xu[i] as f64);
            let y1 = p1[i].min(p2[i]);
            let y2 = p1[i].max(p2[i]);
            let delta = y2 - y1;
            let u: f64 = rng.gen();

            let beta = 1.0 + 2.0 * (y1 - lo) / delta;
            let betaq = self.spread(beta, u);
            let mut v1 = 0.5 * ((y1 + y2) - betaq * delta);

            let beta = 1.0 + 2.0 * (hi - y2) / delta;
            let betaq = self.spread(beta, u);
            let mut v2 = 0.5 * ((y1 + y2) + betaq * delta);

            if rng.gen::<f64>() < self.prob_exch {
                std::mem::swap(&mut v1, &mut v2);
            }
            c1[i] = v1.clamp(lo, hi);
            c2[i] = v2.clamp(lo, hi);
        }
        (c1, c2)
    }

    fn spread(&self, beta: f64, u: f64) -> f64 {
        let alpha = 2.0 - beta.powf(-(self.eta + 1.0));
        if u <= 1.0 / alpha {
            (u * alpha).powf(1.0 / (self.eta + 1.0))
        } else {
            (1.0 / (2.0 - u * alpha)).powf(1.0 / (self.eta + 1.0))
        }
    }
}

// ── Polynomial mutation ─────────────────────────────────────────────────────

/// Bounded polynomial mutation.
#[derive(Debug, Clone, Copy)]
pub struct PolynomialMutation {
    /// Probability that an individual is mutated.
    pub prob: f64,
    pub eta: f64,
    /// Per-variable probability; defaults to `min(0.5, 1 / n_var)`.
    pub prob_var: Option<f64>,
}

impl PolynomialMutation {
    pub fn new(prob: f64, eta: f64) -> Self {
        Self {
            prob,
            eta,
            prob_var: None,
        }
    }

    pub fn mutate<R: Rng>(&self, x: &mut [f64], xl: &[i64], xu: &[i64], rng: &mut R) {
        if x.is_empty() || rng.gen::<f64>() >= self.prob {
            return;
        }
        let prob_var = self
            .prob_var
            .unwrap_or_else(|| (1.0 / x.len() as f64).min(0.5));
        let mut_pow = 1.0 / (self.eta + 1.0);
        for i in 0..x.len() {
            if rng.gen::<f64>() >= prob_var {
                continue;
            }
            let (lo, hi) = (xl[i] as f64, xu[i] as f64);
            if hi <= lo {
                continue;
            }
            let y = x[i];
            let delta1 = (y - lo) / (hi - lo);
            let delta2 = (hi - y) / (hi - lo);
            let u: f64 = rng.gen();
            let deltaq = if u <= 0.5 {
                let xy = 1.0 - delta1;
                let val = 2.0 * u + (1.0 - 2.0 * u) * xy.powf(self.eta + 1.0);
                val.powf(mut_pow) - 1.0
            } else {
                let xy = 1.0 - delta2;
                let val = 2.0 * (1.0 - u) + 2.0 * (u - 0.5) * xy.powf(self.eta + 1.0);
                1.0 - val.powf(mut_pow)
            };
            x[i] = (y + deltaq * (hi - lo)).clamp(lo, hi);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn sampling_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let xl = [2, 4, 4];
        let xu = [8, 4, 6];
        for x in IntegerRandomSampling.sample(200, &xl, &xu, &mut rng) {
            for i in 0..3 {
                assert!(x[i] >= xl[i] && x[i] <= xu[i]);
            }
            assert_eq!(x[1], 4);
        }
    }

    #[test]
    fn repair_rounds_and_clamps() {
        assert_eq!(rounding_repair(&[1.4, 5.5, 9.7], &[2, 2, 2], &[8, 8, 8]), vec![2, 6, 8]);
    }

    #[test]
    fn crossover_and_mutation_respect_bounds() {
        let mut rng = StdRng::seed_from_u64(11);
        let xl = [2i64; 5];
        let xu = [8i64; 5];
        let sbx = SbxCrossover::new(1.0, 3.0);
        let pm = PolynomialMutation {
            prob: 1.0,
            eta: 3.0,
            prob_var: Some(1.0),
        };
        for _ in 0..500 {
            let p1: Vec<f64> = IntegerRandomSampling
                .sample_one(&xl, &xu, &mut rng)
                .into_iter()
                .map(|v| v as f64)
                .collect();
            let p2: Vec<f64> = IntegerRandomSampling
                .sample_one(&xl, &xu, &mut rng)
                .into_iter()
                .map(|v| v as f64)
                .collect();
            let (mut c1, c2) = sbx.cross(&p1, &p2, &xl, &xu, &mut rng);
            pm.mutate(&mut c1, &xl, &xu, &mut rng);
            for v in c1.iter().chain(c2.iter()) {
                assert!((2.0..=8.0).contains(v), "{v}");
            }
        }
    }

    #[test]
    fn identical_parents_are_unchanged_by_crossover() {
        let mut rng = StdRng::seed_from_u64(3);
        let sbx = SbxCrossover::new(1.0, 3.0);
        let p = vec![5.0, 6.0];
        let (c1, c2) = sbx.cross(&p, &p, &[2, 2], &[8, 8], &mut rng);
        assert_eq!(c1, p);
        assert_eq!(c2, p);
    }

    #[test]
    fn mutation_moves_values_eventually() {
        let mut rng = StdRng::seed_from_u64(5);
        let pm = PolynomialMutation::new(1.0, 3.0);
        let mut moved = false;
        for _ in 0..100 {
            let mut x = vec![5.0];
            pm.mutate(&mut x, &[2], &[8], &mut rng);
            if rounding_repair(&x, &[2], &[8]) != vec![5] {
                moved = true;
                break;
            }
        }
        assert!(moved);
    }
}
