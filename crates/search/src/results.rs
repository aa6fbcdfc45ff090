//! Exploration artifacts: saving, collecting, de-duplicating and picking
//! candidates for retraining.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use qexplore_common::{ExplorerError, Result};

use crate::nsga2::{Candidate, OptimizationResult};
use crate::types::{BitWidthVector, Individual, ParetoPoint};

/// `strftime` layout of artifact timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

const ARTIFACT_PREFIX: &str = "exploration_";

/// What was explored, independent of how the search went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub model: String,
    pub dataset: String,
    pub weighting: String,
    pub layers: Vec<String>,
    pub bit_width_bounds: [u32; 2],
    pub minimum_accuracy: f64,
    #[serde(default)]
    pub baseline_accuracy: Option<f64>,
}

/// One exploration run as persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorationResult {
    #[serde(flatten)]
    pub info: RunInfo,
    pub timestamp: String,
    /// Feasible non-dominated points, ascending cost.
    pub pareto_front: Vec<ParetoPoint>,
    pub population: Vec<Individual>,
    /// Every individual evaluated, in generation order.
    pub history: Vec<Individual>,
    pub n_gen: usize,
    pub n_evals: usize,
    pub exec_time_secs: f64,
}

fn individual(c: &Candidate, generation: usize) -> Result<Individual> {
    let bit_widths = BitWidthVector::from_decision(&c.x)
        .ok_or_else(|| ExplorerError::config(format!("decision vector {:?} is not a bit-width vector", c.x)))?;
    match (c.f.as_slice(), c.g.first()) {
        ([acc, cost], Some(&constraint)) => Ok(Individual {
            bit_widths,
            objectives: [*acc, *cost],
            constraint,
            generation,
        }),
        _ => Err(ExplorerError::config(format!(
            "candidate {bit_widths} has {} objectives and {} constraints",
            c.f.len(),
            c.g.len()
        ))),
    }
}

impl ExplorationResult {
    pub fn from_optimization(info: RunInfo, res: &OptimizationResult) -> Result<Self> {
        let mut pareto_front = res
            .opt
            .iter()
            .map(|c| {
                individual(c, res.n_gen).map(|ind| ParetoPoint {
                    accuracy: ind.accuracy(),
                    cost: ind.cost(),
                    bit_widths: ind.bit_widths,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        pareto_front.sort_by(|a, b| a.cost.total_cmp(&b.cost).then(b.accuracy.total_cmp(&a.accuracy)));

        let population = res
            .pop
            .iter()
            .map(|c| individual(c, res.n_gen))
            .collect::<Result<Vec<_>>>()?;
        let mut history = Vec::new();
        for generation in &res.history {
            for c in &generation.off {
                history.push(individual(c, generation.n_gen)?);
            }
        }

        Ok(Self {
            info,
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
            pareto_front,
            population,
            history,
            n_gen: res.n_gen,
            n_evals: res.n_evals,
            exec_time_secs: res.exec_time.as_secs_f64(),
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.file_stem())
    }

    fn file_stem(&self) -> String {
        format!(
            "{ARTIFACT_PREFIX}{}_{}_{}",
            self.info.model, self.info.dataset, self.timestamp
        )
    }

    /// Individuals to draw candidates from: the history, or the final
    /// population when no history was kept.
    fn individuals(&self) -> &[Individual] {
        if self.history.is_empty() {
            &self.population
        } else {
            &self.history
        }
    }
}

/// Write `result` under `dir`, creating it. Returns the artifact path.
/// Never overwrites: a name already taken gets a `_1`, `_2`, ... suffix.
pub fn save_result(result: &ExplorationResult, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let text = serde_json::to_string_pretty(result)?;
    let stem = result.file_stem();
    let mut attempt = 0usize;
    let (path, mut file) = loop {
        let path = match attempt {
            0 => dir.join(result.file_name()),
            n => dir.join(format!("{stem}_{n}.json")),
        };
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => break (path, file),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    };
    file.write_all(text.as_bytes())?;
    tracing::info!(path = %path.display(), front = result.pareto_front.len(), "exploration result saved");
    Ok(path)
}

pub fn load_result(path: &Path) -> Result<ExplorationResult> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// History individuals of one or more runs.
#[derive(Debug, Clone, Default)]
pub struct ResultsCollection {
    /// Run id (artifact file stem) → individuals.
    pub runs: BTreeMap<String, Vec<Individual>>,
    /// Largest admissible accuracy drop; normalises selection shortfalls.
    pub accuracy_limit: f64,
}

/// Load a single artifact or every `exploration_*.json` in a directory.
pub fn collect_results(path: &Path) -> Result<ResultsCollection> {
    let files = if path.is_dir() {
        let mut files: Vec<PathBuf> = fs::read_dir(path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().is_some_and(|e| e == "json")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(ARTIFACT_PREFIX))
            })
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };
    if files.is_empty() {
        return Err(ExplorerError::config(format!(
            "no exploration results under {}",
            path.display()
        )));
    }

    let mut collection = ResultsCollection::default();
    let mut limit: f64 = 0.0;
    for file in files {
        let result = load_result(&file)?;
        let run_id = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let individuals = result.individuals().to_vec();
        let reference = result.info.baseline_accuracy.unwrap_or_else(|| {
            individuals
                .iter()
                .map(Individual::accuracy)
                .fold(0.0, f64::max)
        });
        limit = limit.max(reference - result.info.minimum_accuracy);
        tracing::debug!(run = %run_id, individuals = individuals.len(), "results collected");
        collection.runs.insert(run_id, individuals);
    }
    collection.accuracy_limit = limit.max(1e-9);
    Ok(collection)
}

/// An individual chosen for retraining, with the run it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedCandidate {
    pub run: String,
    pub individual: Individual,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionPolicy {
    /// Cheapest feasible individuals within `max_shortfall` of the best
    /// accuracy, measured in units of the accuracy limit.
    LowestCost { max_shortfall: f64 },
    /// Highest `(accuracy / max_accuracy) * (min_cost / cost)`.
    WeightedProduct,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::LowestCost { max_shortfall: 1.0 }
    }
}

impl ResultsCollection {
    pub fn with_accuracy_limit(mut self, limit: f64) -> Self {
        self.accuracy_limit = limit;
        self
    }

    pub fn len(&self) -> usize {
        self.runs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the first individual seen per bit-width vector, walking runs in
    /// id order and individuals in history order.
    pub fn drop_duplicate_parameters(&mut self) {
        let before = self.len();
        let mut seen: HashSet<BitWidthVector> = HashSet::new();
        for individuals in self.runs.values_mut() {
            individuals.retain(|ind| seen.insert(ind.bit_widths.clone()));
        }
        tracing::debug!(before, after = self.len(), "duplicate parameters dropped");
    }

    fn candidates(&self) -> impl Iterator<Item = (&String, &Individual)> {
        self.runs
            .iter()
            .flat_map(|(run, inds)| inds.iter().map(move |ind| (run, ind)))
    }

    /// Up to `n` candidates under `policy`, best first.
    pub fn select(&self, n: usize, policy: SelectionPolicy) -> Vec<SelectedCandidate> {
        let mut scored: Vec<(f64, &String, &Individual)> = match policy {
            SelectionPolicy::LowestCost { max_shortfall } => {
                let best = self
                    .candidates()
                    .filter(|(_, ind)| ind.is_feasible())
                    .map(|(_, ind)| ind.accuracy())
                    .fold(f64::NEG_INFINITY, f64::max);
                self.candidates()
                    .filter(|(_, ind)| {
                        ind.is_feasible()
                            && (best - ind.accuracy()) / self.accuracy_limit <= max_shortfall
                    })
                    .map(|(run, ind)| (ind.cost(), run, ind))
                    .collect()
            }
            SelectionPolicy::WeightedProduct => {
                let max_acc = self
                    .candidates()
                    .map(|(_, ind)| ind.accuracy())
                    .fold(0.0, f64::max);
                let min_cost = self
                    .candidates()
                    .map(|(_, ind)| ind.cost())
                    .fold(f64::INFINITY, f64::min);
                if max_acc <= 0.0 {
                    return Vec::new();
                }
                self.candidates()
                    .filter(|(_, ind)| ind.cost() > 0.0)
                    .map(|(run, ind)| {
                        let score = (ind.accuracy() / max_acc) * (min_cost / ind.cost());
                        // Negated so both policies sort ascending.
                        (-score, run, ind)
                    })
                    .collect()
            }
        };
        scored.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| b.2.accuracy().total_cmp(&a.2.accuracy()))
                .then_with(|| a.2.bit_widths.cmp(&b.2.bit_widths))
        });
        scored
            .into_iter()
            .take(n)
            .map(|(_, run, ind)| SelectedCandidate {
                run: run.clone(),
                individual: ind.clone(),
            })
            .collect()
    }
}

/// `run,generation,bit_widths,accuracy,cost`.
pub fn write_candidates_csv(path: &Path, candidates: &[SelectedCandidate]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    writeln!(file, "run,generation,bit_widths,accuracy,cost")?;
    for c in candidates {
        writeln!(
            file,
            "{},{},{},{},{}",
            c.run,
            c.individual.generation,
            c.individual.bit_widths,
            c.individual.accuracy(),
            c.individual.cost()
        )?;
    }
    tracing::info!(path = %path.display(), candidates = candidates.len(), "candidates written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Score;

    fn ind(bits: &[u32], accuracy: f64, cost: f64, min_acc: f64, generation: usize) -> Individual {
        Individual {
            bit_widths: BitWidthVector(bits.to_vec()),
            objectives: Score { accuracy, cost }.objectives(),
            constraint: min_acc - accuracy,
            generation,
        }
    }

    fn result(model: &str, history: Vec<Individual>, baseline: Option<f64>) -> ExplorationResult {
        ExplorationResult {
            info: RunInfo {
                model: model.into(),
                dataset: "mnist".into(),
                weighting: "bits_sum".into(),
                layers: vec!["conv0".into(), "conv1".into()],
                bit_width_bounds: [2, 8],
                minimum_accuracy: 0.7,
                baseline_accuracy: baseline,
            },
            timestamp: "2026-01-02_03-04-05".into(),
            pareto_front: Vec::new(),
            population: Vec::new(),
            history,
            n_gen: 2,
            n_evals: 4,
            exec_time_secs: 1.5,
        }
    }

    fn collection() -> ResultsCollection {
        let mut runs = BTreeMap::new();
        runs.insert(
            "a".to_string(),
            vec![
                ind(&[8, 8], 0.95, 16.0, 0.7, 1),
                ind(&[4, 4], 0.90, 8.0, 0.7, 1),
                ind(&[2, 2], 0.50, 4.0, 0.7, 2),
            ],
        );
        runs.insert(
            "b".to_string(),
            vec![ind(&[4, 4], 0.90, 8.0, 0.7, 1), ind(&[3, 4], 0.80, 7.0, 0.7, 2)],
        );
        ResultsCollection {
            runs,
            accuracy_limit: 0.25,
        }
    }

    #[test]
    fn duplicates_dropped_keeping_first_run() {
        let mut c = collection();
        c.drop_duplicate_parameters();
        assert_eq!(c.len(), 4);
        assert_eq!(c.runs["a"].len(), 3);
        assert_eq!(c.runs["b"].len(), 1);
        assert_eq!(c.runs["b"][0].bit_widths, BitWidthVector(vec![3, 4]));
    }

    #[test]
    fn lowest_cost_respects_shortfall() {
        let mut c = collection();
        c.drop_duplicate_parameters();
        // best 0.95; shortfalls 0, 0.2, 0.6 (in units of 0.25); infeasible excluded
        let picked = c.select(10, SelectionPolicy::LowestCost { max_shortfall: 0.5 });
        let bits: Vec<String> = picked.iter().map(|p| p.individual.bit_widths.to_string()).collect();
        assert_eq!(bits, vec!["4-4", "8-8"]);
        assert_eq!(picked[0].run, "a");

        let all = c.select(2, SelectionPolicy::default());
        let bits: Vec<String> = all.iter().map(|p| p.individual.bit_widths.to_string()).collect();
        assert_eq!(bits, vec!["3-4", "4-4"]);
    }

    #[test]
    fn weighted_product_prefers_balance() {
        let mut c = collection();
        c.drop_duplicate_parameters();
        let picked = c.select(1, SelectionPolicy::WeightedProduct);
        // 2-2: (0.5/0.95)*(4/4) ≈ 0.526; 3-4: (0.8/0.95)*(4/7) ≈ 0.481
        assert_eq!(picked[0].individual.bit_widths, BitWidthVector(vec![2, 2]));
    }

    #[test]
    fn save_and_collect_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let first = result("lenet", vec![ind(&[4, 4], 0.9, 8.0, 0.7, 1)], Some(0.99));
        let mut second = result("resnet", vec![ind(&[8, 8], 0.8, 16.0, 0.7, 1)], None);
        second.timestamp = "2026-01-02_03-04-06".into();
        let p1 = save_result(&first, dir.path()).unwrap();
        save_result(&second, dir.path()).unwrap();
        fs::write(dir.path().join("notes.json"), "{}").unwrap();

        assert_eq!(load_result(&p1).unwrap(), first);
        assert!(p1
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("exploration_lenet_mnist_2026"));

        let c = collect_results(dir.path()).unwrap();
        assert_eq!(c.runs.len(), 2);
        assert_eq!(c.len(), 2);
        // max(0.99 - 0.7, 0.8 - 0.7)
        assert!((c.accuracy_limit - 0.29).abs() < 1e-9);

        let single = collect_results(&p1).unwrap();
        assert_eq!(single.runs.len(), 1);
    }

    #[test]
    fn same_second_saves_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let first = result("lenet", vec![ind(&[4, 4], 0.9, 8.0, 0.7, 1)], None);
        let mut second = first.clone();
        second.history = vec![ind(&[2, 2], 0.6, 4.0, 0.7, 1)];
        let third = first.clone();

        let p1 = save_result(&first, dir.path()).unwrap();
        let p2 = save_result(&second, dir.path()).unwrap();
        let p3 = save_result(&third, dir.path()).unwrap();
        assert_ne!(p1, p2);
        assert_ne!(p2, p3);
        assert!(p2.to_str().unwrap().ends_with("_1.json"));
        assert!(p3.to_str().unwrap().ends_with("_2.json"));
        assert_eq!(load_result(&p1).unwrap(), first);
        assert_eq!(load_result(&p2).unwrap(), second);

        let c = collect_results(dir.path()).unwrap();
        assert_eq!(c.runs.len(), 3);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_results(dir.path()).is_err());
    }

    #[test]
    fn csv_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("candidates.csv");
        let c = collection();
        write_candidates_csv(&path, &c.select(1, SelectionPolicy::default())).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "run,generation,bit_widths,accuracy,cost");
        assert_eq!(lines[1], "b,2,3-4,0.8,7");
    }
}
