//! Workload-driven calibration and exploration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::Device;

use qexplore_common::{
    build_dataloaders, DataLoader, ExplorerError, Result, Workload, BASELINE_DATASET,
    CALIBRATE_DATASET, EXPLORATION_DATASET,
};
use qexplore_core::{predicate_for, Network, QuantizedModel, WeightingFunction};

use crate::accuracy::{AccuracyFunction, ClassificationAccuracy};
use crate::evaluator::Evaluator;
use crate::nsga2::{minimize, Nsga2};
use crate::problem::LayerwiseQuantizationProblem;
use crate::results::{ExplorationResult, RunInfo};
use crate::runner::runner_from_config;
use crate::types::{BitWidthVector, Score};

#[derive(Debug, Clone, Copy, Default)]
pub struct ExplorerOptions {
    /// Skip the unquantised accuracy measurement.
    pub skip_baseline: bool,
    pub progress: bool,
}

pub struct QuantizationExplorer {
    workload: Workload,
    options: ExplorerOptions,
    device: Device,
    accuracy: Arc<dyn AccuracyFunction>,
}

impl QuantizationExplorer {
    /// Validates the workload and picks CUDA when available.
    pub fn new(workload: Workload, options: ExplorerOptions) -> Result<Self> {
        let device = Device::cuda_if_available(0)?;
        Self::with_device(workload, options, device)
    }

    pub fn with_device(workload: Workload, options: ExplorerOptions, device: Device) -> Result<Self> {
        workload.validate()?;
        Ok(Self {
            workload,
            options,
            device,
            accuracy: Arc::new(ClassificationAccuracy {
                progress: options.progress,
            }),
        })
    }

    /// Replace the default top-1 classification accuracy.
    pub fn with_accuracy(mut self, accuracy: Arc<dyn AccuracyFunction>) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Load the network and wrap it with the workload's layer selector and
    /// weighting function.
    pub fn build_model(&self) -> Result<QuantizedModel> {
        let cfg = &self.workload.model;
        let network = Network::load(&cfg.architecture, &cfg.weights, &self.device)?;
        let weighting: WeightingFunction = self.workload.exploration.bit_weighting_function.parse()?;
        QuantizedModel::new(
            network,
            self.device.clone(),
            predicate_for(cfg.quantizable_layers),
            Arc::new(weighting),
        )
    }

    /// Calibrate on the `calibrate` dataset and write the parameters to
    /// `file` (default: the workload's calibration file). Returns `None`
    /// without touching anything if the file exists and `force` is off.
    pub fn calibrate(&self, force: bool, file: Option<&Path>) -> Result<Option<PathBuf>> {
        let path = file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.workload.calibration.file.clone());
        if path.exists() && !force {
            tracing::warn!(
                path = %path.display(),
                "calibration file already exists; use --force to overwrite"
            );
            return Ok(None);
        }

        let cfg = self
            .workload
            .calibration
            .datasets
            .get(CALIBRATE_DATASET)
            .ok_or_else(|| {
                ExplorerError::config(format!(
                    "calibration.datasets has no '{CALIBRATE_DATASET}' entry"
                ))
            })?;
        let loader = DataLoader::from_config(cfg, &self.device)?;
        let mut model = self.build_model()?;
        model.run_calibration(&loader, self.workload.calibration.method, self.options.progress)?;
        model.save_parameters(&path)?;
        Ok(Some(path))
    }

    /// Full run: datasets, model, calibration, optional baseline, search.
    /// `None` when no feasible bit-width vector was found.
    pub fn explore(&self, calibration_file: &Path) -> Result<Option<ExplorationResult>> {
        let loaders = build_dataloaders(&self.workload.exploration.datasets, &self.device)?;
        let loader = loaders
            .get(EXPLORATION_DATASET)
            .cloned()
            .ok_or_else(|| ExplorerError::config("no exploration dataset configured"))?;
        let mut model = self.build_model()?;
        model.load_parameters(calibration_file)?;

        let baseline = if self.options.skip_baseline {
            None
        } else if let Some(baseline_loader) = loaders.get(BASELINE_DATASET) {
            model.disable_quantization();
            let acc = self.accuracy.accuracy(&model, baseline_loader)?;
            model.enable_quantization();
            tracing::info!(accuracy = acc, "baseline accuracy");
            Some(acc)
        } else {
            tracing::warn!("no '{BASELINE_DATASET}' dataset configured; skipping baseline");
            None
        };

        self.explore_model(model, Arc::clone(&self.accuracy), loader, baseline)
    }

    /// The search loop on an already calibrated model.
    pub fn explore_model(
        &self,
        model: QuantizedModel,
        accuracy: Arc<dyn AccuracyFunction>,
        loader: DataLoader,
        baseline_accuracy: Option<f64>,
    ) -> Result<Option<ExplorationResult>> {
        let cfg = &self.workload.exploration;
        let layers: Vec<String> = model.layers().iter().map(|l| l.name.clone()).collect();
        tracing::info!(
            model = %self.workload.model.name,
            layers = layers.len(),
            bounds = ?cfg.bit_widths,
            minimum_accuracy = cfg.minimum_accuracy,
            weighting = %cfg.bit_weighting_function,
            "starting exploration"
        );

        let evaluator = Evaluator::new(loader, accuracy, cfg.cache_size);
        let runner = runner_from_config(cfg.runner, self.options.progress)?;
        let mut problem = LayerwiseQuantizationProblem::new(
            model,
            evaluator,
            runner,
            cfg.bit_widths,
            cfg.minimum_accuracy,
        )?
        .with_failure_policy(cfg.on_failure);
        let algorithm = Nsga2::from_config(&cfg.nsga);
        let res = minimize(&mut problem, &algorithm, cfg.nsga.generations, cfg.nsga.seed, true)?;

        if res.f().is_none() {
            tracing::warn!(n_evals = res.n_evals, "no solutions found");
            return Ok(None);
        }
        tracing::info!(
            front = res.opt.len(),
            n_evals = res.n_evals,
            secs = res.exec_time.as_secs_f64(),
            "exploration finished"
        );

        let info = RunInfo {
            model: self.workload.model.name.clone(),
            dataset: self.workload.exploration_dataset()?.name.clone(),
            weighting: cfg.bit_weighting_function.clone(),
            layers,
            bit_width_bounds: cfg.bit_widths,
            minimum_accuracy: cfg.minimum_accuracy,
            baseline_accuracy,
        };
        ExplorationResult::from_optimization(info, &res).map(Some)
    }

    /// [`explore`](Self::explore) on tokio's blocking pool.
    pub async fn explore_async(&self, calibration_file: PathBuf) -> Result<Option<ExplorationResult>> {
        let explorer = Self {
            workload: self.workload.clone(),
            options: self.options,
            device: self.device.clone(),
            accuracy: Arc::clone(&self.accuracy),
        };
        tokio::task::spawn_blocking(move || explorer.explore(&calibration_file))
            .await
            .map_err(|e| ExplorerError::Join(e.to_string()))?
    }

    /// Score one bit-width vector on the exploration dataset.
    pub fn evaluate_bit_widths(&self, calibration_file: &Path, bits: &[u32]) -> Result<Score> {
        let loader = DataLoader::from_config(self.workload.exploration_dataset()?, &self.device)?;
        let mut model = self.build_model()?;
        model.load_parameters(calibration_file)?;
        let evaluator = Evaluator::new(loader, Arc::clone(&self.accuracy), 0);
        evaluator.evaluate(0, &BitWidthVector(bits.to_vec()), &mut model)
    }
}
