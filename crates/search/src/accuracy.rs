//! Accuracy functions: model + data → score in `[0, 1]`.

use candle_core::DType;

use qexplore_common::{progress_bar, DataLoader, ExplorerError, Result};
use qexplore_core::QuantizedModel;

/// Scores a model on a data loader. Must be deterministic for a fixed model
/// state and loader.
pub trait AccuracyFunction: Send + Sync {
    fn accuracy(&self, model: &QuantizedModel, loader: &DataLoader) -> Result<f64>;
}

impl<F> AccuracyFunction for F
where
    F: Fn(&QuantizedModel, &DataLoader) -> Result<f64> + Send + Sync,
{
    fn accuracy(&self, model: &QuantizedModel, loader: &DataLoader) -> Result<f64> {
        self(model, loader)
    }
}

/// Top-1 classification accuracy: argmax of the logits against the labels,
/// correct predictions over samples visited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassificationAccuracy {
    pub progress: bool,
}

impl AccuracyFunction for ClassificationAccuracy {
    fn accuracy(&self, model: &QuantizedModel, loader: &DataLoader) -> Result<f64> {
        if loader.is_empty() {
            return Err(ExplorerError::Dataset("accuracy over an empty loader".into()));
        }
        let pb = progress_bar(loader.num_batches() as u64, "batches", self.progress)?;
        let mut correct = 0u64;
        for batch in loader.batches() {
            let (inputs, labels) = batch?;
            let logits = model.forward(&inputs)?;
            let predicted = logits.argmax(1)?;
            correct += predicted
                .eq(&labels.to_dtype(predicted.dtype())?)?
                .to_dtype(DType::U32)?
                .sum_all()?
                .to_scalar::<u32>()? as u64;
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(correct as f64 / loader.len() as f64)
    }
}
