//! Per-individual evaluation: apply bit widths, run inference, derive cost.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use qexplore_common::{DataLoader, ExplorerError, Result};
use qexplore_core::QuantizedModel;

use crate::accuracy::AccuracyFunction;
use crate::types::{BitWidthVector, Score};

pub struct Evaluator {
    loader: DataLoader,
    accuracy: Arc<dyn AccuracyFunction>,
    /// Scores of vectors already evaluated; inference is deterministic.
    cache: Option<Mutex<LruCache<BitWidthVector, Score>>>,
}

impl Evaluator {
    /// `cache_size == 0` disables caching.
    pub fn new(loader: DataLoader, accuracy: Arc<dyn AccuracyFunction>, cache_size: usize) -> Self {
        let cache = NonZeroUsize::new(cache_size).map(|n| Mutex::new(LruCache::new(n)));
        Self {
            loader,
            accuracy,
            cache,
        }
    }

    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }

    pub fn cached(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.lock().len())
    }

    /// Score `bits` on `model`. `index` identifies the individual in logs.
    pub fn evaluate(
        &self,
        index: usize,
        bits: &BitWidthVector,
        model: &mut QuantizedModel,
    ) -> Result<Score> {
        if let Some(cache) = &self.cache {
            if let Some(score) = cache.lock().get(bits) {
                tracing::debug!(index, bits = %bits, "cache hit");
                return Ok(*score);
            }
        }

        model.set_layer_bit_widths(bits.as_slice())?;
        let accuracy = self.accuracy.accuracy(model, &self.loader)?;
        if !(0.0..=1.0).contains(&accuracy) {
            return Err(ExplorerError::InvalidAccuracy(accuracy));
        }
        let cost = model.bit_weighted_cost(bits.as_slice());
        let score = Score { accuracy, cost };
        tracing::debug!(index, bits = %bits, accuracy, cost, "individual evaluated");

        if let Some(cache) = &self.cache {
            cache.lock().put(bits.clone(), score);
        }
        Ok(score)
    }
}
