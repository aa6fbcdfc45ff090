//! Range calibration and the calibration parameter file.
//!
//! * [`MaxCalibrator`]: absolute maximum over everything seen.
//! * [`HistogramCalibrator`]: histogram of `|x|`, clipped at a percentile.
//! * [`CalibrationParameters`]: per-layer ranges, persisted as safetensors.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use qexplore_common::{CalibrationMethod, ExplorerError, Result};

use crate::quantize::scale_for;

/// Bins in a fresh histogram.
pub const HISTOGRAM_BINS: usize = 2048;

fn abs_values(x: &Tensor) -> Result<Vec<f32>> {
    Ok(x.to_dtype(DType::F32)?.abs()?.flatten_all()?.to_vec1::<f32>()?)
}

// ── MaxCalibrator ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MaxCalibrator {
    amax: Option<f32>,
}

impl MaxCalibrator {
    pub fn collect(&mut self, x: &Tensor) -> Result<()> {
        if x.elem_count() == 0 {
            return Ok(());
        }
        let m = x.to_dtype(DType::F32)?.abs()?.max_all()?.to_scalar::<f32>()?;
        self.amax = Some(self.amax.map_or(m, |a| a.max(m)));
        Ok(())
    }

    pub fn compute_amax(&self) -> Option<f32> {
        self.amax
    }
}

// ── HistogramCalibrator ─────────────────────────────────────────────────────

/// Equal-width histogram over `[0, range)` with a fixed number of bins.
///
/// The first batch with a positive maximum sets the range. When a later
/// batch exceeds it, groups of adjacent bins are merged so the range grows
/// by an integer factor and the bin count stays at [`HISTOGRAM_BINS`].
/// Zeros seen before any positive maximum are held back and land in bin 0.
#[derive(Debug, Clone, Default)]
pub struct HistogramCalibrator {
    counts: Vec<u64>,
    bin_width: f32,
    pending_zeros: u64,
}

impl HistogramCalibrator {
    pub fn collect(&mut self, x: &Tensor) -> Result<()> {
        let values = abs_values(x)?;
        self.collect_values(&values);
        Ok(())
    }

    pub fn collect_values(&mut self, values: &[f32]) {
        let finite = || values.iter().copied().filter(|v| v.is_finite());
        let Some(batch_max) = finite().reduce(f32::max) else {
            return;
        };
        if self.counts.is_empty() {
            if batch_max <= 0.0 {
                self.pending_zeros += finite().count() as u64;
                return;
            }
            self.bin_width = batch_max / HISTOGRAM_BINS as f32;
            self.counts = vec![0; HISTOGRAM_BINS];
            self.counts[0] = std::mem::take(&mut self.pending_zeros);
        } else if batch_max > self.range() {
            self.rebin(batch_max);
        }
        let last = self.counts.len() - 1;
        for v in finite() {
            let bin = ((v / self.bin_width) as usize).min(last);
            self.counts[bin] += 1;
        }
    }

    /// Merge every `factor` adjacent bins so the range covers `new_max`.
    fn rebin(&mut self, new_max: f32) {
        let ratio = (new_max as f64 / self.range() as f64).ceil();
        let factor = if ratio >= self.counts.len() as f64 {
            self.counts.len()
        } else {
            (ratio as usize).max(2)
        };
        let mut merged = vec![0u64; self.counts.len()];
        for (i, &c) in self.counts.iter().enumerate() {
            merged[i / factor] += c;
        }
        self.counts = merged;
        self.bin_width = if factor == self.counts.len() {
            new_max / self.counts.len() as f32
        } else {
            self.bin_width * factor as f32
        };
    }

    /// Upper edge of the histogram.
    pub fn range(&self) -> f32 {
        self.bin_width * self.counts.len() as f32
    }

    pub fn num_bins(&self) -> usize {
        self.counts.len()
    }

    /// Upper edge of the first bin whose CDF reaches `percentile` (0–100).
    pub fn compute_amax(&self, percentile: f64) -> Option<f32> {
        if self.counts.is_empty() {
            return (self.pending_zeros > 0).then_some(0.0);
        }
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return None;
        }
        let target = (percentile / 100.0).clamp(0.0, 1.0);
        let mut cumulative = 0u64;
        for (i, &c) in self.counts.iter().enumerate() {
            cumulative += c;
            if cumulative as f64 / total as f64 >= target {
                return Some(self.bin_width * (i + 1) as f32);
            }
        }
        Some(self.range())
    }
}

// ── Calibrator ──────────────────────────────────────────────────────────────

/// A calibrator for one of the supported methods.
#[derive(Debug, Clone)]
pub enum Calibrator {
    Max(MaxCalibrator),
    Percentile {
        histogram: HistogramCalibrator,
        percentile: f64,
    },
}

impl Calibrator {
    pub fn new(method: CalibrationMethod) -> Self {
        match method {
            CalibrationMethod::Max => Self::Max(MaxCalibrator::default()),
            CalibrationMethod::Percentile { percentile } => Self::Percentile {
                histogram: HistogramCalibrator::default(),
                percentile,
            },
        }
    }

    pub fn collect(&mut self, x: &Tensor) -> Result<()> {
        match self {
            Self::Max(c) => c.collect(x),
            Self::Percentile { histogram, .. } => histogram.collect(x),
        }
    }

    /// `None` if nothing was collected.
    pub fn compute_amax(&self) -> Option<f32> {
        match self {
            Self::Max(c) => c.compute_amax(),
            Self::Percentile {
                histogram,
                percentile,
            } => histogram.compute_amax(*percentile),
        }
    }
}

// ── CalibrationParameters ───────────────────────────────────────────────────

/// Ranges for one registered layer. Zero-point is always 0.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerCalibration {
    pub input_amax: f32,
    /// One range per output channel.
    pub weight_amax: Vec<f32>,
}

impl LayerCalibration {
    pub fn input_scale(&self, num_bits: u32) -> f64 {
        scale_for(self.input_amax, num_bits)
    }

    pub fn weight_scales(&self, num_bits: u32) -> Vec<f64> {
        self.weight_amax.iter().map(|&a| scale_for(a, num_bits)).collect()
    }
}

/// Calibrated ranges for every registered layer, in registry order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationParameters {
    pub layers: Vec<LayerCalibration>,
}

const NUM_LAYERS_KEY: &str = "num_layers";

fn input_key(i: usize) -> String {
    format!("layers.{i}.input_amax")
}

fn weight_key(i: usize) -> String {
    format!("layers.{i}.weight_amax")
}

fn tensor<'a>(tensors: &'a HashMap<String, Tensor>, path: &Path, key: &str) -> Result<&'a Tensor> {
    tensors
        .get(key)
        .ok_or_else(|| ExplorerError::calibration_file(path, format!("missing tensor {key}")))
}

impl CalibrationParameters {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Write as safetensors: `num_layers` plus two tensors per layer.
    pub fn save(&self, path: &Path) -> Result<()> {
        let to_file_err = |e: candle_core::Error| ExplorerError::calibration_file(path, e.to_string());
        let dev = Device::Cpu;
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert(
            NUM_LAYERS_KEY.to_string(),
            Tensor::new(&[self.layers.len() as u32], &dev).map_err(to_file_err)?,
        );
        for (i, layer) in self.layers.iter().enumerate() {
            tensors.insert(
                input_key(i),
                Tensor::new(&[layer.input_amax], &dev).map_err(to_file_err)?,
            );
            tensors.insert(
                weight_key(i),
                Tensor::new(layer.weight_amax.as_slice(), &dev).map_err(to_file_err)?,
            );
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ExplorerError::calibration_file(path, e.to_string()))?;
            }
        }
        candle_core::safetensors::save(&tensors, path).map_err(to_file_err)?;
        tracing::debug!(path = %path.display(), layers = self.layers.len(), "calibration saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let to_file_err = |e: candle_core::Error| ExplorerError::calibration_file(path, e.to_string());
        let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(to_file_err)?;
        let num_layers = tensor(&tensors, path, NUM_LAYERS_KEY)?
            .flatten_all()
            .and_then(|t| t.to_vec1::<u32>())
            .map_err(to_file_err)?;
        let num_layers = match num_layers.as_slice() {
            [n] => *n as usize,
            _ => {
                return Err(ExplorerError::calibration_file(path, "malformed num_layers"));
            }
        };

        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let input = tensor(&tensors, path, &input_key(i))?
                .flatten_all()
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(to_file_err)?;
            let input_amax = match input.as_slice() {
                [a] => *a,
                _ => {
                    return Err(ExplorerError::calibration_file(
                        path,
                        format!("layer {i} input range is not a scalar"),
                    ));
                }
            };
            let weight_amax = tensor(&tensors, path, &weight_key(i))?
                .flatten_all()
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(to_file_err)?;
            layers.push(LayerCalibration {
                input_amax,
                weight_amax,
            });
        }
        Ok(Self { layers })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_tracks_absolute_maximum() {
        let mut c = MaxCalibrator::default();
        assert_eq!(c.compute_amax(), None);
        c.collect(&Tensor::new(&[0.5f32, -2.0], &Device::Cpu).unwrap()).unwrap();
        c.collect(&Tensor::new(&[1.5f32], &Device::Cpu).unwrap()).unwrap();
        assert_eq!(c.compute_amax(), Some(2.0));
    }

    #[test]
    fn percentile_clips_outliers() {
        let mut h = HistogramCalibrator::default();
        let mut values: Vec<f32> = (0..9999).map(|i| (i % 100) as f32 / 100.0).collect();
        values.push(1000.0);
        h.collect_values(&values);
        let full = h.compute_amax(100.0).unwrap();
        let clipped = h.compute_amax(99.9).unwrap();
        assert!((full - 1000.0).abs() < 1e-2);
        assert!(clipped < 2.0, "clipped {clipped}");
    }

    #[test]
    fn histogram_merges_bins_when_range_grows() {
        let mut h = HistogramCalibrator::default();
        h.collect_values(&[1.0, 0.5]);
        assert_eq!(h.num_bins(), HISTOGRAM_BINS);
        let range = h.range();
        h.collect_values(&[2.0]);
        assert_eq!(h.num_bins(), HISTOGRAM_BINS);
        assert!((h.range() - 2.0 * range).abs() < 1e-6);
        assert!(h.compute_amax(100.0).unwrap() >= 2.0 - h.range() / HISTOGRAM_BINS as f32);
        // Earlier samples stay below the new top bin.
        assert!(h.compute_amax(60.0).unwrap() <= 1.0 + 1e-3);
    }

    #[test]
    fn tiny_then_huge_maximum_stays_bounded() {
        let mut h = HistogramCalibrator::default();
        h.collect_values(&[1e-4]);
        h.collect_values(&[100.0]);
        assert_eq!(h.num_bins(), HISTOGRAM_BINS);
        assert!(h.range() >= 100.0);
        let amax = h.compute_amax(100.0).unwrap();
        assert!((amax - 100.0).abs() / 100.0 < 0.01, "amax {amax}");
        h.collect_values(&[1e30]);
        assert_eq!(h.num_bins(), HISTOGRAM_BINS);
        assert!(h.range() >= 1e30);
    }

    #[test]
    fn leading_zero_batches_are_deferred() {
        let mut h = HistogramCalibrator::default();
        h.collect_values(&[0.0; 3]);
        assert_eq!(h.num_bins(), 0);
        assert_eq!(h.compute_amax(99.0), Some(0.0));
        h.collect_values(&[0.5, 1.0]);
        assert_eq!(h.num_bins(), HISTOGRAM_BINS);
        // 3 zeros + 0.5 out of 5 samples sit at or below 0.5.
        let p80 = h.compute_amax(80.0).unwrap();
        assert!(p80 <= 0.5 + 1e-3, "p80 {p80}");
        assert!((h.compute_amax(100.0).unwrap() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn empty_histogram_has_no_range() {
        let h = HistogramCalibrator::default();
        assert_eq!(h.compute_amax(99.99), None);
    }

    #[test]
    fn scales_are_symmetric() {
        let layer = LayerCalibration {
            input_amax: 2.0,
            weight_amax: vec![1.0, 0.5],
        };
        assert!((layer.input_scale(8) - 63.5).abs() < 1e-9);
        assert_eq!(layer.weight_scales(2), vec![1.0, 2.0]);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib.safetensors");
        let params = CalibrationParameters {
            layers: vec![
                LayerCalibration {
                    input_amax: 3.25,
                    weight_amax: vec![0.1, 0.2, 0.3],
                },
                LayerCalibration {
                    input_amax: 0.75,
                    weight_amax: vec![1.5],
                },
            ],
        };
        params.save(&path).unwrap();
        let loaded = CalibrationParameters::load(&path).unwrap();
        assert_eq!(loaded, params);
    }

    #[test]
    fn missing_file_is_calibration_error() {
        let err = CalibrationParameters::load(Path::new("/nonexistent/calib.safetensors"))
            .unwrap_err();
        assert!(matches!(err, ExplorerError::CalibrationFile { .. }));
    }
}
