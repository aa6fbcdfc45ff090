//! Symmetric fake quantisation.
//!
//! Values are mapped onto the signed integer grid `[-(2^(b-1) - 1), 2^(b-1) - 1]`
//! with scale `s = (2^(b-1) - 1) / amax` and zero-point 0, rounded, clamped
//! and mapped back to floating point, so inference sees the reduced precision
//! without integer kernels.
//!
//! ```text
//! q(x) = clamp(round(x · s), -M, M) / s        M = 2^(b-1) - 1
//! ```

use candle_core::{DType, Tensor};
use parking_lot::Mutex;

use qexplore_common::{CalibrationMethod, ExplorerError, Result};

use crate::calibration::Calibrator;

/// Ranges below this are treated as this value to keep scales finite.
const MIN_AMAX: f32 = 1e-8;

/// Largest integer on the signed `num_bits` grid.
#[inline]
pub fn max_bound(num_bits: u32) -> f64 {
    ((1u64 << (num_bits.max(1) - 1)) - 1).max(1) as f64
}

/// Scale mapping `amax` onto the `num_bits` grid.
#[inline]
pub fn scale_for(amax: f32, num_bits: u32) -> f64 {
    max_bound(num_bits) / amax.max(MIN_AMAX) as f64
}

/// Per-tensor fake quantisation.
pub fn fake_quantize(x: &Tensor, amax: f32, num_bits: u32) -> Result<Tensor> {
    let bound = max_bound(num_bits);
    let scale = scale_for(amax, num_bits);
    let q = x.affine(scale, 0.0)?.round()?.clamp(-bound, bound)?;
    Ok(q.affine(1.0 / scale, 0.0)?)
}

/// Per-channel fake quantisation along `axis`; `amax` holds one range per channel.
pub fn fake_quantize_per_channel(
    x: &Tensor,
    amax: &[f32],
    axis: usize,
    num_bits: u32,
) -> Result<Tensor> {
    let channels = x.dim(axis)?;
    if channels != amax.len() {
        return Err(ExplorerError::config(format!(
            "per-channel range has {} entries for {} channels",
            amax.len(),
            channels
        )));
    }
    let bound = max_bound(num_bits);
    let scales: Vec<f32> = amax.iter().map(|&a| scale_for(a, num_bits) as f32).collect();
    let mut shape = vec![1usize; x.rank()];
    shape[axis] = channels;
    let scales = Tensor::from_vec(scales, shape, x.device())?.to_dtype(x.dtype())?;
    let q = x.broadcast_mul(&scales)?.round()?.clamp(-bound, bound)?;
    Ok(q.broadcast_div(&scales)?)
}

// ── TensorQuantizer ─────────────────────────────────────────────────────────

/// Quantiser state for one tensor (a layer's input or its weight).
///
/// While a calibrator is attached, `forward` records statistics and passes
/// the input through. An enabled quantiser without a range refuses to run.
pub struct TensorQuantizer {
    name: String,
    num_bits: u32,
    /// Channel axis for per-channel ranges; `None` is per-tensor.
    axis: Option<usize>,
    amax: Option<Vec<f32>>,
    enabled: bool,
    calibrator: Mutex<Option<Calibrator>>,
}

impl TensorQuantizer {
    pub fn new(name: impl Into<String>, num_bits: u32, axis: Option<usize>) -> Self {
        Self {
            name: name.into(),
            num_bits,
            axis,
            amax: None,
            enabled: false,
            calibrator: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    pub fn set_num_bits(&mut self, num_bits: u32) {
        self.num_bits = num_bits;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn amax(&self) -> Option<&[f32]> {
        self.amax.as_deref()
    }

    pub fn set_amax(&mut self, amax: Vec<f32>) {
        self.amax = Some(amax);
    }

    /// Scale per range entry at the current bit width.
    pub fn scales(&self) -> Option<Vec<f64>> {
        self.amax
            .as_ref()
            .map(|a| a.iter().map(|&v| scale_for(v, self.num_bits)).collect())
    }

    /// Attach a fresh calibrator; subsequent forwards collect statistics.
    pub fn start_calibration(&mut self, method: CalibrationMethod) {
        *self.calibrator.get_mut() = Some(Calibrator::new(method));
    }

    /// Detach the calibrator and store the range it computed.
    pub fn finish_calibration(&mut self) -> Result<()> {
        let calibrator = self.calibrator.get_mut().take().ok_or_else(|| {
            ExplorerError::config(format!("quantizer {} is not calibrating", self.name))
        })?;
        let amax = calibrator.compute_amax().ok_or_else(|| {
            ExplorerError::config(format!("calibrator of {} saw no data", self.name))
        })?;
        self.amax = Some(vec![amax]);
        Ok(())
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrator.lock().is_some()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        {
            let mut guard = self.calibrator.lock();
            if let Some(calibrator) = guard.as_mut() {
                calibrator.collect(x)?;
                return Ok(x.clone());
            }
        }
        if !self.enabled {
            return Ok(x.clone());
        }
        let amax = self
            .amax
            .as_deref()
            .ok_or_else(|| ExplorerError::Uncalibrated(self.name.clone()))?;
        let x = if x.dtype() == DType::F32 { x.clone() } else { x.to_dtype(DType::F32)? };
        match (self.axis, amax) {
            (None, [a]) => fake_quantize(&x, *a, self.num_bits),
            (None, _) => Err(ExplorerError::config(format!(
                "per-tensor quantizer {} holds {} ranges",
                self.name,
                amax.len()
            ))),
            (Some(axis), a) => fake_quantize_per_channel(&x, a, axis, self.num_bits),
        }
    }

    /// Same settings and range, no calibrator.
    pub fn replicate(&self) -> Self {
        Self {
            name: self.name.clone(),
            num_bits: self.num_bits,
            axis: self.axis,
            amax: self.amax.clone(),
            enabled: self.enabled,
            calibrator: Mutex::new(None),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn bounds_follow_bit_width() {
        assert_eq!(max_bound(2), 1.0);
        assert_eq!(max_bound(4), 7.0);
        assert_eq!(max_bound(8), 127.0);
        assert_eq!(max_bound(16), 32767.0);
    }

    #[test]
    fn per_tensor_grid_and_clamp() {
        let x = Tensor::new(&[-2.0f32, -0.5, 0.0, 0.26, 1.0, 3.0], &Device::Cpu).unwrap();
        // 4 bits, amax 1: scale 7, grid step 1/7.
        let q: Vec<f32> = fake_quantize(&x, 1.0, 4).unwrap().to_vec1().unwrap();
        let expect = [-1.0, -4.0 / 7.0, 0.0, 2.0 / 7.0, 1.0, 1.0];
        for (a, b) in q.iter().zip(expect.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn higher_bits_reduce_error() {
        let x = Tensor::new(&[0.1f32, -0.33, 0.77, -0.91], &Device::Cpu).unwrap();
        let err = |bits| {
            let q = fake_quantize(&x, 1.0, bits).unwrap();
            (q - &x).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap()
        };
        assert!(err(8) < err(4));
        assert!(err(4) < err(2));
    }

    #[test]
    fn per_channel_uses_each_range() {
        let x = Tensor::new(&[[0.5f32, 0.5], [0.5, 0.5]], &Device::Cpu).unwrap();
        // 2 bits: grid {-amax, 0, amax}.
        let q: Vec<Vec<f32>> = fake_quantize_per_channel(&x, &[1.0, 0.5], 0, 2)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(q[0], vec![1.0, 1.0]);
        assert_eq!(q[1], vec![0.5, 0.5]);
    }

    #[test]
    fn enabled_without_range_is_uncalibrated() {
        let mut qz = TensorQuantizer::new("conv1.input", 8, None);
        qz.set_enabled(true);
        let x = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
        assert!(matches!(qz.forward(&x), Err(ExplorerError::Uncalibrated(_))));
        qz.set_enabled(false);
        assert!(qz.forward(&x).is_ok());
    }

    #[test]
    fn calibration_pass_through_then_range() {
        let mut qz = TensorQuantizer::new("fc.input", 8, None);
        qz.set_enabled(true);
        qz.start_calibration(CalibrationMethod::Max);
        let x = Tensor::new(&[0.25f32, -3.0, 1.5], &Device::Cpu).unwrap();
        let y: Vec<f32> = qz.forward(&x).unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![0.25, -3.0, 1.5]);
        qz.finish_calibration().unwrap();
        assert_eq!(qz.amax(), Some(&[3.0f32][..]));
        assert!(!qz.is_calibrating());
    }

    #[test]
    fn finish_without_data_fails() {
        let mut qz = TensorQuantizer::new("fc.input", 8, None);
        qz.start_calibration(CalibrationMethod::Max);
        assert!(qz.finish_calibration().is_err());
    }
}
