//! Inference layers.
//!
//! [`QuantConv2d`] and [`QuantLinear`] carry an input quantiser (per-tensor)
//! and a weight quantiser (per output channel). The fake-quantised weight is
//! cached until the bit width or range changes.
//!
//! # Thread safety
//!
//! The weight cache uses [`parking_lot::Mutex`], so layers are `Send + Sync`
//! and a model can be shared by reference across worker threads.

use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use qexplore_common::Result;

use crate::quantize::TensorQuantizer;

/// Bit width every quantiser starts at.
pub const DEFAULT_NUM_BITS: u32 = 8;

// ── Layer descriptions ──────────────────────────────────────────────────────

/// Layer operation as written in an architecture file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerOp {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        #[serde(default = "one")]
        stride: usize,
        #[serde(default)]
        padding: usize,
        #[serde(default = "one")]
        dilation: usize,
        #[serde(default = "one")]
        groups: usize,
        #[serde(default = "yes")]
        bias: bool,
    },
    Linear {
        in_features: usize,
        out_features: usize,
        #[serde(default = "yes")]
        bias: bool,
    },
    #[serde(rename = "batch_norm2d")]
    BatchNorm2d {
        num_features: usize,
        #[serde(default = "default_eps")]
        eps: f64,
    },
    Relu,
    #[serde(rename = "max_pool2d")]
    MaxPool2d {
        kernel_size: usize,
        #[serde(default)]
        stride: Option<usize>,
    },
    #[serde(rename = "avg_pool2d")]
    AvgPool2d {
        kernel_size: usize,
        #[serde(default)]
        stride: Option<usize>,
    },
    GlobalAvgPool,
    Flatten,
}

fn one() -> usize {
    1
}
fn yes() -> bool {
    true
}
fn default_eps() -> f64 {
    1e-5
}

/// Layer type tag, used by registry predicates and weighting functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Conv2d,
    Linear,
    BatchNorm2d,
    Relu,
    MaxPool2d,
    AvgPool2d,
    GlobalAvgPool,
    Flatten,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Conv2d => "conv2d",
            Self::Linear => "linear",
            Self::BatchNorm2d => "batch_norm2d",
            Self::Relu => "relu",
            Self::MaxPool2d => "max_pool2d",
            Self::AvgPool2d => "avg_pool2d",
            Self::GlobalAvgPool => "global_avg_pool",
            Self::Flatten => "flatten",
        };
        f.write_str(s)
    }
}

// ── QuantParams ─────────────────────────────────────────────────────────────

/// Weights and quantisers shared by the quantisable layer types.
pub struct QuantParams {
    weight: Tensor,
    bias: Option<Tensor>,
    input_quantizer: TensorQuantizer,
    weight_quantizer: TensorQuantizer,
    /// Fake-quantised weight at the current bit width and range.
    cache: Mutex<Option<Tensor>>,
}

impl QuantParams {
    fn new(name: &str, weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            weight,
            bias,
            input_quantizer: TensorQuantizer::new(format!("{name}.input"), DEFAULT_NUM_BITS, None),
            weight_quantizer: TensorQuantizer::new(
                format!("{name}.weight"),
                DEFAULT_NUM_BITS,
                Some(0),
            ),
            cache: Mutex::new(None),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn input_quantizer(&self) -> &TensorQuantizer {
        &self.input_quantizer
    }

    pub fn input_quantizer_mut(&mut self) -> &mut TensorQuantizer {
        &mut self.input_quantizer
    }

    pub fn weight_quantizer(&self) -> &TensorQuantizer {
        &self.weight_quantizer
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims().first().copied().unwrap_or(0)
    }

    pub fn num_params(&self) -> usize {
        self.weight.elem_count() + self.bias.as_ref().map_or(0, |b| b.elem_count())
    }

    pub fn num_bits(&self) -> u32 {
        self.weight_quantizer.num_bits()
    }

    /// Set both quantisers and drop the cached weight.
    pub fn set_num_bits(&mut self, num_bits: u32) {
        self.input_quantizer.set_num_bits(num_bits);
        self.weight_quantizer.set_num_bits(num_bits);
        self.clear_cache();
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.input_quantizer.set_enabled(enabled);
        self.weight_quantizer.set_enabled(enabled);
        self.clear_cache();
    }

    pub fn is_enabled(&self) -> bool {
        self.input_quantizer.is_enabled() && self.weight_quantizer.is_enabled()
    }

    /// Per-output-channel absolute maximum of the weight.
    pub fn calibrate_weights(&mut self) -> Result<()> {
        let amax = self
            .weight
            .to_dtype(DType::F32)?
            .abs()?
            .flatten_from(1)?
            .max(1)?
            .to_vec1::<f32>()?;
        self.weight_quantizer.set_amax(amax);
        self.clear_cache();
        Ok(())
    }

    pub fn set_ranges(&mut self, input_amax: f32, weight_amax: Vec<f32>) {
        self.input_quantizer.set_amax(vec![input_amax]);
        self.weight_quantizer.set_amax(weight_amax);
        self.clear_cache();
    }

    pub fn clear_cache(&mut self) {
        self.cache.get_mut().take();
    }

    /// Weight as seen by the forward pass.
    pub fn quantized_weight(&self) -> Result<Tensor> {
        if !self.weight_quantizer.is_enabled() {
            return Ok(self.weight.clone());
        }
        let mut guard = self.cache.lock();
        if let Some(w) = guard.as_ref() {
            return Ok(w.clone());
        }
        let w = self.weight_quantizer.forward(&self.weight)?;
        *guard = Some(w.clone());
        Ok(w)
    }

    fn replicate(&self) -> Self {
        Self {
            weight: self.weight.clone(),
            bias: self.bias.clone(),
            input_quantizer: self.input_quantizer.replicate(),
            weight_quantizer: self.weight_quantizer.replicate(),
            cache: Mutex::new(None),
        }
    }
}

// ── QuantConv2d ─────────────────────────────────────────────────────────────

pub struct QuantConv2d {
    params: QuantParams,
    stride: usize,
    padding: usize,
    dilation: usize,
    groups: usize,
}

impl QuantConv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
        groups: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels / groups.max(1), kernel_size, kernel_size),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if bias {
            Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.))?)
        } else {
            None
        };
        Ok(Self {
            params: QuantParams::new(name, weight, bias),
            stride,
            padding,
            dilation,
            groups,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.params.input_quantizer.forward(x)?;
        let w = self.params.quantized_weight()?;
        let y = x.conv2d(&w, self.padding, self.stride, self.dilation, self.groups)?;
        match &self.params.bias {
            Some(b) => Ok(y.broadcast_add(&b.reshape((1, b.elem_count(), 1, 1))?)?),
            None => Ok(y),
        }
    }

    fn replicate(&self) -> Self {
        Self {
            params: self.params.replicate(),
            stride: self.stride,
            padding: self.padding,
            dilation: self.dilation,
            groups: self.groups,
        }
    }
}

// ── QuantLinear ─────────────────────────────────────────────────────────────

pub struct QuantLinear {
    params: QuantParams,
}

impl QuantLinear {
    pub fn new(
        name: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_features, in_features),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if bias {
            Some(vb.get_with_hints(out_features, "bias", Init::Const(0.))?)
        } else {
            None
        };
        Ok(Self {
            params: QuantParams::new(name, weight, bias),
        })
    }

    /// `x` is `(batch, in_features)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.params.input_quantizer.forward(x)?;
        let w = self.params.quantized_weight()?;
        let y = x.broadcast_matmul(&w.t()?)?;
        match &self.params.bias {
            Some(b) => Ok(y.broadcast_add(b)?),
            None => Ok(y),
        }
    }
}

// ── BatchNorm2d ─────────────────────────────────────────────────────────────

/// Batch normalisation with frozen running statistics.
#[derive(Clone)]
pub struct BatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    eps: f64,
}

impl BatchNorm2d {
    pub fn new(num_features: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(num_features, "weight", Init::Const(1.))?,
            bias: vb.get_with_hints(num_features, "bias", Init::Const(0.))?,
            running_mean: vb.get_with_hints(num_features, "running_mean", Init::Const(0.))?,
            running_var: vb.get_with_hints(num_features, "running_var", Init::Const(1.))?,
            eps,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let c = self.weight.elem_count();
        let shape = (1, c, 1, 1);
        let inv_std = (self.running_var.affine(1.0, self.eps)?.sqrt()?.recip()? * &self.weight)?;
        let shift = (&self.bias - (&self.running_mean * &inv_std)?)?;
        let y = x.broadcast_mul(&inv_std.reshape(shape)?)?;
        Ok(y.broadcast_add(&shift.reshape(shape)?)?)
    }
}

// ── Layer ───────────────────────────────────────────────────────────────────

/// Any supported layer.
pub enum Layer {
    Conv2d(QuantConv2d),
    Linear(QuantLinear),
    BatchNorm2d(BatchNorm2d),
    Relu,
    MaxPool2d { kernel: usize, stride: usize },
    AvgPool2d { kernel: usize, stride: usize },
    GlobalAvgPool,
    Flatten,
}

impl Layer {
    /// Build a layer; parameters are read from `vb` under `<name>.`.
    pub fn build(name: &str, op: &LayerOp, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp(name);
        Ok(match *op {
            LayerOp::Conv2d {
                in_channels,
                out_channels,
                kernel_size,
                stride,
                padding,
                dilation,
                groups,
                bias,
            } => Self::Conv2d(QuantConv2d::new(
                name,
                in_channels,
                out_channels,
                kernel_size,
                stride,
                padding,
                dilation,
                groups,
                bias,
                vb,
            )?),
            LayerOp::Linear {
                in_features,
                out_features,
                bias,
            } => Self::Linear(QuantLinear::new(name, in_features, out_features, bias, vb)?),
            LayerOp::BatchNorm2d { num_features, eps } => {
                Self::BatchNorm2d(BatchNorm2d::new(num_features, eps, vb)?)
            }
            LayerOp::Relu => Self::Relu,
            LayerOp::MaxPool2d {
                kernel_size,
                stride,
            } => Self::MaxPool2d {
                kernel: kernel_size,
                stride: stride.unwrap_or(kernel_size),
            },
            LayerOp::AvgPool2d {
                kernel_size,
                stride,
            } => Self::AvgPool2d {
                kernel: kernel_size,
                stride: stride.unwrap_or(kernel_size),
            },
            LayerOp::GlobalAvgPool => Self::GlobalAvgPool,
            LayerOp::Flatten => Self::Flatten,
        })
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Conv2d(_) => LayerKind::Conv2d,
            Self::Linear(_) => LayerKind::Linear,
            Self::BatchNorm2d(_) => LayerKind::BatchNorm2d,
            Self::Relu => LayerKind::Relu,
            Self::MaxPool2d { .. } => LayerKind::MaxPool2d,
            Self::AvgPool2d { .. } => LayerKind::AvgPool2d,
            Self::GlobalAvgPool => LayerKind::GlobalAvgPool,
            Self::Flatten => LayerKind::Flatten,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Conv2d(l) => l.forward(x)?,
            Self::Linear(l) => l.forward(x)?,
            Self::BatchNorm2d(l) => l.forward(x)?,
            Self::Relu => x.relu()?,
            Self::MaxPool2d { kernel, stride } => {
                x.max_pool2d_with_stride((*kernel, *kernel), (*stride, *stride))?
            }
            Self::AvgPool2d { kernel, stride } => {
                x.avg_pool2d_with_stride((*kernel, *kernel), (*stride, *stride))?
            }
            Self::GlobalAvgPool => x.mean_keepdim(3)?.mean_keepdim(2)?.flatten_from(1)?,
            Self::Flatten => x.flatten_from(1)?,
        })
    }

    /// Quantisation state, for quantisable layers.
    pub fn quant_params(&self) -> Option<&QuantParams> {
        match self {
            Self::Conv2d(l) => Some(&l.params),
            Self::Linear(l) => Some(&l.params),
            _ => None,
        }
    }

    pub fn quant_params_mut(&mut self) -> Option<&mut QuantParams> {
        match self {
            Self::Conv2d(l) => Some(&mut l.params),
            Self::Linear(l) => Some(&mut l.params),
            _ => None,
        }
    }

    pub fn num_params(&self) -> usize {
        match self {
            Self::Conv2d(l) => l.params.num_params(),
            Self::Linear(l) => l.params.num_params(),
            Self::BatchNorm2d(l) => 2 * l.weight.elem_count(),
            _ => 0,
        }
    }

    /// Independent copy: shared weight storage, fresh caches.
    pub fn replicate(&self) -> Self {
        match self {
            Self::Conv2d(l) => Self::Conv2d(l.replicate()),
            Self::Linear(l) => Self::Linear(QuantLinear {
                params: l.params.replicate(),
            }),
            Self::BatchNorm2d(l) => Self::BatchNorm2d(l.clone()),
            Self::Relu => Self::Relu,
            Self::MaxPool2d { kernel, stride } => Self::MaxPool2d {
                kernel: *kernel,
                stride: *stride,
            },
            Self::AvgPool2d { kernel, stride } => Self::AvgPool2d {
                kernel: *kernel,
                stride: *stride,
            },
            Self::GlobalAvgPool => Self::GlobalAvgPool,
            Self::Flatten => Self::Flatten,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
