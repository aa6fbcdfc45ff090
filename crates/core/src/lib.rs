//! # qexplore-core: Quantised Model Engine
//!
//! Everything needed to load a trained network and run it at arbitrary
//! per-layer bit widths lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`quantize`] | symmetric fake quantisation, `TensorQuantizer` |
//! | [`calibration`] | max / histogram-percentile calibrators, calibration file |
//! | [`layers`] | `QuantConv2d`, `QuantLinear`, `BatchNorm2d`, pooling |
//! | [`network`] | `Architecture`, `Network` (layer arena + petgraph DAG) |
//! | [`weighting`] | `BitWeighting` trait, built-in `WeightingFunction`s |
//! | [`adapter`] | `QuantizedModel`: layer registry, bit-width mutation |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **`Send + Sync`-safe.** Weight caches use `parking_lot::Mutex`, not `RefCell`.
//! 3. **Deterministic.** Same weights + same bit widths + same ranges = same output.

pub mod adapter;
pub mod calibration;
pub mod layers;
pub mod network;
pub mod quantize;
pub mod weighting;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use adapter::{
    conv2d_or_linear_predicate, conv2d_predicate, linear_predicate, predicate_for,
    LayerPredicate, QuantizedModel,
};
pub use calibration::{CalibrationParameters, LayerCalibration};
pub use layers::{Layer, LayerKind, LayerOp};
pub use network::{Architecture, LayerId, LayerSpec, Network, NodeSpec};
pub use quantize::{fake_quantize, fake_quantize_per_channel, TensorQuantizer};
pub use weighting::{BitWeighting, LayerInfo, WeightingFunction};
