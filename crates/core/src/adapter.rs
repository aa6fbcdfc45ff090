//! Quantised model adapter.
//!
//! [`QuantizedModel`] wraps a [`Network`] and owns the registry of layers that
//! take part in the exploration. The registry is fixed at construction: the
//! network is walked in execution order and every layer accepted by the
//! predicate is recorded once, at its first use. Bit-width vectors are indexed
//! by registry position.
//!
//! Mutation goes through `&mut self`, so one instance can never be reconfigured
//! from two threads at once; parallel evaluation uses [`QuantizedModel::replicate`].

use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use qexplore_common::{
    progress_bar, CalibrationMethod, DataLoader, ExplorerError, LayerSelector, Result,
    MAX_SUPPORTED_BITS, MIN_SUPPORTED_BITS,
};

use crate::calibration::{CalibrationParameters, LayerCalibration};
use crate::layers::{LayerKind, QuantParams, DEFAULT_NUM_BITS};
use crate::network::{LayerId, Network};
use crate::weighting::{BitWeighting, LayerInfo};

/// Decides which layer kinds are registered.
pub type LayerPredicate = fn(LayerKind) -> bool;

pub fn conv2d_predicate(kind: LayerKind) -> bool {
    kind == LayerKind::Conv2d
}

pub fn linear_predicate(kind: LayerKind) -> bool {
    kind == LayerKind::Linear
}

pub fn conv2d_or_linear_predicate(kind: LayerKind) -> bool {
    matches!(kind, LayerKind::Conv2d | LayerKind::Linear)
}

pub fn predicate_for(selector: LayerSelector) -> LayerPredicate {
    match selector {
        LayerSelector::Conv2d => conv2d_predicate,
        LayerSelector::Linear => linear_predicate,
        LayerSelector::Conv2dAndLinear => conv2d_or_linear_predicate,
    }
}

// ── QuantizedModel ──────────────────────────────────────────────────────────

pub struct QuantizedModel {
    network: Network,
    device: Device,
    registry: Vec<LayerId>,
    layer_info: Vec<LayerInfo>,
    weighting: Arc<dyn BitWeighting>,
    bit_limits: (u32, u32),
}

impl QuantizedModel {
    /// Register matching layers and enable their quantisers at 8 bits.
    pub fn new(
        network: Network,
        device: Device,
        predicate: LayerPredicate,
        weighting: Arc<dyn BitWeighting>,
    ) -> Result<Self> {
        let registry: Vec<LayerId> = network
            .traversal()
            .into_iter()
            .filter(|&id| {
                let layer = network.layer(id);
                predicate(layer.kind()) && layer.quant_params().is_some()
            })
            .collect();
        if registry.is_empty() {
            return Err(ExplorerError::config(format!(
                "network '{}' has no quantizable layers for the selected predicate",
                network.name()
            )));
        }
        let layer_info = registry
            .iter()
            .map(|&id| {
                let layer = network.layer(id);
                LayerInfo {
                    name: network.layer_name(id).to_string(),
                    kind: layer.kind(),
                    num_params: layer.num_params(),
                }
            })
            .collect();

        let mut model = Self {
            network,
            device,
            registry,
            layer_info,
            weighting,
            bit_limits: (MIN_SUPPORTED_BITS, MAX_SUPPORTED_BITS),
        };
        model.for_each_registered(|p| {
            p.set_num_bits(DEFAULT_NUM_BITS);
            p.set_enabled(true);
        });
        tracing::info!(
            network = %model.network.name(),
            layers = model.registry.len(),
            "quantizable layers registered"
        );
        Ok(model)
    }

    /// Narrow the legal bit-width range checked by [`set_layer_bit_widths`](Self::set_layer_bit_widths).
    pub fn with_bit_limits(mut self, lower: u32, upper: u32) -> Self {
        self.bit_limits = (lower, upper);
        self
    }

    pub fn bit_limits(&self) -> (u32, u32) {
        self.bit_limits
    }

    pub fn num_layers(&self) -> usize {
        self.registry.len()
    }

    /// Registered layers in registry order.
    pub fn layers(&self) -> &[LayerInfo] {
        &self.layer_info
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The underlying network with its current quantisation state.
    pub fn model(&self) -> &Network {
        &self.network
    }

    fn for_each_registered(&mut self, mut f: impl FnMut(&mut QuantParams)) {
        for &id in &self.registry {
            if let Some(p) = self.network.layer_mut(id).quant_params_mut() {
                f(p);
            }
        }
    }

    fn registered_params(&self) -> impl Iterator<Item = &QuantParams> + '_ {
        self.registry
            .iter()
            .filter_map(|&id| self.network.layer(id).quant_params())
    }

    // ── Bit widths ──────────────────────────────────────────────────────────

    /// Check a vector against the registry size and the legal range.
    pub fn validate_bit_widths(&self, bits: &[u32]) -> Result<()> {
        let (min, max) = self.bit_limits;
        let reason = if bits.len() != self.registry.len() {
            Some("length does not match the number of quantizable layers")
        } else if bits.iter().any(|&b| b < min || b > max) {
            Some("value out of range")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ExplorerError::InvalidBitWidths {
                reason,
                got: bits.to_vec(),
                expected: self.registry.len(),
                min,
                max,
            }),
            None => Ok(()),
        }
    }

    /// Set input and weight bit width of every registered layer.
    pub fn set_layer_bit_widths(&mut self, bits: &[u32]) -> Result<()> {
        self.validate_bit_widths(bits)?;
        for (&id, &b) in self.registry.iter().zip(bits) {
            if let Some(p) = self.network.layer_mut(id).quant_params_mut() {
                p.set_num_bits(b);
            }
        }
        tracing::trace!(bits = ?bits, "bit widths applied");
        Ok(())
    }

    pub fn layer_bit_widths(&self) -> Vec<u32> {
        self.registered_params().map(QuantParams::num_bits).collect()
    }

    pub fn enable_quantization(&mut self) {
        self.for_each_registered(|p| p.set_enabled(true));
    }

    pub fn disable_quantization(&mut self) {
        self.for_each_registered(|p| p.set_enabled(false));
    }

    pub fn is_quantization_enabled(&self) -> bool {
        self.registered_params().all(QuantParams::is_enabled)
    }

    /// Cost of `bits` under the configured weighting function.
    pub fn bit_weighted_cost(&self, bits: &[u32]) -> f64 {
        self.weighting.cost(bits, &self.layer_info)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.network.forward(x)
    }

    // ── Calibration ─────────────────────────────────────────────────────────

    /// One pass over `loader` collecting input ranges with quantisation off;
    /// weight ranges are per-channel maxima. Quantisation is re-enabled after.
    pub fn run_calibration(
        &mut self,
        loader: &DataLoader,
        method: CalibrationMethod,
        progress: bool,
    ) -> Result<()> {
        tracing::info!(
            samples = loader.len(),
            method = ?method,
            "collecting calibration statistics"
        );
        self.disable_quantization();
        self.for_each_registered(|p| p.input_quantizer_mut().start_calibration(method));

        let pb = progress_bar(loader.num_batches() as u64, "batches", progress)?;
        let pass = || -> Result<()> {
            for batch in loader.batches() {
                let (inputs, _labels) = batch?;
                self.network.forward(&inputs)?;
                pb.inc(1);
            }
            Ok(())
        };
        let outcome = pass();
        pb.finish_and_clear();

        let mut finish = Ok(());
        for &id in &self.registry {
            if let Some(p) = self.network.layer_mut(id).quant_params_mut() {
                let done = p.input_quantizer_mut().finish_calibration();
                if finish.is_ok() {
                    finish = done;
                }
                if finish.is_ok() {
                    finish = p.calibrate_weights();
                }
            }
        }
        self.enable_quantization();
        outcome?;
        finish?;

        for (info, p) in self.layer_info.iter().zip(self.registered_params()) {
            tracing::debug!(
                layer = %info.name,
                input_amax = ?p.input_quantizer().amax(),
                "calibrated"
            );
        }
        Ok(())
    }

    /// Current ranges of every registered layer.
    pub fn calibration_parameters(&self) -> Result<CalibrationParameters> {
        let layers = self
            .registered_params()
            .map(|p| {
                let input_amax = match p.input_quantizer().amax() {
                    Some([a]) => *a,
                    _ => {
                        return Err(ExplorerError::Uncalibrated(
                            p.input_quantizer().name().to_string(),
                        ))
                    }
                };
                let weight_amax = p
                    .weight_quantizer()
                    .amax()
                    .ok_or_else(|| {
                        ExplorerError::Uncalibrated(p.weight_quantizer().name().to_string())
                    })?
                    .to_vec();
                Ok(LayerCalibration {
                    input_amax,
                    weight_amax,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CalibrationParameters { layers })
    }

    fn check_compatible(&self, params: &CalibrationParameters) -> std::result::Result<(), String> {
        if params.num_layers() != self.registry.len() {
            return Err(format!(
                "recorded {} layers, model has {} quantizable layers",
                params.num_layers(),
                self.registry.len()
            ));
        }
        for (i, (layer, p)) in params.layers.iter().zip(self.registered_params()).enumerate() {
            if layer.weight_amax.len() != p.out_channels() {
                return Err(format!(
                    "layer {i} ({}) recorded {} channels, model has {}",
                    self.layer_info[i].name,
                    layer.weight_amax.len(),
                    p.out_channels()
                ));
            }
        }
        Ok(())
    }

    pub fn apply_calibration(&mut self, params: &CalibrationParameters) -> Result<()> {
        self.check_compatible(params).map_err(ExplorerError::Configuration)?;
        self.install(params);
        Ok(())
    }

    fn install(&mut self, params: &CalibrationParameters) {
        for (&id, layer) in self.registry.iter().zip(&params.layers) {
            if let Some(p) = self.network.layer_mut(id).quant_params_mut() {
                p.set_ranges(layer.input_amax, layer.weight_amax.clone());
            }
        }
    }

    pub fn save_parameters(&self, path: &Path) -> Result<()> {
        let params = self.calibration_parameters()?;
        params.save(path)?;
        tracing::info!(path = %path.display(), layers = params.num_layers(), "calibration saved");
        Ok(())
    }

    pub fn load_parameters(&mut self, path: &Path) -> Result<()> {
        let params = CalibrationParameters::load(path)?;
        self.check_compatible(&params)
            .map_err(|reason| ExplorerError::calibration_file(path, reason))?;
        self.install(&params);
        tracing::info!(path = %path.display(), layers = params.num_layers(), "calibration loaded");
        Ok(())
    }

    /// Independent copy: same weights, bit widths and ranges, fresh caches.
    pub fn replicate(&self) -> Self {
        Self {
            network: self.network.replicate(),
            device: self.device.clone(),
            registry: self.registry.clone(),
            layer_info: self.layer_info.clone(),
            weighting: Arc::clone(&self.weighting),
            bit_limits: self.bit_limits,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
