//! Small networks and data shared by the search tests.

use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use qexplore_common::{CalibrationMethod, DataLoader, SampleDataset, SampleSelection};
use qexplore_core::{
    conv2d_predicate, Architecture, LayerOp, LayerSpec, Network, QuantizedModel,
    WeightingFunction,
};

/// `n` 1×1 convolutions over 2 channels followed by global average pooling,
/// so the output is a 2-class logit vector.
pub fn conv_chain(n: usize) -> Architecture {
    let mut layers = Vec::new();
    for i in 0..n {
        layers.push(LayerSpec {
            name: format!("conv{i}"),
            op: LayerOp::Conv2d {
                in_channels: 2,
                out_channels: 2,
                kernel_size: 1,
                stride: 1,
                padding: 0,
                dilation: 1,
                groups: 1,
                bias: true,
            },
        });
    }
    layers.push(LayerSpec {
        name: "pool".into(),
        op: LayerOp::GlobalAvgPool,
    });
    Architecture {
        name: format!("chain{n}"),
        input_shape: vec![2, 4, 4],
        layers,
        nodes: Vec::new(),
        output: None,
    }
}

pub fn model(n: usize) -> QuantizedModel {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let net = Network::build(&conv_chain(n), vb).unwrap();
    QuantizedModel::new(
        net,
        Device::Cpu,
        conv2d_predicate,
        Arc::new(WeightingFunction::BitsSum),
    )
    .unwrap()
}

pub fn loader() -> DataLoader {
    let n = 12;
    let inputs: Vec<f32> = (0..n * 32).map(|i| ((i * 7 % 17) as f32 - 8.0) / 4.0).collect();
    let labels: Vec<u32> = (0..n as u32).map(|i| i % 2).collect();
    let ds = Arc::new(SampleDataset::from_vec(&[2, 4, 4], inputs, labels).unwrap());
    DataLoader::new(ds, 5, None, SampleSelection::Sequential, &Device::Cpu).unwrap()
}

pub fn calibrated_model(n: usize) -> QuantizedModel {
    let mut m = model(n);
    m.run_calibration(&loader(), CalibrationMethod::Max, false).unwrap();
    m
}
