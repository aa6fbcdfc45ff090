//! Layer-graph network executor.
//!
//! An [`Architecture`] lists layers and the nodes that apply them. Layers live
//! in an arena addressed by [`LayerId`]; nodes form a petgraph DAG whose
//! execution order is fixed once at build time (Kahn's algorithm, ties broken
//! by declaration order). Several nodes may reference the same layer (weight
//! tying); a node without a layer sums its inputs (residual add).
//!
//! When `nodes` is empty the layers form a plain sequential chain.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use qexplore_common::{ExplorerError, Result};

use crate::layers::{Layer, LayerOp};

/// Reserved node name for the network input.
pub const INPUT_NODE: &str = "input";

// ── Architecture description ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(flatten)]
    pub op: LayerOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    /// Layer applied by this node; `None` sums the inputs.
    #[serde(default)]
    pub layer: Option<String>,
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub name: String,
    /// Shape of one sample, without the batch dimension.
    pub input_shape: Vec<usize>,
    pub layers: Vec<LayerSpec>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Output node; defaults to the last node.
    #[serde(default)]
    pub output: Option<String>,
}

impl Architecture {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ExplorerError::config(format!("cannot read architecture {}: {e}", path.display()))
        })?;
        serde_json::from_str(&json).map_err(|e| {
            ExplorerError::config(format!("malformed architecture {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Explicit nodes, or one node per layer chained from the input.
    pub fn resolved_nodes(&self) -> Vec<NodeSpec> {
        if !self.nodes.is_empty() {
            return self.nodes.clone();
        }
        let mut prev = INPUT_NODE.to_string();
        self.layers
            .iter()
            .map(|l| {
                let node = NodeSpec {
                    name: l.name.clone(),
                    layer: Some(l.name.clone()),
                    inputs: vec![prev.clone()],
                };
                prev = l.name.clone();
                node
            })
            .collect()
    }

    /// LeNet-5 for 1×28×28 inputs and 10 classes.
    pub fn lenet5() -> Self {
        let layer = |name: &str, op: LayerOp| LayerSpec {
            name: name.to_string(),
            op,
        };
        let conv = |i, o, pad| LayerOp::Conv2d {
            in_channels: i,
            out_channels: o,
            kernel_size: 5,
            stride: 1,
            padding: pad,
            dilation: 1,
            groups: 1,
            bias: true,
        };
        let fc = |i, o| LayerOp::Linear {
            in_features: i,
            out_features: o,
            bias: true,
        };
        let pool = || LayerOp::MaxPool2d {
            kernel_size: 2,
            stride: None,
        };
        Self {
            name: "lenet5".to_string(),
            input_shape: vec![1, 28, 28],
            layers: vec![
                layer("conv1", conv(1, 6, 2)),
                layer("relu1", LayerOp::Relu),
                layer("pool1", pool()),
                layer("conv2", conv(6, 16, 0)),
                layer("relu2", LayerOp::Relu),
                layer("pool2", pool()),
                layer("flatten", LayerOp::Flatten),
                layer("fc1", fc(400, 120)),
                layer("relu3", LayerOp::Relu),
                layer("fc2", fc(120, 84)),
                layer("relu4", LayerOp::Relu),
                layer("fc3", fc(84, 10)),
            ],
            nodes: Vec::new(),
            output: None,
        }
    }
}

// ── Network ─────────────────────────────────────────────────────────────────

/// Stable index of a layer in the network's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub usize);

#[derive(Debug, Clone)]
enum NodeOp {
    Input,
    Layer(LayerId),
    Add,
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    op: NodeOp,
    inputs: Vec<NodeIndex>,
}

/// An executable layer graph.
pub struct Network {
    name: String,
    input_shape: Vec<usize>,
    layers: Vec<Layer>,
    layer_names: Vec<String>,
    graph: DiGraph<Node, ()>,
    order: Vec<NodeIndex>,
    output: NodeIndex,
}

impl Network {
    /// Build from an architecture; parameters come from `vb` as `<layer>.<param>`.
    pub fn build(arch: &Architecture, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(arch.layers.len());
        let mut layer_names = Vec::with_capacity(arch.layers.len());
        let mut layer_ids: HashMap<&str, LayerId> = HashMap::new();
        for spec in &arch.layers {
            if layer_ids.contains_key(spec.name.as_str()) {
                return Err(ExplorerError::config(format!("duplicate layer '{}'", spec.name)));
            }
            layer_ids.insert(&spec.name, LayerId(layers.len()));
            layers.push(Layer::build(&spec.name, &spec.op, vb.clone())?);
            layer_names.push(spec.name.clone());
        }

        let specs = arch.resolved_nodes();
        if specs.is_empty() {
            return Err(ExplorerError::config(format!("architecture '{}' has no nodes", arch.name)));
        }
        let mut graph: DiGraph<Node, ()> = DiGraph::new();
        let mut node_ids: HashMap<String, NodeIndex> = HashMap::new();
        let input = graph.add_node(Node {
            name: INPUT_NODE.to_string(),
            op: NodeOp::Input,
            inputs: Vec::new(),
        });
        node_ids.insert(INPUT_NODE.to_string(), input);

        for spec in &specs {
            if node_ids.contains_key(&spec.name) {
                return Err(ExplorerError::config(format!("duplicate node '{}'", spec.name)));
            }
            let op = match &spec.layer {
                Some(layer) => {
                    let id = layer_ids.get(layer.as_str()).copied().ok_or_else(|| {
                        ExplorerError::config(format!(
                            "node '{}' references unknown layer '{layer}'",
                            spec.name
                        ))
                    })?;
                    if spec.inputs.len() != 1 {
                        return Err(ExplorerError::config(format!(
                            "layer node '{}' needs exactly one input",
                            spec.name
                        )));
                    }
                    NodeOp::Layer(id)
                }
                None => {
                    if spec.inputs.len() < 2 {
                        return Err(ExplorerError::config(format!(
                            "add node '{}' needs at least two inputs",
                            spec.name
                        )));
                    }
                    NodeOp::Add
                }
            };
            let idx = graph.add_node(Node {
                name: spec.name.clone(),
                op,
                inputs: Vec::new(),
            });
            node_ids.insert(spec.name.clone(), idx);
        }

        for spec in &specs {
            let idx = node_ids[&spec.name];
            let mut inputs = Vec::with_capacity(spec.inputs.len());
            for src in &spec.inputs {
                let src_idx = node_ids.get(src).copied().ok_or_else(|| {
                    ExplorerError::config(format!("node '{}' has unknown input '{src}'", spec.name))
                })?;
                graph.add_edge(src_idx, idx, ());
                inputs.push(src_idx);
            }
            graph[idx].inputs = inputs;
        }

        let order = execution_order(&graph)?;
        let output = match &arch.output {
            Some(name) => node_ids.get(name).copied().ok_or_else(|| {
                ExplorerError::config(format!("unknown output node '{name}'"))
            })?,
            None => node_ids[&specs[specs.len() - 1].name],
        };

        tracing::debug!(
            network = %arch.name,
            layers = layers.len(),
            nodes = graph.node_count(),
            "network built"
        );
        Ok(Self {
            name: arch.name.clone(),
            input_shape: arch.input_shape.clone(),
            layers,
            layer_names,
            graph,
            order,
            output,
        })
    }

    /// Read an architecture file and its safetensors weights.
    pub fn load(arch_path: &Path, weights_path: &Path, device: &Device) -> Result<Self> {
        let arch = Architecture::load(arch_path)?;
        let tensors = candle_core::safetensors::load(weights_path, device).map_err(|e| {
            ExplorerError::config(format!("cannot load weights {}: {e}", weights_path.display()))
        })?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::build(&arch, vb)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, id: LayerId) -> &Layer {
        &self.layers[id.0]
    }

    pub fn layer_mut(&mut self, id: LayerId) -> &mut Layer {
        &mut self.layers[id.0]
    }

    pub fn layer_name(&self, id: LayerId) -> &str {
        &self.layer_names[id.0]
    }

    /// Layers in execution order, each listed at its first use.
    pub fn traversal(&self) -> Vec<LayerId> {
        let mut seen = vec![false; self.layers.len()];
        let mut out = Vec::new();
        for &idx in &self.order {
            if let NodeOp::Layer(id) = self.graph[idx].op {
                if !seen[id.0] {
                    seen[id.0] = true;
                    out.push(id);
                }
            }
        }
        out
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut values: Vec<Option<Tensor>> = vec![None; self.graph.node_count()];
        for &idx in &self.order {
            let node = &self.graph[idx];
            let value = match node.op {
                NodeOp::Input => x.clone(),
                NodeOp::Layer(id) => {
                    let input = self.value(&values, node.inputs[0], node)?;
                    self.layers[id.0].forward(input)?
                }
                NodeOp::Add => {
                    let mut acc = self.value(&values, node.inputs[0], node)?.clone();
                    for &src in &node.inputs[1..] {
                        acc = (acc + self.value(&values, src, node)?)?;
                    }
                    acc
                }
            };
            values[idx.index()] = Some(value);
        }
        values[self.output.index()]
            .take()
            .ok_or_else(|| ExplorerError::config("output node was not evaluated"))
    }

    fn value<'a>(
        &self,
        values: &'a [Option<Tensor>],
        src: NodeIndex,
        node: &Node,
    ) -> Result<&'a Tensor> {
        values[src.index()].as_ref().ok_or_else(|| {
            ExplorerError::config(format!(
                "node '{}' ran before its input '{}'",
                node.name, self.graph[src].name
            ))
        })
    }

    /// Independent copy sharing weight storage.
    pub fn replicate(&self) -> Self {
        Self {
            name: self.name.clone(),
            input_shape: self.input_shape.clone(),
            layers: self.layers.iter().map(Layer::replicate).collect(),
            layer_names: self.layer_names.clone(),
            graph: self.graph.clone(),
            order: self.order.clone(),
            output: self.output,
        }
    }
}

/// Kahn's algorithm; among ready nodes the earliest declared runs first.
fn execution_order(graph: &DiGraph<Node, ()>) -> Result<Vec<NodeIndex>> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(i)) = ready.pop() {
        let idx = NodeIndex::new(i);
        order.push(idx);
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse(next.index()));
            }
        }
    }
    if order.len() != graph.node_count() {
        return Err(ExplorerError::config("layer graph contains a cycle"));
    }
    Ok(order)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn conv(name: &str, c: usize) -> LayerSpec {
        LayerSpec {
            name: name.to_string(),
            op: LayerOp::Conv2d {
                in_channels: c,
                out_channels: c,
                kernel_size: 1,
                stride: 1,
                padding: 0,
                dilation: 1,
                groups: 1,
                bias: true,
            },
        }
    }

    fn node(name: &str, layer: Option<&str>, inputs: &[&str]) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            layer: layer.map(str::to_string),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn build(arch: &Architecture) -> Result<Network> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Network::build(arch, vb)
    }

    #[test]
    fn lenet5_forward_shape() {
        let net = build(&Architecture::lenet5()).unwrap();
        let x = Tensor::zeros((2, 1, 28, 28), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[2, 10]);
        let names: Vec<&str> = net.traversal().iter().map(|&id| net.layer_name(id)).collect();
        assert_eq!(names[0], "conv1");
        assert_eq!(names.len(), 12);
    }

    #[test]
    fn residual_add_and_shared_layer() {
        // Declared out of execution order; conv_a is applied twice.
        let arch = Architecture {
            name: "residual".into(),
            input_shape: vec![2, 3, 3],
            layers: vec![conv("conv_b", 2), conv("conv_a", 2)],
            nodes: vec![
                node("a1", Some("conv_a"), &["input"]),
                node("b", Some("conv_b"), &["a1"]),
                node("sum", None, &["a1", "b"]),
                node("a2", Some("conv_a"), &["sum"]),
            ],
            output: None,
        };
        let net = build(&arch).unwrap();
        let names: Vec<&str> = net.traversal().iter().map(|&id| net.layer_name(id)).collect();
        assert_eq!(names, vec!["conv_a", "conv_b"]);
        let x = Tensor::ones((1, 2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[1, 2, 3, 3]);
    }

    #[test]
    fn rejects_cycles_and_unknown_references() {
        let mut arch = Architecture {
            name: "cyclic".into(),
            input_shape: vec![1, 1, 1],
            layers: vec![conv("c1", 1), conv("c2", 1)],
            nodes: vec![node("n1", Some("c1"), &["n2"]), node("n2", Some("c2"), &["n1"])],
            output: None,
        };
        assert!(matches!(build(&arch), Err(ExplorerError::Configuration(_))));

        arch.nodes = vec![node("n1", Some("missing"), &["input"])];
        assert!(build(&arch).is_err());

        arch.nodes = vec![node("n1", Some("c1"), &["nowhere"])];
        assert!(build(&arch).is_err());

        arch.nodes = vec![node("input", Some("c1"), &["input"])];
        assert!(build(&arch).is_err());
    }

    #[test]
    fn load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let arch_path = dir.path().join("arch.json");
        let weights_path = dir.path().join("weights.safetensors");
        let arch = Architecture::lenet5();
        arch.save(&arch_path).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let original = Network::build(&arch, vb).unwrap();
        varmap.save(&weights_path).unwrap();

        let loaded = Network::load(&arch_path, &weights_path, &Device::Cpu).unwrap();
        let x = Tensor::ones((1, 1, 28, 28), DType::F32, &Device::Cpu).unwrap();
        let a: Vec<f32> = original.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = loaded.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sequential_json_parses() {
        let json = r#"{
            "name": "tiny",
            "input_shape": [4],
            "layers": [
                { "name": "fc", "type": "linear", "in_features": 4, "out_features": 2 },
                { "name": "act", "type": "relu" }
            ]
        }"#;
        let arch: Architecture = serde_json::from_str(json).unwrap();
        assert_eq!(arch.resolved_nodes().len(), 2);
        let net = build(&arch).unwrap();
        let x = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[3, 2]);
    }
}
