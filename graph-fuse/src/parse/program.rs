//! JSON program description <-> [`Graph`].
//!
//! The format mirrors what test harnesses usually hand to an inference
//! config: a list of ops with slot -> tensor bindings and typed attributes,
//! tensor metadata for weights and inputs, and the names of the outputs.
//!
//! ```json
//! {
//!   "ops": [{ "type": "relu", "inputs": { "X": ["x"] }, "outputs": { "Out": ["y"] } }],
//!   "inputs": { "x": { "shape": [1, 48, 64, 64] } },
//!   "outputs": ["y"]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir::graph::topological_sort;
use crate::ir::{Attrs, DType, Graph, Node, Shape, TensorKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub ops: Vec<OpDesc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub weights: BTreeMap<String, TensorDesc>,
    #[serde(default)]
    pub inputs: BTreeMap<String, TensorDesc>,
    /// Optional metadata for intermediates and outputs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tensors: BTreeMap<String, TensorDesc>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDesc {
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDesc {
    /// Absent for tensors of unknown rank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

fn default_dtype() -> String {
    DType::F32.as_str().to_string()
}

impl TensorDesc {
    fn shape(&self) -> Shape {
        match &self.shape {
            Some(dims) => Shape::Known(dims.clone()),
            None => Shape::Dynamic,
        }
    }

    fn dtype(&self, name: &str) -> Result<DType> {
        self.dtype
            .parse()
            .map_err(|e| Error::Parse(format!("tensor `{name}`: {e}")))
    }
}

/// Build a graph from a program. Ops may be listed in any order that has a
/// valid topological sort.
pub fn from_program(program: &Program) -> Result<Graph> {
    let mut graph = Graph::new();

    for (name, desc) in &program.inputs {
        graph.add_tensor(name, desc.shape(), desc.dtype(name)?, TensorKind::Input)?;
    }
    for (name, desc) in &program.weights {
        graph.add_tensor(name, desc.shape(), desc.dtype(name)?, TensorKind::Weight)?;
    }

    let produced: HashSet<&str> = program
        .ops
        .iter()
        .flat_map(|op| op.outputs.values().flatten())
        .map(String::as_str)
        .collect();

    for name in &program.outputs {
        if !produced.contains(name.as_str()) {
            return Err(Error::Parse(format!("output `{name}` is not produced by any op")));
        }
        add_produced(&mut graph, program, name, TensorKind::Output)?;
    }

    let nodes: Vec<Node> = program
        .ops
        .iter()
        .map(|op| Node {
            op_type: op.op_type.clone(),
            inputs: op.inputs.clone(),
            outputs: op.outputs.clone(),
            attrs: op.attrs.clone(),
        })
        .collect();

    for node in &nodes {
        for name in node.output_names() {
            if graph.tensor(name).is_none() {
                add_produced(&mut graph, program, name, TensorKind::Intermediate)?;
            }
        }
        for name in node.input_names() {
            if graph.tensor(name).is_none() && !produced.contains(name) {
                return Err(Error::Parse(format!(
                    "`{}` reads `{name}`, which is neither an input, a weight nor produced",
                    node.op_type
                )));
            }
        }
    }

    let refs: Vec<&Node> = nodes.iter().collect();
    let order = topological_sort(&refs)?;
    let mut slots: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();
    for i in order {
        if let Some(node) = slots[i].take() {
            graph.add_node(node)?;
        }
    }
    Ok(graph)
}

fn add_produced(graph: &mut Graph, program: &Program, name: &str, kind: TensorKind) -> Result<()> {
    let (shape, dtype) = match program.tensors.get(name) {
        Some(desc) => (desc.shape(), desc.dtype(name)?),
        None => (Shape::Dynamic, DType::F32),
    };
    graph.add_tensor(name, shape, dtype, kind)
}

/// Serialize a graph back to a program, ops in execution order.
pub fn to_program(graph: &Graph) -> Program {
    let ops = graph
        .nodes()
        .map(|(_, node)| OpDesc {
            op_type: node.op_type.clone(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
            attrs: node.attrs.clone(),
        })
        .collect();

    let mut program = Program {
        ops,
        weights: BTreeMap::new(),
        inputs: BTreeMap::new(),
        tensors: BTreeMap::new(),
        outputs: graph.outputs.clone(),
    };
    for tensor in graph.tensors() {
        let desc = TensorDesc {
            shape: tensor.shape.dims().map(<[usize]>::to_vec),
            dtype: tensor.dtype.as_str().to_string(),
        };
        let table = match tensor.kind {
            TensorKind::Input => &mut program.inputs,
            TensorKind::Weight => &mut program.weights,
            TensorKind::Intermediate | TensorKind::Output => &mut program.tensors,
        };
        table.insert(tensor.name.clone(), desc);
    }
    program
}

pub fn load(path: impl AsRef<Path>) -> Result<Graph> {
    let data = fs::read_to_string(path)?;
    let program: Program = serde_json::from_str(&data)?;
    from_program(&program)
}

pub fn save(graph: &Graph, path: impl AsRef<Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(&to_program(graph))?;
    fs::write(path, json)?;
    Ok(())
}
