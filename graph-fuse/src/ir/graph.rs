//! Core graph types: tensors, nodes and the mutable dataflow graph.
//!
//! Nodes live in an arena so their ids stay stable while passes remove and
//! insert nodes around them. The execution order is kept explicitly in
//! `order` and is always a valid topological order: every mutation is
//! checked against the full dependency invariant before it is committed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::ir::attr::Attrs;

/// Stable identity of a node inside one [`Graph`].
pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Known(Vec<usize>),
    /// Rank not known until runtime.
    Dynamic,
}

impl Shape {
    pub fn dims(&self) -> Option<&[usize]> {
        match self {
            Shape::Known(dims) => Some(dims),
            Shape::Dynamic => None,
        }
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims().map(|d| d.len())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::Known(dims)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    I8,
    U8,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::I64 => "int64",
            DType::I32 => "int32",
            DType::I8 => "int8",
            DType::U8 => "uint8",
        }
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "float32" | "f32" => Ok(DType::F32),
            "float16" | "f16" => Ok(DType::F16),
            "int64" | "i64" => Ok(DType::I64),
            "int32" | "i32" => Ok(DType::I32),
            "int8" | "i8" => Ok(DType::I8),
            "uint8" | "u8" => Ok(DType::U8),
            other => Err(format!("unknown dtype `{other}`")),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    /// Graph input - provided by caller
    Input,
    /// Weights/biases - constant, known before execution
    Weight,
    /// Intermediate activation - produced and consumed inside the graph
    Intermediate,
    /// Graph output - returned to caller
    Output,
}

impl TensorKind {
    /// Inputs and weights exist before any node runs.
    pub fn is_external(&self) -> bool {
        matches!(self, TensorKind::Input | TensorKind::Weight)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Shape,
    pub dtype: DType,
    pub kind: TensorKind,
}

/// One operator. Slots map to tensor names, so edges are implicit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub op_type: String,
    pub inputs: BTreeMap<String, Vec<String>>,
    pub outputs: BTreeMap<String, Vec<String>>,
    pub attrs: Attrs,
}

impl Node {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Default::default()
        }
    }

    pub fn input(mut self, slot: &str, tensor: &str) -> Self {
        self.inputs
            .entry(slot.to_string())
            .or_default()
            .push(tensor.to_string());
        self
    }

    pub fn output(mut self, slot: &str, tensor: &str) -> Self {
        self.outputs
            .entry(slot.to_string())
            .or_default()
            .push(tensor.to_string());
        self
    }

    pub fn attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = attrs;
        self
    }

    /// First tensor bound to an input slot.
    pub fn input_name(&self, slot: &str) -> Option<&str> {
        self.inputs.get(slot)?.first().map(String::as_str)
    }

    /// First tensor bound to an output slot.
    pub fn output_name(&self, slot: &str) -> Option<&str> {
        self.outputs.get(slot)?.first().map(String::as_str)
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.values().flatten().map(String::as_str)
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.values().flatten().map(String::as_str)
    }

    pub fn reads(&self, tensor: &str) -> bool {
        self.input_names().any(|n| n == tensor)
    }
}

/// Outcome of [`Graph::splice`].
#[derive(Debug)]
pub struct Splice {
    pub removed: Vec<Node>,
    pub inserted: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Graph {
    tensors: BTreeMap<String, Tensor>,
    nodes: Vec<Option<Node>>,
    order: Vec<NodeId>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tensor. Inputs and outputs are also appended to the
    /// graph-level input/output lists.
    pub fn add_tensor(
        &mut self,
        name: &str,
        shape: impl Into<Shape>,
        dtype: DType,
        kind: TensorKind,
    ) -> Result<()> {
        if self.tensors.contains_key(name) {
            return Err(Error::invalid(None, format!("duplicate tensor `{name}`")));
        }
        match kind {
            TensorKind::Input => self.inputs.push(name.to_string()),
            TensorKind::Output => self.outputs.push(name.to_string()),
            TensorKind::Weight | TensorKind::Intermediate => {}
        }
        self.tensors.insert(
            name.to_string(),
            Tensor {
                name: name.to_string(),
                shape: shape.into(),
                dtype,
                kind,
            },
        );
        Ok(())
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.values()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)?.as_ref()
    }

    /// Live nodes in execution order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.order
            .iter()
            .filter_map(move |&id| self.node(id).map(|n| (id, n)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn topological_order(&self) -> Vec<NodeId> {
        self.order.clone()
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.order.iter().position(|&n| n == id)
    }

    pub fn producer(&self, tensor: &str) -> Option<NodeId> {
        self.nodes()
            .find(|(_, n)| n.output_names().any(|o| o == tensor))
            .map(|(id, _)| id)
    }

    pub fn consumers(&self, tensor: &str) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.reads(tensor))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn is_graph_output(&self, tensor: &str) -> bool {
        self.outputs.iter().any(|o| o == tensor)
    }

    /// Number of live nodes with the given op type.
    pub fn count_ops(&self, op_type: &str) -> usize {
        self.nodes().filter(|(_, n)| n.op_type == op_type).count()
    }

    /// Append a node at the end of the execution order.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        let id = self.nodes.len();
        let mut order = self.order.clone();
        order.push(id);
        // outputs may be declared before their producers are added
        self.check_order(&order, Some((id, &node)), &[])?;

        self.nodes.push(Some(node));
        self.order = order;
        Ok(id)
    }

    pub fn remove_node(&mut self, id: NodeId) -> Result<Node> {
        let mut splice = self.splice(&[id], id, None)?;
        splice
            .removed
            .pop()
            .ok_or_else(|| Error::invalid(Some(id), "node vanished during removal"))
    }

    /// Replace a node in place. Edges through tensor names the new node
    /// still reads or writes are kept as they are.
    pub fn replace_node(&mut self, id: NodeId, node: Node) -> Result<NodeId> {
        let splice = self.splice(&[id], id, Some(node))?;
        splice
            .inserted
            .ok_or_else(|| Error::invalid(Some(id), "replacement was not inserted"))
    }

    /// Remove `remove` and insert `replacement` (if any) at the position of
    /// `anchor`, which must be one of the removed nodes.
    ///
    /// The resulting graph is checked as a whole before anything is
    /// committed, so on error the graph is unchanged.
    pub fn splice(
        &mut self,
        remove: &[NodeId],
        anchor: NodeId,
        replacement: Option<Node>,
    ) -> Result<Splice> {
        for &id in remove {
            if self.node(id).is_none() {
                return Err(Error::invalid(Some(id), "node does not exist"));
            }
        }
        if !remove.contains(&anchor) {
            return Err(Error::invalid(Some(anchor), "splice anchor must be a removed node"));
        }

        // graph outputs produced now must still be produced afterwards
        let produced: Vec<&str> = self
            .outputs
            .iter()
            .filter(|o| self.producer(o).is_some())
            .map(String::as_str)
            .collect();

        let new_id = self.nodes.len();
        let mut order = Vec::with_capacity(self.order.len() + 1);
        for &id in &self.order {
            if id == anchor && replacement.is_some() {
                order.push(new_id);
            }
            if !remove.contains(&id) {
                order.push(id);
            }
        }
        self.check_order(&order, replacement.as_ref().map(|n| (new_id, n)), &produced)?;

        let removed = remove
            .iter()
            .filter_map(|&id| self.nodes[id].take())
            .collect();
        let inserted = replacement.map(|node| {
            self.nodes.push(Some(node));
            new_id
        });
        self.order = order;
        self.prune_tensors();

        Ok(Splice { removed, inserted })
    }

    /// Check the structural invariants of the current graph.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for &id in &self.order {
            if !seen.insert(id) {
                return Err(Error::invalid(Some(id), "node appears twice in execution order"));
            }
        }
        let live = self.nodes.iter().filter(|n| n.is_some()).count();
        if live != self.order.len() {
            return Err(Error::invalid(
                None,
                format!("{live} live nodes but {} ordered", self.order.len()),
            ));
        }
        let outputs: Vec<&str> = self.outputs.iter().map(String::as_str).collect();
        self.check_order(&self.order, None, &outputs)
    }

    /// Re-derive a topological order from data dependencies alone.
    pub fn derive_topological_order(&self) -> Result<Vec<NodeId>> {
        let ids: Vec<NodeId> = self.order.clone();
        let nodes: Vec<&Node> = ids.iter().filter_map(|&id| self.node(id)).collect();
        let sorted = topological_sort(&nodes)?;
        Ok(sorted.into_iter().map(|i| ids[i]).collect())
    }

    /// Walk `order` and verify every input is available when read and every
    /// tensor has at most one producer. `extra` is a node not yet stored;
    /// each of `required` must be produced by the end of `order`.
    fn check_order(
        &self,
        order: &[NodeId],
        extra: Option<(NodeId, &Node)>,
        required: &[&str],
    ) -> Result<()> {
        let mut available: HashSet<&str> = self
            .tensors
            .values()
            .filter(|t| t.kind.is_external())
            .map(|t| t.name.as_str())
            .collect();

        for &id in order {
            let node = match extra {
                Some((extra_id, node)) if extra_id == id => node,
                _ => self
                    .node(id)
                    .ok_or_else(|| Error::invalid(Some(id), "node does not exist"))?,
            };

            for name in node.input_names() {
                if !self.tensors.contains_key(name) {
                    return Err(Error::invalid(Some(id), format!("reads unknown tensor `{name}`")));
                }
                if !available.contains(name) {
                    return Err(Error::invalid(
                        Some(id),
                        format!("`{}` reads `{name}` before it is produced", node.op_type),
                    ));
                }
            }
            for name in node.output_names() {
                let tensor = self
                    .tensors
                    .get(name)
                    .ok_or_else(|| Error::invalid(Some(id), format!("writes unknown tensor `{name}`")))?;
                if tensor.kind.is_external() {
                    return Err(Error::invalid(
                        Some(id),
                        format!("writes graph input or weight `{name}`"),
                    ));
                }
                if !available.insert(tensor.name.as_str()) {
                    return Err(Error::invalid(Some(id), format!("`{name}` has multiple producers")));
                }
            }
        }

        for &name in required {
            if !available.contains(name) {
                return Err(Error::invalid(
                    None,
                    format!("graph output `{name}` is never produced"),
                ));
            }
        }
        Ok(())
    }

    /// Drop intermediates no live node references anymore.
    fn prune_tensors(&mut self) {
        let referenced: HashSet<String> = self
            .nodes()
            .flat_map(|(_, n)| n.input_names().chain(n.output_names()))
            .map(str::to_string)
            .collect();
        self.tensors
            .retain(|name, t| t.kind != TensorKind::Intermediate || referenced.contains(name));
    }
}

/// Kahn's algorithm over name-linked nodes. Returns indices into `nodes`,
/// keeping the given order among independent nodes.
pub fn topological_sort(nodes: &[&Node]) -> Result<Vec<usize>> {
    let mut producer: HashMap<&str, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        for name in node.output_names() {
            if producer.insert(name, i).is_some() {
                return Err(Error::invalid(Some(i), format!("`{name}` has multiple producers")));
            }
        }
    }

    let mut indegree = vec![0usize; nodes.len()];
    let mut users: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for name in node.input_names() {
            if let Some(&p) = producer.get(name) {
                indegree[i] += 1;
                users[p].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_front() {
        sorted.push(i);
        for &u in &users[i] {
            indegree[u] -= 1;
            if indegree[u] == 0 {
                ready.push_back(u);
            }
        }
    }

    if sorted.len() != nodes.len() {
        let stuck = (0..nodes.len()).find(|&i| indegree[i] > 0);
        return Err(Error::invalid(stuck, "graph contains a cycle"));
    }
    Ok(sorted)
}
