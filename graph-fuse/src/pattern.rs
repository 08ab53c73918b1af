//! Subgraph pattern matching.
//!
//! A [`PatternTemplate`] is an ordered list of op-type constraints plus
//! [`Binding`]s that tie an output slot of one pattern node to an input slot
//! of another. [`find_matches`] walks the graph in execution order and yields
//! non-overlapping [`MatchResult`]s: once a node is part of a match it is not
//! considered again during the same scan, unless its position is marked with
//! [`PatternTemplate::keep`] (the rewrite leaves it in place, so it may
//! anchor further matches).

use std::collections::HashSet;
use std::fmt;

use crate::ir::{Attrs, Graph, NodeId};

/// One pattern position: a symbolic name and the op type it must have.
#[derive(Debug, Clone)]
pub struct PatternNode {
    pub name: String,
    pub op_type: String,
    /// Survives the rewrite and may be shared between matches.
    pub kept: bool,
}

/// "Output `output_slot` of `producer` is read by `consumer` on one of
/// `input_slots`." Indices refer to [`PatternTemplate::nodes`].
#[derive(Debug, Clone)]
pub struct Binding {
    pub producer: usize,
    pub output_slot: String,
    pub consumer: usize,
    pub input_slots: Vec<String>,
    /// The tensor must be read only by matched nodes and must not be a graph
    /// output, so the rewrite may drop it.
    pub intermediate: bool,
}

pub type Predicate = Box<dyn Fn(&Graph, &MatchResult) -> bool>;

pub struct PatternTemplate {
    pub name: String,
    pub nodes: Vec<PatternNode>,
    pub bindings: Vec<Binding>,
    predicate: Option<Predicate>,
}

impl fmt::Debug for PatternTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternTemplate")
            .field("name", &self.name)
            .field("nodes", &self.nodes)
            .field("bindings", &self.bindings)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl PatternTemplate {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nodes: Vec::new(),
            bindings: Vec::new(),
            predicate: None,
        }
    }

    pub fn node(mut self, name: &str, op_type: &str) -> Self {
        self.nodes.push(PatternNode {
            name: name.to_string(),
            op_type: op_type.to_string(),
            kept: false,
        });
        self
    }

    /// Mark a position as kept by the rewrite.
    pub fn keep(mut self, name: &str) -> Self {
        let index = self
            .index_of(name)
            .unwrap_or_else(|| panic!("pattern `{}`: unknown node `{name}`", self.name));
        self.nodes[index].kept = true;
        self
    }

    pub fn bind(self, producer: &str, output_slot: &str, consumer: &str, input_slots: &[&str]) -> Self {
        self.add_binding(producer, output_slot, consumer, input_slots, false)
    }

    /// Like [`bind`](Self::bind), but the tensor must be private to the match.
    pub fn bind_intermediate(
        self,
        producer: &str,
        output_slot: &str,
        consumer: &str,
        input_slots: &[&str],
    ) -> Self {
        self.add_binding(producer, output_slot, consumer, input_slots, true)
    }

    /// Attribute check run on every structurally complete candidate.
    pub fn predicate(mut self, f: impl Fn(&Graph, &MatchResult) -> bool + 'static) -> Self {
        self.predicate = Some(Box::new(f));
        self
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    fn add_binding(
        mut self,
        producer: &str,
        output_slot: &str,
        consumer: &str,
        input_slots: &[&str],
        intermediate: bool,
    ) -> Self {
        let producer = self
            .index_of(producer)
            .unwrap_or_else(|| panic!("pattern `{}`: unknown node `{producer}`", self.name));
        let consumer = self
            .index_of(consumer)
            .unwrap_or_else(|| panic!("pattern `{}`: unknown node `{consumer}`", self.name));
        self.bindings.push(Binding {
            producer,
            output_slot: output_slot.to_string(),
            consumer,
            input_slots: input_slots.iter().map(|s| s.to_string()).collect(),
            intermediate,
        });
        self
    }
}

/// Concrete binding of a template to graph nodes. Only valid until the
/// graph is next mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    names: Vec<String>,
    pub nodes: Vec<NodeId>,
    /// Attributes of each matched node, captured at match time.
    pub attrs: Vec<Attrs>,
    /// Per binding: the tensor that links the two nodes.
    pub tensors: Vec<String>,
    /// Per binding: the consumer slot the tensor was found on.
    pub slots: Vec<String>,
}

impl MatchResult {
    fn index(&self, name: &str) -> usize {
        self.names
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("no pattern node named `{name}`"))
    }

    /// Node bound to the pattern position `name`.
    ///
    /// Panics if the template has no such position.
    pub fn node(&self, name: &str) -> NodeId {
        self.nodes[self.index(name)]
    }

    pub fn attrs_of(&self, name: &str) -> &Attrs {
        &self.attrs[self.index(name)]
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }
}

/// Lazily find all non-overlapping matches of `template`, in execution order
/// of the first pattern node. First match wins.
pub fn find_matches<'a>(graph: &'a Graph, template: &'a PatternTemplate) -> Matches<'a> {
    Matches {
        graph,
        template,
        order: graph.topological_order(),
        cursor: 0,
        consumed: HashSet::new(),
    }
}

pub struct Matches<'a> {
    graph: &'a Graph,
    template: &'a PatternTemplate,
    order: Vec<NodeId>,
    cursor: usize,
    consumed: HashSet<NodeId>,
}

impl Iterator for Matches<'_> {
    type Item = MatchResult;

    fn next(&mut self) -> Option<MatchResult> {
        if self.template.nodes.is_empty() {
            return None;
        }
        while self.cursor < self.order.len() {
            let anchor = self.order[self.cursor];
            if self.candidate_ok(0, anchor, &[]) {
                let mut bound = vec![anchor];
                if let Some(m) = self.extend(&mut bound) {
                    let before = self.consumed.len();
                    self.consumed.extend(
                        m.nodes
                            .iter()
                            .zip(&self.template.nodes)
                            .filter(|(_, p)| !p.kept)
                            .map(|(&id, _)| id),
                    );
                    // a kept anchor is retried until it yields nothing new
                    if self.consumed.len() == before {
                        self.cursor += 1;
                    }
                    return Some(m);
                }
            }
            self.cursor += 1;
        }
        None
    }
}

impl Matches<'_> {
    fn candidate_ok(&self, index: usize, id: NodeId, bound: &[NodeId]) -> bool {
        if self.consumed.contains(&id) || bound.contains(&id) {
            return false;
        }
        self.graph
            .node(id)
            .is_some_and(|n| n.op_type == self.template.nodes[index].op_type)
    }

    /// Depth-first extension of a partial match, backtracking over
    /// alternative candidates.
    fn extend(&self, bound: &mut Vec<NodeId>) -> Option<MatchResult> {
        let k = bound.len();
        if k == self.template.nodes.len() {
            let mut slots = Vec::with_capacity(self.template.bindings.len());
            return self.assign_slots(bound, &mut slots);
        }

        for candidate in self.candidates(k, bound) {
            if !self.candidate_ok(k, candidate, bound) {
                continue;
            }
            bound.push(candidate);
            if self.bindings_hold(bound) {
                if let Some(m) = self.extend(bound) {
                    return Some(m);
                }
            }
            bound.pop();
        }
        None
    }

    /// Nodes that could fill position `k`, derived from a binding to an
    /// already bound node when one exists.
    fn candidates(&self, k: usize, bound: &[NodeId]) -> Vec<NodeId> {
        for b in &self.template.bindings {
            if b.consumer == k && b.producer < k {
                let Some(tensor) = self.output_of(bound[b.producer], &b.output_slot) else {
                    return Vec::new();
                };
                return self.graph.consumers(tensor);
            }
            if b.producer == k && b.consumer < k {
                let node = match self.graph.node(bound[b.consumer]) {
                    Some(n) => n,
                    None => return Vec::new(),
                };
                let mut producers: Vec<NodeId> = b
                    .input_slots
                    .iter()
                    .filter_map(|s| node.input_name(s))
                    .filter_map(|t| self.graph.producer(t))
                    .collect();
                producers.dedup();
                return producers;
            }
        }
        // unconnected position: any later node
        self.order
            .iter()
            .skip_while(|&&id| id != bound[0])
            .copied()
            .collect()
    }

    fn output_of(&self, id: NodeId, slot: &str) -> Option<&str> {
        self.graph.node(id)?.output_name(slot)
    }

    /// Matching consumer slots for binding `b`, empty if the edge is absent.
    fn binding_slots(&self, b: &Binding, bound: &[NodeId]) -> Vec<String> {
        let Some(tensor) = self.output_of(bound[b.producer], &b.output_slot) else {
            return Vec::new();
        };
        let Some(consumer) = self.graph.node(bound[b.consumer]) else {
            return Vec::new();
        };
        b.input_slots
            .iter()
            .filter(|s| consumer.input_name(s) == Some(tensor))
            .cloned()
            .collect()
    }

    /// Check every binding whose endpoints are both bound.
    fn bindings_hold(&self, bound: &[NodeId]) -> bool {
        self.template
            .bindings
            .iter()
            .filter(|b| b.producer < bound.len() && b.consumer < bound.len())
            .all(|b| !self.binding_slots(b, bound).is_empty() && self.private_ok(b, bound))
    }

    fn private_ok(&self, b: &Binding, bound: &[NodeId]) -> bool {
        if !b.intermediate {
            return true;
        }
        let Some(tensor) = self.output_of(bound[b.producer], &b.output_slot) else {
            return false;
        };
        // consumers must be among the matched nodes once the match is complete
        let complete = bound.len() == self.template.nodes.len();
        !self.graph.is_graph_output(tensor)
            && (!complete
                || self
                    .graph
                    .consumers(tensor)
                    .iter()
                    .all(|c| bound.contains(c)))
    }

    /// Choose a consumer slot per binding (a tensor may feed several slots)
    /// and return the first assignment the predicate accepts.
    fn assign_slots(&self, bound: &[NodeId], slots: &mut Vec<String>) -> Option<MatchResult> {
        let i = slots.len();
        if i == self.template.bindings.len() {
            let result = self.build(bound, slots);
            let accepted = match &self.template.predicate {
                Some(p) => p(self.graph, &result),
                None => true,
            };
            return accepted.then_some(result);
        }

        let b = &self.template.bindings[i];
        if !self.private_ok(b, bound) {
            return None;
        }
        for slot in self.binding_slots(b, bound) {
            slots.push(slot);
            if let Some(m) = self.assign_slots(bound, slots) {
                return Some(m);
            }
            slots.pop();
        }
        None
    }

    fn build(&self, bound: &[NodeId], slots: &[String]) -> MatchResult {
        let tensors = self
            .template
            .bindings
            .iter()
            .map(|b| {
                self.output_of(bound[b.producer], &b.output_slot)
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();
        MatchResult {
            names: self.template.nodes.iter().map(|n| n.name.clone()).collect(),
            nodes: bound.to_vec(),
            attrs: bound
                .iter()
                .map(|&id| self.graph.node(id).map(|n| n.attrs.clone()).unwrap_or_default())
                .collect(),
            tensors,
            slots: slots.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DType, Node, Shape, TensorKind};

    /// `x -> relu -> a -> scale -> b`, plus a second relu reading `x`.
    fn graph_with_two_relus() -> Graph {
        let mut g = Graph::new();
        g.add_tensor("x", vec![1, 8], DType::F32, TensorKind::Input).unwrap();
        for name in ["a", "c"] {
            g.add_tensor(name, Shape::Dynamic, DType::F32, TensorKind::Intermediate)
                .unwrap();
        }
        g.add_tensor("b", vec![1, 8], DType::F32, TensorKind::Output).unwrap();
        g.add_tensor("d", vec![1, 8], DType::F32, TensorKind::Output).unwrap();
        g.add_node(Node::new("relu").input("X", "x").output("Out", "a")).unwrap();
        g.add_node(Node::new("scale").input("X", "a").output("Out", "b")).unwrap();
        g.add_node(Node::new("relu").input("X", "x").output("Out", "c")).unwrap();
        g.add_node(Node::new("scale").input("X", "c").output("Out", "d")).unwrap();
        g
    }

    fn relu_scale() -> PatternTemplate {
        PatternTemplate::new("relu_scale")
            .node("act", "relu")
            .node("scale", "scale")
            .bind_intermediate("act", "Out", "scale", &["X"])
    }

    #[test]
    fn finds_every_chain_in_order() {
        let g = graph_with_two_relus();
        let template = relu_scale();
        let matches: Vec<_> = find_matches(&g, &template).collect();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].nodes, vec![0, 1]);
        assert_eq!(matches[1].nodes, vec![2, 3]);
        assert_eq!(matches[0].tensors, vec!["a".to_string()]);
        assert_eq!(matches[0].slots, vec!["X".to_string()]);
        assert_eq!(matches[1].node("scale"), 3);
    }

    #[test]
    fn no_structural_match_yields_nothing() {
        let g = graph_with_two_relus();
        let template = PatternTemplate::new("missing")
            .node("act", "sigmoid")
            .node("scale", "scale")
            .bind("act", "Out", "scale", &["X"]);
        assert_eq!(find_matches(&g, &template).count(), 0);
    }

    #[test]
    fn predicate_rejects_candidates() {
        let g = graph_with_two_relus();
        let template = relu_scale().predicate(|_, m| m.node("act") != 0);
        let matches: Vec<_> = find_matches(&g, &template).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].node("act"), 2);
    }

    #[test]
    fn shared_intermediate_is_not_private() {
        let mut g = graph_with_two_relus();
        g.add_tensor("e", vec![1, 8], DType::F32, TensorKind::Output).unwrap();
        // second reader of `a` outside the pattern
        g.add_node(Node::new("exp").input("X", "a").output("Out", "e")).unwrap();
        let template = relu_scale();
        let matches: Vec<_> = find_matches(&g, &template).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].node("act"), 2);
    }

    #[test]
    fn matched_nodes_are_not_reused() {
        // one relu feeding two scales: only one match may claim the relu
        let mut g = Graph::new();
        g.add_tensor("x", vec![4], DType::F32, TensorKind::Input).unwrap();
        g.add_tensor("a", Shape::Dynamic, DType::F32, TensorKind::Intermediate)
            .unwrap();
        g.add_tensor("b", vec![4], DType::F32, TensorKind::Output).unwrap();
        g.add_tensor("c", vec![4], DType::F32, TensorKind::Output).unwrap();
        g.add_node(Node::new("relu").input("X", "x").output("Out", "a")).unwrap();
        g.add_node(Node::new("scale").input("X", "a").output("Out", "b")).unwrap();
        g.add_node(Node::new("scale").input("X", "a").output("Out", "c")).unwrap();

        let template = PatternTemplate::new("relu_scale")
            .node("act", "relu")
            .node("scale", "scale")
            .bind("act", "Out", "scale", &["X"]);
        let matches: Vec<_> = find_matches(&g, &template).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].nodes, vec![0, 1]);
    }

    #[test]
    fn slot_alternatives_are_tried() {
        let mut g = Graph::new();
        g.add_tensor("x", vec![4], DType::F32, TensorKind::Input).unwrap();
        g.add_tensor("w", vec![4], DType::F32, TensorKind::Weight).unwrap();
        g.add_tensor("a", Shape::Dynamic, DType::F32, TensorKind::Intermediate)
            .unwrap();
        g.add_tensor("b", vec![4], DType::F32, TensorKind::Output).unwrap();
        g.add_node(Node::new("relu").input("X", "x").output("Out", "a")).unwrap();
        g.add_node(
            Node::new("elementwise_add")
                .input("X", "w")
                .input("Y", "a")
                .output("Out", "b"),
        )
        .unwrap();

        let template = PatternTemplate::new("relu_add")
            .node("act", "relu")
            .node("add", "elementwise_add")
            .bind("act", "Out", "add", &["X", "Y"]);
        let m = find_matches(&g, &template).next().unwrap();
        assert_eq!(m.slots, vec!["Y".to_string()]);
    }

    #[test]
    fn kept_anchor_is_shared_between_matches() {
        let mut g = Graph::new();
        g.add_tensor("x", vec![4], DType::F32, TensorKind::Input).unwrap();
        g.add_tensor("a", Shape::Dynamic, DType::F32, TensorKind::Intermediate)
            .unwrap();
        g.add_tensor("b", vec![4], DType::F32, TensorKind::Output).unwrap();
        g.add_tensor("c", vec![4], DType::F32, TensorKind::Output).unwrap();
        g.add_node(Node::new("relu").input("X", "x").output("Out", "a")).unwrap();
        g.add_node(Node::new("scale").input("X", "a").output("Out", "b")).unwrap();
        g.add_node(Node::new("scale").input("X", "a").output("Out", "c")).unwrap();

        let template = PatternTemplate::new("relu_scale")
            .node("act", "relu")
            .node("scale", "scale")
            .bind("act", "Out", "scale", &["X"])
            .keep("act");
        let matches: Vec<_> = find_matches(&g, &template).collect();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].nodes, vec![0, 1]);
        assert_eq!(matches[1].nodes, vec![0, 2]);
    }
}
