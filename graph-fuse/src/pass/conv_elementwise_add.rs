//! Fold `conv2d -> elementwise_add` into a single `conv2d_elementwise_add`.
//!
//! Pattern (the relu is matched but kept, and may feed several chains):
//!
//! ```text
//!   x -> relu -> conv2d(Input, Filter) -> elementwise_add -> out
//!                                          ^
//!                               residual --+
//! ```
//!
//! The add's second operand depends on `axis`:
//! - `axis` -1 / 0: full-tensor add, conv output on `Y`, residual on `X`
//! - `axis` 1: channel broadcast, conv output on `X`, per-channel bias on `Y`
//!
//! NHWC convolutions are never fused.

use log::{debug, info};

use super::{Pass, PassResult};
use crate::error::{Error, Result};
use crate::ir::shape::{conv2d_output_shape, infer_dims};
use crate::ir::{Conv2dAttrs, DataFormat, ElementwiseAttrs, Graph, Node, NodeId};
use crate::pattern::{find_matches, MatchResult, PatternTemplate};

pub const FUSED_OP: &str = "conv2d_elementwise_add";

// binding indices in the template below
const CONV_TO_ADD: usize = 1;

pub fn conv_elementwise_add_template() -> PatternTemplate {
    PatternTemplate::new("conv_elementwise_add")
        .node("relu", "relu")
        .node("conv", "conv2d")
        .node("add", "elementwise_add")
        .bind("relu", "Out", "conv", &["Input"])
        .bind_intermediate("conv", "Output", "add", &["X", "Y"])
        .keep("relu")
        .predicate(is_fusible)
}

/// Attribute guard evaluated during matching.
fn is_fusible(_graph: &Graph, m: &MatchResult) -> bool {
    // malformed attributes are left for the rewriter to report
    let Ok(conv) = Conv2dAttrs::from_attrs(m.node("conv"), m.attrs_of("conv")) else {
        return true;
    };
    let Ok(add) = ElementwiseAttrs::from_attrs(m.node("add"), m.attrs_of("add")) else {
        return true;
    };

    // NHWC conv + residual add is a known-broken combination
    if conv.data_format == DataFormat::Nhwc {
        debug!("conv2d node {}: NHWC is not fused", m.node("conv"));
        return false;
    }

    let conv_slot = if add.is_channel_broadcast() { "X" } else { "Y" };
    m.slots[CONV_TO_ADD] == conv_slot
}

/// How the non-conv operand of the add is combined with the conv output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualKind {
    /// Same shape as the conv output.
    Full,
    /// One value per output channel.
    ChannelBias,
}

impl ResidualKind {
    pub fn axis(&self) -> i64 {
        match self {
            ResidualKind::Full => -1,
            ResidualKind::ChannelBias => 1,
        }
    }
}

/// Decide how `residual` broadcasts against an NCHW conv output.
///
/// A rank-1 residual is aligned at `axis` (-1 aligns trailing dims). When
/// the declared axis does not line it up with the conv output, a residual
/// of length C is taken as a per-channel bias instead. A residual that
/// broadcasts validly along any dim other than C cannot be expressed by the
/// fused op and yields `None`.
pub fn resolve_residual(conv_out: &[usize], residual: &[usize], axis: i64) -> Option<ResidualKind> {
    if residual == conv_out {
        return Some(ResidualKind::Full);
    }
    let channels = *conv_out.get(1)?;
    let start = if axis < 0 {
        conv_out.len().checked_sub(residual.len())?
    } else {
        usize::try_from(axis).ok()?
    };
    let end = start.checked_add(residual.len())?;
    let declared_fits = conv_out.get(start..end) == Some(residual);

    if declared_fits {
        return (start == 1 && residual.len() == 1).then_some(ResidualKind::ChannelBias);
    }
    if residual == [channels].as_slice() {
        debug!("residual {residual:?} does not broadcast at axis={axis}, using axis=1");
        return Some(ResidualKind::ChannelBias);
    }
    None
}

struct FusionPlan {
    conv: NodeId,
    add: NodeId,
    fused: Node,
}

/// Rewrite one match. Returns `Ok(false)` when a precondition rejects it;
/// the graph is then untouched.
pub fn apply_fusion(graph: &mut Graph, m: &MatchResult) -> Result<bool> {
    match plan_fusion(graph, m) {
        Ok(plan) => {
            let id = graph
                .splice(&[plan.conv, plan.add], plan.add, Some(plan.fused))?
                .inserted;
            debug!(
                "fused conv2d {} + elementwise_add {} into node {:?}",
                plan.conv, plan.add, id
            );
            Ok(true)
        }
        Err(e) if e.is_recoverable() => {
            debug!("skipping match: {e}");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn plan_fusion(graph: &Graph, m: &MatchResult) -> Result<FusionPlan> {
    let conv_id = m.node("conv");
    let add_id = m.node("add");
    let conv = matched(graph, conv_id, "conv2d")?;
    let add = matched(graph, add_id, "elementwise_add")?;

    let conv_attrs = Conv2dAttrs::from_attrs(conv_id, &conv.attrs)?;
    let add_attrs = ElementwiseAttrs::from_attrs(add_id, &add.attrs)?;
    if conv_attrs.data_format == DataFormat::Nhwc {
        return Err(unsupported(conv_id, "data_format NHWC is not supported"));
    }

    let input = required_input(conv, conv_id, "Input")?;
    let filter = required_input(conv, conv_id, "Filter")?;
    let conv_out = conv
        .output_name("Output")
        .ok_or_else(|| Error::invalid(Some(conv_id), "conv2d without Output"))?;

    let residual_slot = match add.input_name("Y") {
        Some(y) if y == conv_out => "X",
        _ => "Y",
    };
    let residual = add
        .input_name(residual_slot)
        .ok_or_else(|| unsupported(add_id, "elementwise_add has a single operand"))?;
    if residual == conv_out {
        return Err(unsupported(add_id, "both add operands are the conv output"));
    }
    let add_out = add
        .output_name("Out")
        .ok_or_else(|| Error::invalid(Some(add_id), "elementwise_add without Out"))?;

    let input_shape = infer_dims(graph, input)
        .ok_or_else(|| unsupported(conv_id, format!("shape of `{input}` is not known")))?;
    let filter_shape = infer_dims(graph, filter)
        .ok_or_else(|| unsupported(conv_id, format!("shape of `{filter}` is not known")))?;
    let out_shape = conv2d_output_shape(input_shape, filter_shape, &conv_attrs).map_err(|e| {
        Error::ShapeMismatch {
            node: conv_id,
            reason: e.to_string(),
        }
    })?;

    for (tensor, node) in [(conv_out, conv_id), (add_out, add_id)] {
        if let Some(declared) = known_dims(graph, tensor) {
            if declared != out_shape.as_slice() {
                return Err(Error::ShapeMismatch {
                    node,
                    reason: format!(
                        "`{tensor}` declared as {declared:?}, conv2d attributes give {out_shape:?}"
                    ),
                });
            }
        }
    }

    let residual_shape = infer_dims(graph, residual)
        .ok_or_else(|| unsupported(add_id, format!("shape of `{residual}` is not known")))?;
    let kind = resolve_residual(&out_shape, residual_shape, add_attrs.axis).ok_or_else(|| {
        unsupported(
            add_id,
            format!("`{residual}` {residual_shape:?} does not broadcast to {out_shape:?}"),
        )
    })?;

    // the fused node sits where the add was, so the residual must exist by then
    if let Some(producer) = graph.producer(residual) {
        if graph.position(producer) > graph.position(add_id) {
            return Err(Error::invalid(
                Some(add_id),
                format!("`{residual}` is produced after its reader"),
            ));
        }
    }

    let mut fused = Node::new(FUSED_OP);
    fused.inputs = conv.inputs.clone();
    fused = fused.input("ResidualData", residual).output("Output", add_out);
    fused.attrs = conv.attrs.clone();
    fused.attrs.merge_missing(&add.attrs);
    fused.attrs.set("axis", kind.axis());
    fused.attrs.set("fuse_residual_connection", true);

    Ok(FusionPlan {
        conv: conv_id,
        add: add_id,
        fused,
    })
}

fn matched<'g>(graph: &'g Graph, id: NodeId, op_type: &str) -> Result<&'g Node> {
    match graph.node(id) {
        Some(node) if node.op_type == op_type => Ok(node),
        _ => Err(Error::invalid(
            Some(id),
            format!("stale match: expected a live `{op_type}` node"),
        )),
    }
}

fn required_input<'n>(node: &'n Node, id: NodeId, slot: &str) -> Result<&'n str> {
    node.input_name(slot)
        .ok_or_else(|| Error::invalid(Some(id), format!("`{}` without {slot}", node.op_type)))
}

fn known_dims<'g>(graph: &'g Graph, tensor: &str) -> Option<&'g [usize]> {
    graph.tensor(tensor)?.shape.dims()
}

fn unsupported(node: NodeId, reason: impl Into<String>) -> Error {
    Error::UnsupportedConfiguration {
        node,
        reason: reason.into(),
    }
}

/// Fuses every eligible relu -> conv2d -> elementwise_add chain.
#[derive(Debug)]
pub struct ConvElementwiseAddFusePass {
    template: PatternTemplate,
}

impl Default for ConvElementwiseAddFusePass {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvElementwiseAddFusePass {
    pub const NAME: &'static str = "conv_elementwise_add_fuse_pass";

    pub fn new() -> Self {
        Self {
            template: conv_elementwise_add_template(),
        }
    }
}

impl Pass for ConvElementwiseAddFusePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult> {
        // matches are disjoint and a rewrite only touches its own nodes, so
        // collecting up front keeps the later ones valid
        let matches: Vec<MatchResult> = find_matches(graph, &self.template).collect();
        let snapshot = graph.clone();

        let mut fused = 0;
        for m in &matches {
            match apply_fusion(graph, m) {
                Ok(true) => fused += 1,
                Ok(false) => {}
                Err(e) => {
                    *graph = snapshot;
                    return Err(e);
                }
            }
        }

        info!(
            "{}: {} candidate(s), {} fused",
            Self::NAME,
            matches.len(),
            fused
        );
        Ok(PassResult::from_count(fused))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Attrs, DType, Shape, TensorKind};

    struct ConvCase {
        data_format: &'static str,
        padding_algorithm: &'static str,
        paddings: Vec<i64>,
        strides: Vec<i64>,
        axis: i64,
        input_shape: Shape,
        conv_output_shape: Shape,
    }

    impl Default for ConvCase {
        fn default() -> Self {
            Self {
                data_format: "NCHW",
                padding_algorithm: "EXPLICIT",
                paddings: vec![1, 1],
                strides: vec![1, 1],
                axis: -1,
                input_shape: Shape::Known(vec![1, 48, 64, 64]),
                conv_output_shape: Shape::Dynamic,
            }
        }
    }

    /// Helper: input [1,48,64,64] -> relu -> conv2d 3x3 -> elementwise_add.
    /// `axis` 1 adds a [48] bias, otherwise the graph input is the residual.
    fn make_fuse_graph(case: &ConvCase) -> Graph {
        let mut g = Graph::new();
        g.add_tensor("input_data1", case.input_shape.clone(), DType::F32, TensorKind::Input)
            .unwrap();
        g.add_tensor("conv_weight", vec![48, 48, 3, 3], DType::F32, TensorKind::Weight)
            .unwrap();
        g.add_tensor("relu_out", Shape::Dynamic, DType::F32, TensorKind::Intermediate)
            .unwrap();
        g.add_tensor(
            "conv_output",
            case.conv_output_shape.clone(),
            DType::F32,
            TensorKind::Intermediate,
        )
        .unwrap();
        g.add_tensor("elementwise_output", Shape::Dynamic, DType::F32, TensorKind::Output)
            .unwrap();

        g.add_node(
            Node::new("relu")
                .input("X", "input_data1")
                .output("Out", "relu_out"),
        )
        .unwrap();
        g.add_node(
            Node::new("conv2d")
                .input("Input", "relu_out")
                .input("Filter", "conv_weight")
                .output("Output", "conv_output")
                .attrs(
                    Attrs::new()
                        .with("data_format", case.data_format)
                        .with("padding_algorithm", case.padding_algorithm)
                        .with("paddings", case.paddings.clone())
                        .with("strides", case.strides.clone())
                        .with("dilations", vec![1i64, 1])
                        .with("groups", 1i64),
                ),
        )
        .unwrap();

        let add = if case.axis == 1 {
            g.add_tensor("elementwise_weight", vec![48], DType::F32, TensorKind::Weight)
                .unwrap();
            Node::new("elementwise_add")
                .input("X", "conv_output")
                .input("Y", "elementwise_weight")
        } else {
            Node::new("elementwise_add")
                .input("X", "input_data1")
                .input("Y", "conv_output")
        };
        g.add_node(
            add.output("Out", "elementwise_output")
                .attrs(Attrs::new().with("axis", case.axis)),
        )
        .unwrap();
        g
    }

    fn run(g: &mut Graph) -> PassResult {
        ConvElementwiseAddFusePass::new().run(g).unwrap()
    }

    #[test]
    fn fuses_full_tensor_add() {
        let mut g = make_fuse_graph(&ConvCase::default());
        // conv input shape only follows from the relu's input
        assert_eq!(g.tensor("relu_out").unwrap().shape, Shape::Dynamic);
        let result = run(&mut g);
        assert_eq!(
            result,
            PassResult {
                applied: true,
                match_count: 1
            }
        );
        assert_eq!(g.len(), 2);
        assert_eq!(g.count_ops("conv2d"), 0);
        assert_eq!(g.count_ops("elementwise_add"), 0);
        assert!(g.tensor("conv_output").is_none());

        let (_, fused) = g.nodes().nth(1).unwrap();
        assert_eq!(fused.op_type, FUSED_OP);
        assert_eq!(fused.input_name("Input"), Some("relu_out"));
        assert_eq!(fused.input_name("Filter"), Some("conv_weight"));
        assert_eq!(fused.input_name("ResidualData"), Some("input_data1"));
        assert_eq!(fused.output_name("Output"), Some("elementwise_output"));
        assert_eq!(fused.attrs.int(0, "axis").unwrap(), Some(-1));
        assert_eq!(fused.attrs.str(0, "data_format").unwrap(), Some("NCHW"));
        assert_eq!(
            fused.attrs.get("fuse_residual_connection"),
            Some(&crate::ir::AttrValue::Bool(true))
        );
        g.validate().unwrap();
    }

    #[test]
    fn fuses_channel_bias_add() {
        let mut g = make_fuse_graph(&ConvCase {
            padding_algorithm: "VALID",
            axis: 1,
            ..ConvCase::default()
        });
        assert!(run(&mut g).applied);
        let (_, fused) = g.nodes().nth(1).unwrap();
        assert_eq!(fused.input_name("ResidualData"), Some("elementwise_weight"));
        assert_eq!(fused.attrs.int(0, "axis").unwrap(), Some(1));
    }

    #[test]
    fn axis_zero_is_full_tensor() {
        let mut g = make_fuse_graph(&ConvCase {
            axis: 0,
            ..ConvCase::default()
        });
        assert!(run(&mut g).applied);
    }

    #[test]
    fn nhwc_is_never_fused() {
        for axis in [-1, 0, 1] {
            let mut g = make_fuse_graph(&ConvCase {
                data_format: "NHWC",
                axis,
                ..ConvCase::default()
            });
            let before = g.clone();
            assert!(!run(&mut g).applied);
            assert_eq!(g, before);
        }
    }

    #[test]
    fn second_run_is_a_noop() {
        let mut g = make_fuse_graph(&ConvCase::default());
        assert!(run(&mut g).applied);
        let once = g.clone();
        assert_eq!(run(&mut g), PassResult::default());
        assert_eq!(g, once);
    }

    #[test]
    fn conv_add_without_relu_is_untouched() {
        let mut g = Graph::new();
        g.add_tensor("x", vec![1, 48, 64, 64], DType::F32, TensorKind::Input)
            .unwrap();
        g.add_tensor("w", vec![48, 48, 3, 3], DType::F32, TensorKind::Weight)
            .unwrap();
        g.add_tensor("c", Shape::Dynamic, DType::F32, TensorKind::Intermediate)
            .unwrap();
        g.add_tensor("y", Shape::Dynamic, DType::F32, TensorKind::Output)
            .unwrap();
        g.add_node(
            Node::new("conv2d")
                .input("Input", "x")
                .input("Filter", "w")
                .output("Output", "c")
                .attrs(Attrs::new().with("paddings", vec![1i64, 1])),
        )
        .unwrap();
        g.add_node(
            Node::new("elementwise_add")
                .input("X", "x")
                .input("Y", "c")
                .output("Out", "y"),
        )
        .unwrap();
        let before = g.clone();
        assert!(!run(&mut g).applied);
        assert_eq!(g, before);
    }

    #[test]
    fn wrong_operand_slot_for_axis_is_not_matched() {
        // axis=1 expects the conv output on X; here it sits on Y
        let mut g = make_fuse_graph(&ConvCase::default());
        let add = g.nodes().nth(2).map(|(id, _)| id).unwrap();
        let node = Node::new("elementwise_add")
            .input("X", "input_data1")
            .input("Y", "conv_output")
            .output("Out", "elementwise_output")
            .attrs(Attrs::new().with("axis", 1i64));
        g.replace_node(add, node).unwrap();
        let template = conv_elementwise_add_template();
        assert_eq!(find_matches(&g, &template).count(), 0);
    }

    #[test]
    fn declared_conv_shape_mismatch_aborts() {
        // VALID gives 62x62 but the conv output is declared 64x64
        let mut g = make_fuse_graph(&ConvCase {
            padding_algorithm: "VALID",
            conv_output_shape: Shape::Known(vec![1, 48, 64, 64]),
            ..ConvCase::default()
        });
        let before = g.clone();
        match ConvElementwiseAddFusePass::new().run(&mut g) {
            Err(Error::ShapeMismatch { node, .. }) => assert_eq!(node, 1),
            other => panic!("Expected ShapeMismatch, got {:?}", other),
        }
        assert_eq!(g, before);
    }

    #[test]
    fn unknown_input_shape_skips_match() {
        let mut g = make_fuse_graph(&ConvCase {
            input_shape: Shape::Dynamic,
            ..ConvCase::default()
        });
        let before = g.clone();
        assert_eq!(run(&mut g), PassResult::default());
        assert_eq!(g, before);
    }

    #[test]
    fn stale_match_is_rejected() {
        let mut g = make_fuse_graph(&ConvCase::default());
        let template = conv_elementwise_add_template();
        let m = find_matches(&g, &template).next().unwrap();
        let mut stale = m.clone();
        stale.nodes[1] = 999;
        assert!(matches!(
            apply_fusion(&mut g, &stale),
            Err(Error::InvalidGraph { .. })
        ));
        assert!(apply_fusion(&mut g, &m).unwrap());
    }

    #[test]
    fn residual_resolution() {
        let out = [2, 48, 64, 64];
        assert_eq!(resolve_residual(&out, &out, -1), Some(ResidualKind::Full));
        assert_eq!(resolve_residual(&out, &out, 1), Some(ResidualKind::Full));
        assert_eq!(
            resolve_residual(&out, &[48], -1),
            Some(ResidualKind::ChannelBias)
        );
        assert_eq!(
            resolve_residual(&out, &[48], 0),
            Some(ResidualKind::ChannelBias)
        );
        assert_eq!(resolve_residual(&out, &[2, 48, 62, 62], 0), None);
        assert_eq!(resolve_residual(&out, &[16], 1), None);
        // broadcasts along N or W as declared: not a channel bias
        assert_eq!(resolve_residual(&out, &[2], 0), None);
        assert_eq!(resolve_residual(&[1, 48, 64, 48], &[48], -1), None);
    }

    #[test]
    fn trailing_dim_bias_is_not_fused() {
        let mut g = make_fuse_graph(&ConvCase {
            input_shape: Shape::Known(vec![1, 48, 64, 48]),
            ..ConvCase::default()
        });
        g.add_tensor("row_bias", vec![48], DType::F32, TensorKind::Weight)
            .unwrap();
        let add = g.nodes().nth(2).map(|(id, _)| id).unwrap();
        g.replace_node(
            add,
            Node::new("elementwise_add")
                .input("X", "row_bias")
                .input("Y", "conv_output")
                .output("Out", "elementwise_output")
                .attrs(Attrs::new().with("axis", -1i64)),
        )
        .unwrap();

        let before = g.clone();
        assert_eq!(run(&mut g), PassResult::default());
        assert_eq!(g, before);
    }

    #[test]
    fn shared_relu_feeds_two_fused_chains() {
        let mut g = Graph::new();
        g.add_tensor("x", vec![1, 48, 64, 64], DType::F32, TensorKind::Input)
            .unwrap();
        g.add_tensor("relu_out", Shape::Dynamic, DType::F32, TensorKind::Intermediate)
            .unwrap();
        g.add_node(Node::new("relu").input("X", "x").output("Out", "relu_out"))
            .unwrap();
        for i in 1..=2 {
            let (w, c, y) = (format!("w{i}"), format!("c{i}"), format!("y{i}"));
            g.add_tensor(&w, vec![48, 48, 3, 3], DType::F32, TensorKind::Weight)
                .unwrap();
            g.add_tensor(&c, Shape::Dynamic, DType::F32, TensorKind::Intermediate)
                .unwrap();
            g.add_tensor(&y, Shape::Dynamic, DType::F32, TensorKind::Output)
                .unwrap();
            g.add_node(
                Node::new("conv2d")
                    .input("Input", "relu_out")
                    .input("Filter", &w)
                    .output("Output", &c)
                    .attrs(Attrs::new().with("paddings", vec![1i64, 1])),
            )
            .unwrap();
            g.add_node(
                Node::new("elementwise_add")
                    .input("X", "x")
                    .input("Y", &c)
                    .output("Out", &y)
                    .attrs(Attrs::new().with("axis", -1i64)),
            )
            .unwrap();
        }

        assert_eq!(run(&mut g), PassResult::from_count(2));
        assert_eq!(g.count_ops(FUSED_OP), 2);
        assert_eq!(g.count_ops("relu"), 1);
        let once = g.clone();
        assert_eq!(run(&mut g), PassResult::default());
        assert_eq!(g, once);
        g.validate().unwrap();
    }
}
