//! Graph IR, pattern matcher and fusion passes for inference graphs.
//!
//! The headline rewrite is [`pass::ConvElementwiseAddFusePass`], which folds
//! `conv2d -> elementwise_add` (fed by a `relu`) into a single
//! `conv2d_elementwise_add` node.

pub mod error;
pub mod ir;
pub mod parse;
pub mod pass;
pub mod pattern;

pub use error::{Error, Result};
pub use ir::{AttrValue, Attrs, DType, Graph, Node, NodeId, Shape, Tensor, TensorKind};
pub use pass::{Pass, PassManager, PassRegistry, PassResult};
