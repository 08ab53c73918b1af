pub mod attr;
pub mod graph;
pub mod shape;

pub use attr::{AttrValue, Attrs, Conv2dAttrs, DataFormat, ElementwiseAttrs, PaddingAlgorithm, Paddings};
pub use graph::{DType, Graph, Node, NodeId, Shape, Tensor, TensorKind};
