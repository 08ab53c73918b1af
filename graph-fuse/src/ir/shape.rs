//! Shape inference: conv2d output sizes, plus [`infer_dims`] for tensors
//! whose shape is only implied by an activation chain.
//!
//! Conv sizes are computed one spatial dimension at a time. Padding algorithms:
//! - `EXPLICIT`: paddings are taken as given
//! - `SAME`: output is `ceil(input / stride)`, dilation is ignored
//! - `VALID`: no padding

use crate::ir::attr::{Conv2dAttrs, DataFormat, PaddingAlgorithm};
use crate::ir::graph::Graph;

/// Unary ops whose `Out` has the shape of their `X`.
const SHAPE_PRESERVING: &[&str] = &[
    "relu",
    "relu6",
    "leaky_relu",
    "sigmoid",
    "tanh",
    "gelu",
    "swish",
    "hard_swish",
    "scale",
    "dropout",
];

/// Dimensions of `tensor`, looking through chains of shape-preserving
/// producers when the tensor itself carries no shape.
pub fn infer_dims<'g>(graph: &'g Graph, tensor: &str) -> Option<&'g [usize]> {
    let mut current = graph.tensor(tensor)?;
    // a valid graph is acyclic, so a chain is never longer than the graph
    for _ in 0..=graph.len() {
        if let Some(dims) = current.shape.dims() {
            return Some(dims);
        }
        let node = graph.node(graph.producer(&current.name)?)?;
        if !SHAPE_PRESERVING.contains(&node.op_type.as_str()) {
            return None;
        }
        current = graph.tensor(node.input_name("X")?)?;
    }
    None
}

/// Output size of a convolution along one spatial dimension.
///
/// Returns `None` when the dilated kernel does not fit in the padded input
/// or the stride is zero.
pub fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    pad_before: usize,
    pad_after: usize,
    dilation: usize,
) -> Option<usize> {
    if stride == 0 || kernel == 0 || dilation == 0 {
        return None;
    }
    let dilated_kernel = dilation * (kernel - 1) + 1;
    let padded = input + pad_before + pad_after;
    let span = padded.checked_sub(dilated_kernel)?;
    Some(span / stride + 1)
}

/// Compute SAME padding for one dimension.
///
/// Returns (pad_before, pad_after). The odd element goes after.
pub fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize) {
    // Output size for SAME: ceil(input / stride)
    let out = input.div_ceil(stride);
    let pad_total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(input);
    let before = pad_total / 2;
    (before, pad_total - before)
}

/// Effective per-dimension padding and dilation after applying the padding
/// algorithm: `([(h_before, h_after), (w_before, w_after)], [dil_h, dil_w])`.
pub fn resolve_paddings(
    attrs: &Conv2dAttrs,
    input_hw: [usize; 2],
    kernel_hw: [usize; 2],
) -> ([(usize, usize); 2], [usize; 2]) {
    match attrs.padding_algorithm {
        PaddingAlgorithm::Explicit => (
            [attrs.paddings.height(), attrs.paddings.width()],
            attrs.dilations,
        ),
        PaddingAlgorithm::Same => (
            [
                same_padding(input_hw[0], kernel_hw[0], attrs.strides[0]),
                same_padding(input_hw[1], kernel_hw[1], attrs.strides[1]),
            ],
            [1, 1],
        ),
        PaddingAlgorithm::Valid => ([(0, 0), (0, 0)], attrs.dilations),
    }
}

/// Failure modes of [`conv2d_output_shape`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvShapeError {
    #[error("{what} must be 4D, got rank {rank}")]
    Rank { what: &'static str, rank: usize },
    #[error("input has {input} channels but filter expects {filter} x {groups} groups")]
    Channels { input: usize, filter: usize, groups: usize },
    #[error("kernel does not fit padded input along spatial dim {dim}")]
    KernelTooLarge { dim: usize },
}

/// Output shape of a conv2d.
///
/// Filters are `[out_channels, in_channels / groups, kh, kw]` for both
/// layouts; the input and output use `data_format`.
pub fn conv2d_output_shape(
    input: &[usize],
    filter: &[usize],
    attrs: &Conv2dAttrs,
) -> Result<Vec<usize>, ConvShapeError> {
    if input.len() != 4 {
        return Err(ConvShapeError::Rank {
            what: "input",
            rank: input.len(),
        });
    }
    if filter.len() != 4 {
        return Err(ConvShapeError::Rank {
            what: "filter",
            rank: filter.len(),
        });
    }

    let (batch, channels, in_h, in_w) = match attrs.data_format {
        DataFormat::Nchw => (input[0], input[1], input[2], input[3]),
        DataFormat::Nhwc => (input[0], input[3], input[1], input[2]),
    };
    if channels != filter[1] * attrs.groups {
        return Err(ConvShapeError::Channels {
            input: channels,
            filter: filter[1],
            groups: attrs.groups,
        });
    }

    let kernel = [filter[2], filter[3]];
    let (pads, dilations) = resolve_paddings(attrs, [in_h, in_w], kernel);

    let mut spatial = [0usize; 2];
    for (dim, size) in [in_h, in_w].into_iter().enumerate() {
        spatial[dim] = conv_output_size(
            size,
            kernel[dim],
            attrs.strides[dim],
            pads[dim].0,
            pads[dim].1,
            dilations[dim],
        )
        .ok_or(ConvShapeError::KernelTooLarge { dim })?;
    }

    let out_channels = filter[0];
    Ok(match attrs.data_format {
        DataFormat::Nchw => vec![batch, out_channels, spatial[0], spatial[1]],
        DataFormat::Nhwc => vec![batch, spatial[0], spatial[1], out_channels],
    })
}
