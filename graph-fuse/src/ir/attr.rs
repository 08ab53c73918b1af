//! Typed operator attributes.
//!
//! Attributes are stored as an open [`Attrs`] map of [`AttrValue`]s so that
//! unknown ops round-trip untouched. Ops the passes care about are read
//! through typed views ([`Conv2dAttrs`], [`ElementwiseAttrs`]) which check
//! every value once and report the offending node on failure.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir::graph::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Strs(Vec<String>),
}

impl AttrValue {
    fn kind(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Str(_) => "string",
            AttrValue::Ints(_) => "int list",
            AttrValue::Floats(_) => "float list",
            AttrValue::Strs(_) => "string list",
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::Ints(v)
    }
}

/// Attribute map of one node. Ordered so serialized programs are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attrs(BTreeMap<String, AttrValue>);

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<AttrValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy every attribute of `other` not already present here.
    pub fn merge_missing(&mut self, other: &Attrs) {
        for (name, value) in other.iter() {
            self.0.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }

    pub fn int(&self, node: NodeId, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None => Ok(None),
            Some(AttrValue::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(type_error(node, name, "int", other)),
        }
    }

    pub fn ints(&self, node: NodeId, name: &str) -> Result<Option<&[i64]>> {
        match self.get(name) {
            None => Ok(None),
            Some(AttrValue::Ints(v)) => Ok(Some(v)),
            Some(other) => Err(type_error(node, name, "int list", other)),
        }
    }

    pub fn str(&self, node: NodeId, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(AttrValue::Str(v)) => Ok(Some(v)),
            Some(other) => Err(type_error(node, name, "string", other)),
        }
    }

    /// Parse a string attribute into an enum, falling back to `default` when absent.
    pub fn parsed<T>(&self, node: NodeId, name: &str, default: T) -> Result<T>
    where
        T: FromStr<Err = String>,
    {
        match self.str(node, name)? {
            None => Ok(default),
            Some(s) => s.parse().map_err(|reason| Error::Attribute {
                node,
                name: name.to_string(),
                reason,
            }),
        }
    }
}

fn type_error(node: NodeId, name: &str, expected: &str, found: &AttrValue) -> Error {
    Error::Attribute {
        node,
        name: name.to_string(),
        reason: format!("expected {expected}, found {}", found.kind()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFormat {
    #[default]
    Nchw,
    Nhwc,
}

impl FromStr for DataFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            // "AnyLayout" is what most exporters write for the default layout
            "NCHW" | "AnyLayout" => Ok(DataFormat::Nchw),
            "NHWC" => Ok(DataFormat::Nhwc),
            other => Err(format!("unknown data_format `{other}`")),
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::Nchw => write!(f, "NCHW"),
            DataFormat::Nhwc => write!(f, "NHWC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingAlgorithm {
    #[default]
    Explicit,
    Same,
    Valid,
}

impl FromStr for PaddingAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "EXPLICIT" => Ok(PaddingAlgorithm::Explicit),
            "SAME" => Ok(PaddingAlgorithm::Same),
            "VALID" => Ok(PaddingAlgorithm::Valid),
            other => Err(format!("unknown padding_algorithm `{other}`")),
        }
    }
}

/// Explicit conv padding, already expanded to per-side values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Paddings {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Paddings {
    /// Accepts `[h, w]` (symmetric) or `[top, bottom, left, right]`.
    pub fn from_values(values: &[usize]) -> std::result::Result<Self, String> {
        match *values {
            [h, w] => Ok(Paddings {
                top: h,
                bottom: h,
                left: w,
                right: w,
            }),
            [top, bottom, left, right] => Ok(Paddings {
                top,
                bottom,
                left,
                right,
            }),
            _ => Err(format!("expected 2 or 4 values, got {}", values.len())),
        }
    }

    pub fn height(&self) -> (usize, usize) {
        (self.top, self.bottom)
    }

    pub fn width(&self) -> (usize, usize) {
        (self.left, self.right)
    }
}

/// Checked view of a `conv2d` node's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2dAttrs {
    pub data_format: DataFormat,
    pub padding_algorithm: PaddingAlgorithm,
    pub strides: [usize; 2],
    pub paddings: Paddings,
    pub dilations: [usize; 2],
    pub groups: usize,
}

impl Default for Conv2dAttrs {
    fn default() -> Self {
        Self {
            data_format: DataFormat::Nchw,
            padding_algorithm: PaddingAlgorithm::Explicit,
            strides: [1, 1],
            paddings: Paddings::default(),
            dilations: [1, 1],
            groups: 1,
        }
    }
}

impl Conv2dAttrs {
    pub fn from_attrs(node: NodeId, attrs: &Attrs) -> Result<Self> {
        let defaults = Self::default();
        let data_format = attrs.parsed(node, "data_format", defaults.data_format)?;
        let padding_algorithm =
            attrs.parsed(node, "padding_algorithm", defaults.padding_algorithm)?;

        let strides = match attrs.ints(node, "strides")? {
            Some(v) => pair(node, "strides", v, 1)?,
            None => defaults.strides,
        };
        let dilations = match attrs.ints(node, "dilations")? {
            Some(v) => pair(node, "dilations", v, 1)?,
            None => defaults.dilations,
        };
        let paddings = match attrs.ints(node, "paddings")? {
            Some(v) => {
                let values = non_negative(node, "paddings", v)?;
                Paddings::from_values(&values).map_err(|reason| Error::Attribute {
                    node,
                    name: "paddings".into(),
                    reason,
                })?
            }
            None => defaults.paddings,
        };
        let groups = match attrs.int(node, "groups")? {
            Some(g) if g >= 1 => g as usize,
            Some(g) => {
                return Err(Error::Attribute {
                    node,
                    name: "groups".into(),
                    reason: format!("must be positive, got {g}"),
                })
            }
            None => defaults.groups,
        };

        Ok(Self {
            data_format,
            padding_algorithm,
            strides,
            paddings,
            dilations,
            groups,
        })
    }
}

/// Checked view of an `elementwise_add` node's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementwiseAttrs {
    pub axis: i64,
}

impl ElementwiseAttrs {
    pub fn from_attrs(node: NodeId, attrs: &Attrs) -> Result<Self> {
        let axis = attrs.int(node, "axis")?.unwrap_or(-1);
        if !(-1..=1).contains(&axis) {
            return Err(Error::Attribute {
                node,
                name: "axis".into(),
                reason: format!("expected -1, 0 or 1, got {axis}"),
            });
        }
        Ok(Self { axis })
    }

    /// `axis == 1` broadcasts `Y` along the channel dimension of `X`.
    pub fn is_channel_broadcast(&self) -> bool {
        self.axis == 1
    }
}

fn non_negative(node: NodeId, name: &str, values: &[i64]) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|&v| {
            usize::try_from(v).map_err(|_| Error::Attribute {
                node,
                name: name.to_string(),
                reason: format!("negative value {v}"),
            })
        })
        .collect()
}

fn pair(node: NodeId, name: &str, values: &[i64], min: usize) -> Result<[usize; 2]> {
    let values = non_negative(node, name, values)?;
    match *values.as_slice() {
        [h, w] if h >= min && w >= min => Ok([h, w]),
        [_, _] => Err(Error::Attribute {
            node,
            name: name.to_string(),
            reason: format!("values must be >= {min}, got {values:?}"),
        }),
        _ => Err(Error::Attribute {
            node,
            name: name.to_string(),
            reason: format!("expected 2 values, got {}", values.len()),
        }),
    }
}
