//! Graph passes and the driver that runs them.

mod conv_elementwise_add;

pub use conv_elementwise_add::{
    apply_fusion, conv_elementwise_add_template, resolve_residual, ConvElementwiseAddFusePass,
    ResidualKind, FUSED_OP,
};

use std::collections::BTreeMap;

use log::info;

use crate::error::{Error, Result};
use crate::ir::Graph;

/// Summary of one pass invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassResult {
    pub applied: bool,
    /// Number of rewrites performed.
    pub match_count: usize,
}

impl PassResult {
    pub fn from_count(match_count: usize) -> Self {
        Self {
            applied: match_count > 0,
            match_count,
        }
    }
}

/// A named, idempotent graph transformation.
///
/// A pass either completes or leaves the graph exactly as it found it.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn run(&self, graph: &mut Graph) -> Result<PassResult>;
}

type PassCtor = fn() -> Box<dyn Pass>;

/// Name -> constructor table for the built-in passes.
pub struct PassRegistry {
    passes: BTreeMap<&'static str, PassCtor>,
}

impl Default for PassRegistry {
    fn default() -> Self {
        let mut registry = Self {
            passes: BTreeMap::new(),
        };
        registry.register(ConvElementwiseAddFusePass::NAME, || {
            Box::new(ConvElementwiseAddFusePass::new())
        });
        // name used by the oneDNN-backed inference configs
        registry.register("conv_elementwise_add_mkldnn_fuse_pass", || {
            Box::new(ConvElementwiseAddFusePass::new())
        });
        registry
    }
}

impl PassRegistry {
    pub fn register(&mut self, name: &'static str, ctor: PassCtor) {
        self.passes.insert(name, ctor);
    }

    pub fn get(&self, name: &str) -> Result<Box<dyn Pass>> {
        self.passes
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| Error::UnknownPass(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.passes.keys().copied()
    }
}

/// Runs passes in order, validating the graph after each one. A pass that
/// fails, or leaves an invalid graph behind, is rolled back before the
/// error is returned.
#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names(registry: &PassRegistry, names: &[&str]) -> Result<Self> {
        let passes = names
            .iter()
            .map(|name| registry.get(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { passes })
    }

    pub fn add(&mut self, pass: Box<dyn Pass>) -> &mut Self {
        self.passes.push(pass);
        self
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn run(&self, graph: &mut Graph) -> Result<Vec<(&'static str, PassResult)>> {
        let mut results = Vec::with_capacity(self.passes.len());
        for pass in &self.passes {
            let snapshot = graph.clone();
            let result = match pass.run(graph).and_then(|r| graph.validate().map(|()| r)) {
                Ok(result) => result,
                Err(e) => {
                    *graph = snapshot;
                    return Err(e);
                }
            };
            info!(
                "{}: applied={} rewrites={}",
                pass.name(),
                result.applied,
                result.match_count
            );
            results.push((pass.name(), result));
        }
        Ok(results)
    }
}
