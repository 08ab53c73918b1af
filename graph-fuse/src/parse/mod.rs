//! Loaders for serialized graph descriptions.

pub mod program;

pub use program::{from_program, load, save, to_program, OpDesc, Program, TensorDesc};
