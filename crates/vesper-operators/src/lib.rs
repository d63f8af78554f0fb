//! Compile-time evaluators for vesper operator kinds.
//!
//! Stages whose inputs are all known at compile time are replaced by their
//! results during constant folding. This crate supplies the evaluators and
//! the shared registry the compiler looks them up in.
//!
//! # Evaluator Families
//!
//! - **Binary elementwise**: Add, Sub, Mul, Div, Max, Min (broadcasting)
//! - **Unary elementwise**: Relu, Power
//!
//! # Individual Evaluators
//!
//! - Shape (Reshape, Squeeze, Unsqueeze, Flatten, Copy)
//! - Indexing (Concat, Split, Gather, Slice, Tile)
//! - Generators (Fill, Range)

pub mod families;

mod folders;
mod helpers;
mod registry;

pub use families::{BinaryElementwiseFolder, UnaryElementwiseFolder};
pub use registry::{core_fold_registry, fold_registry};
