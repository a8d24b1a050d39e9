//! Path transfer engine: remaps JSON fields between a flat caller document and
//! a namespaced internal document.

pub mod path;
mod transfers;

pub use path::{Path, Segment, TypeHint};
pub use transfers::*;

/// `name.input`
pub fn input_namespace(name: &str) -> String {
    format!("{}.{}", name, INPUT_SEGMENT)
}

/// `name.output`
pub fn output_namespace(name: &str) -> String {
    format!("{}.{}", name, OUTPUT_SEGMENT)
}
