//! Built-in stage plugins and the processor registry.

mod file;
mod null;

pub use file::{FileInput, FileOutput};
pub use null::{Nullify, PassThrough};

/// Name and one-line description of every built-in processor.
pub const PROCESSORS: &[(&str, &str)] = &[
    ("pass", "Pass packets through unchanged"),
    ("null", "Replace every packet with a null packet"),
    ("scrambler", "DVB scrambler (fixed control word)"),
];
