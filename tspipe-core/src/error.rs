//! Error types for the pipeline core.

use thiserror::Error;

/// Errors raised while building or running a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The pipeline was built without an input or output stage.
    #[error("Incomplete pipeline: {0}")]
    IncompletePipeline(&'static str),

    /// The packet buffer could not be allocated.
    #[error("Cannot allocate packet buffer of {0} packets")]
    BufferAllocation(usize),

    /// The requested buffer is too small for the stage count.
    #[error("Buffer of {buffer} packets is too small for {stages} stages")]
    BufferTooSmall { buffer: usize, stages: usize },

    /// A plugin refused to start.
    #[error("Plugin \"{0}\" failed to start")]
    StartFailed(String),

    /// A processor reported a fatal error or the pipeline was aborted
    /// after a plugin failure.
    #[error("Pipeline terminated on fatal error")]
    Fatal,
}

/// Errors raised when parsing or building sections and tables.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// The binary section is shorter than its header requires.
    #[error("Section too short: {0} bytes")]
    SectionTooShort(usize),

    /// The section length field is inconsistent with the data.
    #[error("Invalid section length: {0}")]
    InvalidSectionLength(usize),

    /// A table was handed to a parser for another table id.
    #[error("Unexpected table id 0x{0:02X}")]
    UnexpectedTableId(u8),

    /// The table sections do not form a complete, consistent set.
    #[error("Incomplete table: {received}/{expected} sections")]
    IncompleteTable { received: usize, expected: usize },

    /// A descriptor payload is malformed.
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(&'static str),

    /// Structured payload data is malformed.
    #[error("Invalid table payload: {0}")]
    InvalidPayload(&'static str),

    /// The table does not fit the single-section build limit.
    #[error("Table payload too large to build: {0} bytes")]
    PayloadTooLarge(usize),
}
