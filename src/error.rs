use thiserror::Error;

/// Errors surfaced by the reconstruction entry points.
///
/// Numeric and topology problems during the solve are never fatal (they are
/// logged and the pipeline continues); only unusable inputs are reported
/// here.
#[derive(Debug, Error)]
pub enum ReconstructionError {
    /// The point stream contained no sample inside the working domain.
    #[error("the point stream produced no usable samples")]
    EmptyPointSet,

    /// A configuration value is out of range.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}
