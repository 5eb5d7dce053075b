#[cfg(feature = "python")]
use pyo3::prelude::PyErr;
use thiserror::Error;

/// Enum for errors in this crate
#[derive(Error, Debug)]
pub enum TramError {
    /// Error returned when TramBuilder.build() was called improperly
    #[error("Could not build Tram: {0}")]
    BuilderError(String),

    /// Error returned when an input array does not have the shape implied by the other inputs
    #[error("{name} has shape {found:?}; shape should be {expected:?}")]
    ShapeMismatch {
        /// Name of the offending argument
        name: &'static str,
        /// Shape that was passed in
        found: Vec<usize>,
        /// Shape implied by the other arguments
        expected: Vec<usize>,
    },

    /// Error returned when an array is the wrong length
    #[error("Array of length {0} is incorrect; length should be {1}")]
    ArrayLengthMismatch(usize, usize),

    /// Error returned when an input holds NaN, or -inf where only finite values or +inf make sense
    #[error("{name} holds a non-finite value at index {index:?}")]
    NonFiniteInput {
        /// Name of the offending argument
        name: &'static str,
        /// Multi-index of the first offending entry
        index: Vec<usize>,
    },

    /// Error returned when a label or state index is outside its valid range
    #[error("{name} holds index {index}, which is out of range for {bound} states")]
    IndexOutOfRange {
        /// Name of the offending argument
        name: &'static str,
        /// The offending value
        index: i64,
        /// Exclusive upper bound of valid values
        bound: usize,
    },

    /// Error returned when a count or label arrives as a negative integer
    #[error("{name} holds the negative value {value}")]
    NegativeInteger {
        /// Name of the offending argument
        name: &'static str,
        /// The offending value
        value: i64,
    },

    /// Error returned when a python exception is not handled
    #[cfg(feature = "python")]
    #[error("Unexpected Python exception was not handled")]
    UnhandledPythonException {
        #[allow(missing_docs)]
        #[from]
        source: PyErr,
    },
}

impl From<String> for TramError {
    fn from(s: String) -> Self {
        Self::BuilderError(s)
    }
}

/// Result type for the tram-rs crate
pub type Result<T> = std::result::Result<T, TramError>;

/// Fail with `ShapeMismatch` unless `found` equals `expected`
pub(crate) fn check_shape(name: &'static str, found: &[usize], expected: &[usize]) -> Result<()> {
    if found != expected {
        return Err(TramError::ShapeMismatch {
            name,
            found: found.to_vec(),
            expected: expected.to_vec(),
        });
    }
    Ok(())
}

/// Fail with `IndexOutOfRange` on the first label that is not below `bound`
pub(crate) fn check_labels<'a, I>(name: &'static str, labels: I, bound: usize) -> Result<()>
where
    I: IntoIterator<Item = &'a usize>,
{
    match labels.into_iter().find(|&&label| label >= bound) {
        Some(&label) => Err(TramError::IndexOutOfRange {
            name,
            index: label as i64,
            bound,
        }),
        None => Ok(()),
    }
}
