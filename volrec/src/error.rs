//! Module containing the universal error type
use thiserror::Error;

/// Universal error type for volume reconstruction
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed caller data (buffer sizes, empty sets, bad arguments)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing or invalid configuration value
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The requested operation is not implemented for this dimension
    #[error("unsupported dimension: {0}")]
    UnsupportedDimension(usize),

    /// Point index exceeds the number of loaded points
    #[error("index {index} is out of range for {len} points")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of available items
        len: usize,
    },

    /// A lifecycle stage was called before its prerequisites
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// The boundary vertex solver did not converge
    #[error("solve failure: {0}")]
    SolveFailure(String),

    /// Error with an additional layer of context
    #[error("{context}")]
    Context {
        /// Description of what was being done
        context: String,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns the innermost error, skipping any layers of context
    pub fn root(&self) -> &Error {
        let mut e = self;
        while let Error::Context { source, .. } = e {
            e = source;
        }
        e
    }
}

/// Extension trait to attach context to a [`Result`]
pub trait ResultExt<T> {
    /// Wraps the error (if any) with a lazily-built description
    fn with_context<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn with_context<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::Context {
            context: f().into(),
            source: Box::new(source),
        })
    }
}
