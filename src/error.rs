//! Shared error types.

use std::fmt::{Display, Formatter};
use std::io;

//------------ IoError -------------------------------------------------------

/// An I/O error together with context about what was attempted.
///
/// `std::io::Error` on its own rarely tells an operator what went wrong
/// where; every I/O call site wraps its error with a human-readable
/// context string.
#[derive(Debug)]
pub struct IoError {
    context: String,
    cause: io::Error,
}

impl IoError {
    pub fn new(context: impl Into<String>, cause: io::Error) -> Self {
        IoError {
            context: context.into(),
            cause,
        }
    }
}

impl Display for IoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.context, self.cause)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}
