use crate::error::ErrorBag;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Error wrapper carrying the source location of the failed call site.
pub struct EngineError {
    pub inner: ErrorBag,
    pub msg: Option<String>,
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl EngineError {
    pub fn inner(&self) -> &ErrorBag {
        &self.inner
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(msg) = &self.msg {
            write!(
                f,
                "{} {} at {}:{}:{}",
                msg, self.inner, self.file, self.line, self.column
            )
        } else {
            write!(
                f,
                "{} at {}:{}:{}",
                self.inner, self.file, self.line, self.column
            )
        }
    }
}

impl std::fmt::Debug for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.inner)
    }
}
