//! Error types shared across the quern crates.

use std::fmt;

pub type Result<T, E = QuernError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum QuernError {
    #[error("{0}")]
    String(String),

    #[error("Feature not implemented: {0}")]
    NotImplemented(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{msg}: {source}")]
    Context {
        msg: String,
        #[source]
        source: Box<QuernError>,
    },
}

impl QuernError {
    pub fn new(msg: impl Into<String>) -> Self {
        QuernError::String(msg.into())
    }

    pub fn with_context(self, msg: impl Into<String>) -> Self {
        QuernError::Context {
            msg: msg.into(),
            source: Box::new(self),
        }
    }
}

/// Return early with a "not implemented" error.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)*) => {
        return Err($crate::QuernError::NotImplemented(format!($($arg)*)))
    };
}

pub trait ResultExt<T> {
    /// Wrap an error with additional context.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap an error with lazily formatted context.
    fn context_fn<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<QuernError>,
{
    fn context(self, msg: &'static str) -> Result<T> {
        self.map_err(|e| e.into().with_context(msg))
    }

    fn context_fn<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}

pub trait OptionExt<T> {
    /// Convert a None into an error indicating a required value was missing.
    fn required(self, what: impl fmt::Display) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, what: impl fmt::Display) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(QuernError::new(format!("Missing required value: {what}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_message() {
        let err: Result<()> = Err(QuernError::new("inner"));
        let err = err.context("outer").unwrap_err();
        assert_eq!("outer: inner", err.to_string());
    }

    #[test]
    fn required_on_none() {
        let opt: Option<usize> = None;
        let err = opt.required("thing").unwrap_err();
        assert!(err.to_string().contains("thing"));
    }
}
