use std::fmt;
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Parse,
    Option,
    Format,
    Io,
    Cancelled,
    Backend,
    Range,
    NotImplemented,
    Internal,
}

impl ErrorKind {
    /// Stable code reported to the client
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse-error",
            ErrorKind::Option => "option-error",
            ErrorKind::Format => "format-error",
            ErrorKind::Io => "io-error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Backend => "backend-error",
            ErrorKind::Range => "range-error",
            ErrorKind::NotImplemented => "not-implemented",
            ErrorKind::Internal => "internal-error",
        }
    }

    /// HTTP status the request boundary maps this kind to
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Parse | ErrorKind::Option | ErrorKind::Range => 400,
            ErrorKind::NotImplemented => 501,
            ErrorKind::Cancelled => 499,
            ErrorKind::Backend => 502,
            ErrorKind::Format | ErrorKind::Io | ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn parse(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Parse, context.into())
    }

    pub fn option(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Option, context.into())
    }

    pub fn format(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Format, context.into())
    }

    pub fn cancelled() -> Self {
        Error::new(ErrorKind::Cancelled, "cancelled".to_string())
    }

    /// Prefix the context, keeping the kind
    pub fn wrap(self, prefix: &str) -> Self {
        Error {
            kind: self.kind,
            context: format!("{}: {}", prefix, self.context),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Format,
            context: err.to_string(),
        }
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error {
            kind: ErrorKind::Option,
            context: format!("bad regexp: {}", err),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error {
            kind: ErrorKind::Backend,
            context: format!("HTTP error: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
