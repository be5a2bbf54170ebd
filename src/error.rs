use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Siacache errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid build configuration: bad parameter value, non-empty output
    /// directory, or a width constraint violation.
    Config(String),
    /// Invalid user input, typically a malformed query key or cursor.
    InvalidInput(String),
    /// Adjacent pages of a paged map cannot be separated; the fastmap
    /// prefix length must be increased.
    PrefixTooShort,
    /// An overflow-file offset does not fit in the configured offset width.
    OffsetTooNarrow,
    /// The item store outgrew the configured offset width.
    OffsetSpaceExhausted,
    /// A dataset file is inconsistent with the stored parameters, or an
    /// on-disk structure failed to decode.
    Corrupt(String),
    /// A history cursor is beyond the largest stored index for the key.
    TooLargeIndex,
    /// An item carries a compression tag this build does not understand.
    UnknownCompression(u8),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::PrefixTooShort => write!(f, "prefix is too short to separate pages"),
            Error::OffsetTooNarrow => write!(f, "too large offset; increase the offset width"),
            Error::OffsetSpaceExhausted => {
                write!(f, "item store offset does not fit; increase the offset width")
            }
            Error::Corrupt(msg) => write!(f, "corrupt dataset: {msg}"),
            Error::TooLargeIndex => write!(f, "too large item index"),
            Error::UnknownCompression(tag) => write!(f, "unknown compression tag {tag}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::Config for the given format string.
#[macro_export]
macro_rules! errconfig {
    ($($args:tt)*) => { $crate::error::Error::Config(format!($($args)*)) };
}

/// Constructs an Error::Corrupt for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)) };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)) };
}

/// A siacache Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}

impl From<snap::Error> for Error {
    fn from(err: snap::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}
