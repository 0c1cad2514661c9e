//! Error Types
//!
//! Module loading and validation report structured errors; the render path
//! never fails at runtime (defensive checks substitute neutral values
//! instead). The taxonomy distinguishes malformed input from structural
//! inconsistency so that callers can decide whether a retry makes sense.

use std::fmt;

/// An error raised while loading or validating module data, or by a
/// misused API call.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleError {
    /// Malformed JSON, out-of-range index, unknown field or illegal
    /// identifier; carries an optional source location.
    Parse {
        message: String,
        /// Byte offset or key path where the problem was found.
        position: Option<String>,
    },
    /// Structural inconsistency across keys: missing manifest, dangling
    /// connection endpoint, port numbering gap, cyclic connection.
    Format { message: String },
    /// Allocation failure; distinguished from parse errors so callers may
    /// retry with smaller settings.
    Memory { message: String },
    /// Invalid parameter to an API call.
    Argument { message: String },
    /// Embedded resource data (e.g. sample audio) failed to decode.
    Resource { message: String },
}

impl ModuleError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            position: None,
        }
    }

    pub fn parse_at(message: impl Into<String>, position: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            position: Some(position.into()),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    /// The human-readable message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Parse { message, .. }
            | Self::Format { message }
            | Self::Memory { message }
            | Self::Argument { message }
            | Self::Resource { message } => message,
        }
    }
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { message, position } => match position {
                Some(pos) => write!(f, "parse error at {}: {}", pos, message),
                None => write!(f, "parse error: {}", message),
            },
            Self::Format { message } => write!(f, "format error: {}", message),
            Self::Memory { message } => write!(f, "memory error: {}", message),
            Self::Argument { message } => write!(f, "argument error: {}", message),
            Self::Resource { message } => write!(f, "resource error: {}", message),
        }
    }
}

impl std::error::Error for ModuleError {}
