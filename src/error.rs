//! utunnel Error Types

use std::io;

use thiserror::Error;

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// utunnel error types
///
/// Every tunnel variant carries the name of the operation that failed
/// (`op`) and, where the kernel produced the failure, the original OS error.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Config file reads, and name fetches after the interface exists
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // Interface creation
    #[error("{op}: failed to create control socket: {source}")]
    Creation {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op}: kernel control {name:?} not found: {source}")]
    Lookup {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{op}: failed to connect to kernel control: {source}")]
    Connect {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    // Handle lifecycle
    #[error("{op}: tunnel is closed")]
    Closed { op: &'static str },

    #[error("{op}: shutdown failed: {source}")]
    Shutdown {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    // Packet I/O
    #[error("{op}: {source}")]
    Read {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op}: {source}")]
    Write {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    // Interface configuration
    #[error("{op}: {reason}")]
    Unsupported { op: &'static str, reason: String },

    #[error("{op}: {request} (0x{code:08x}) failed: {source}")]
    Ioctl {
        op: &'static str,
        request: &'static str,
        code: u64,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Name of the operation that produced this error, if it came from a tunnel call
    pub fn op(&self) -> Option<&'static str> {
        match self {
            Error::Creation { op, .. }
            | Error::Lookup { op, .. }
            | Error::Connect { op, .. }
            | Error::Closed { op }
            | Error::Shutdown { op, .. }
            | Error::Read { op, .. }
            | Error::Write { op, .. }
            | Error::Unsupported { op, .. }
            | Error::Ioctl { op, .. } => Some(*op),
            Error::Config(_) | Error::ConfigParse(_) | Error::Io(_) => None,
        }
    }

    /// The underlying OS error, when there is one
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            Error::Io(source)
            | Error::Creation { source, .. }
            | Error::Lookup { source, .. }
            | Error::Connect { source, .. }
            | Error::Shutdown { source, .. }
            | Error::Read { source, .. }
            | Error::Write { source, .. }
            | Error::Ioctl { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Check if this error came from a closed (or closing) handle
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed { .. })
    }

    /// Check if this error is retryable
    ///
    /// Only a failed connect qualifies: a unit may become free later.
    /// Interrupted reads never surface; they are retried internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connect { .. })
    }
}
