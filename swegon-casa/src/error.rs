use std::net::SocketAddr;
use std::time::Duration;

use crate::codec::Quantity;
use crate::value::ValueKind;

/// Communication failure on the Modbus link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to resolve {host}:{port}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("no socket address found for {host}:{port}")]
    NoAddress { host: String, port: u16 },

    #[error("connection to {addr} failed")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("modbus request failed: {0}")]
    Request(String),

    #[error("device rejected the request: {0}")]
    Exception(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("expected {expected} registers, got {got}")]
    ShortResponse { expected: Quantity, got: usize },

    #[error("not connected")]
    NotConnected,
}

impl TransportError {
    /// Whether the session should be considered broken after this error.
    ///
    /// A Modbus exception is a well-formed answer, so the link is still healthy.
    pub fn is_link_failure(&self) -> bool {
        !matches!(self, Self::Exception(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown datapoint {group}/{key}")]
    NotFound { group: String, key: String },

    #[error("unknown datapoint group {0}")]
    GroupNotFound(String),

    #[error("datapoint {group}/{key} is read-only")]
    ReadOnly { group: String, key: String },

    #[error("datapoint {group}/{key} holds {expected} values, got {actual}")]
    TypeMismatch {
        group: String,
        key: String,
        expected: ValueKind,
        actual: String,
    },

    #[error("value {value} for {group}/{key} is outside {min}..={max}")]
    OutOfRange {
        group: String,
        key: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error(transparent)]
    Communication(#[from] TransportError),

    #[error("writing {group}/{key} failed")]
    Write {
        group: String,
        key: String,
        #[source]
        source: TransportError,
    },

    #[error("refresh cycle exceeded {0:?}")]
    CycleTimeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
