//! Error types for rts operations.

use rts_proto::{LineError, ParamError, ProtoError};

/// Alias for `Result<T, rts::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by engine operations.
///
/// Command failures reported by a peer are not errors; they reach the
/// command's originator as an [`Outcome`](crate::Outcome).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A socket or file operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A system call wrapped by nix failed.
    #[error("system call failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    /// A received line does not follow the protocol.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// A line could not be cut out of the receive buffer.
    #[error(transparent)]
    Line(#[from] LineError),

    /// A parameter is missing or malformed.
    #[error(transparent)]
    Param(#[from] ParamError),

    /// A value was accessed as a type it does not have.
    #[error("value {name} is {actual}, not {expected}")]
    ValueType {
        /// Value name.
        name: String,
        /// Requested type.
        expected: &'static str,
        /// Declared type.
        actual: &'static str,
    },

    /// No value with this name exists.
    #[error("unknown value {0}")]
    UnknownValue(String),

    /// A value with this name already exists.
    #[error("value {0} already exists")]
    DuplicateValue(String),

    /// The value cannot be changed by peers.
    #[error("value {0} is read-only")]
    ReadOnly(String),

    /// The flags do not name a supported value type.
    #[error("unsupported value flags {0:#x}")]
    ValueFlags(u32),

    /// The selection has no such option.
    #[error("value {name} has no option {option:?}")]
    Selection {
        /// Value name.
        name: String,
        /// Rejected index or label.
        option: String,
    },

    /// No open data channel matches.
    #[error("no open data channel {chan} on data connection {data_conn}")]
    UnknownChannel {
        /// Data-connection id.
        data_conn: i32,
        /// Channel index.
        chan: usize,
    },

    /// A transfer would exceed the declared channel size.
    #[error(
        "{len} bytes overflow channel {chan} of data connection {data_conn} ({remaining} left)"
    )]
    ChannelOverflow {
        /// Data-connection id.
        data_conn: i32,
        /// Channel index.
        chan: usize,
        /// Rejected transfer size.
        len: usize,
        /// Bytes still expected.
        remaining: usize,
    },

    /// No open transfer with this data-connection id.
    #[error("no open transfer on data connection {0}")]
    UnknownTransfer(i32),

    /// A FITS BITPIX code this side does not know.
    #[error("unknown data type {0}")]
    DataType(i32),

    /// The shared memory segment was already detached.
    #[error("shared memory segment {0} is detached")]
    SharedDetached(i32),

    /// A shared memory write outside the segment.
    #[error("shared memory segment {key} holds {len} bytes")]
    SharedBounds {
        /// Segment key.
        key: i32,
        /// Segment size.
        len: usize,
    },

    /// The connection has no usable socket.
    #[error("connection {0} is not connected")]
    NotConnected(String),

    /// No connection with this id or name exists.
    #[error("unknown connection {0}")]
    UnknownConnection(String),

    /// A configuration file could not be decoded.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// A configured address does not resolve.
    #[error("cannot resolve address {0}")]
    Address(String),
}
