//! Wire protocol for rts connections.
//!
//! Every connection carries newline-terminated ASCII lines. Single upper
//! case letters are reserved keywords (state, values, messages, binary
//! headers, replies); any other line is a command for the peer. Raw binary
//! payload follows a `C` header out of band of line parsing, so the
//! [`RecvBuffer`] hands out both lines and raw byte runs.
//!
//! This crate does no I/O: it parses and encodes, nothing more.

mod buffer;
mod line;
mod params;
pub mod status;

pub use buffer::{LineError, RecvBuffer};
pub use line::{
    AuthLine, DataHeader, Line, ProtoError, ValueOp, E_COMMAND, E_CONNECTION, E_HW,
    E_NOT_AUTHORIZED, E_PARAMSNUM, E_PARAMSVAL, E_SYSTEM, E_TIMEOUT, INFO_TIME, OK,
    quote,
};
pub use params::{ParamError, Params};
pub use status::DeviceState;
