//! Notifications a connection raises for its owning block.

use std::fmt;

use rts_proto::{DeviceState, ValueOp};

use crate::command::Outcome;
use crate::connection::{ConnId, ConnState};
use crate::data::DataType;
use crate::message::Message;

/// Something that happened on one connection.
///
/// Connections queue events while they run; the block drains them after
/// every reactor step and hands them to its [`Handler`](crate::Handler).
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// Connection state moved.
    ConnState {
        /// Previous state.
        old: ConnState,
        /// New state.
        new: ConnState,
    },
    /// The peer reported a new device state. Handlers see it after the
    /// connection has stored `new`; `old` is the state it replaced.
    StateChanged {
        /// Previous state.
        old: DeviceState,
        /// New state.
        new: DeviceState,
        /// Optional explanation from the peer.
        message: Option<String>,
    },
    /// The peer reported extra BOP bits.
    BopReported(u32),
    /// The peer reported the span of its current operation.
    Progress {
        /// Start, epoch seconds.
        start: f64,
        /// Expected end, epoch seconds.
        end: f64,
    },
    /// A log record arrived.
    Message(Message),
    /// The peer declared a value.
    ValueDeclared(String),
    /// A mirrored value changed.
    ValueChanged(String),
    /// The peer asks to change one of our values.
    SetValue {
        /// Value name.
        name: String,
        /// Operator.
        op: ValueOp,
        /// Encoded operand.
        raw: String,
    },
    /// The peer sent a command to execute; it expects a reply.
    Command(String),
    /// A queued command got its reply or was failed locally.
    CommandReturned {
        /// Command text.
        command: String,
        /// Result.
        outcome: Outcome,
    },
    /// A streamed transfer was announced.
    DataStart {
        /// Data-connection id.
        data_conn: i32,
        /// Element type.
        data_type: DataType,
        /// Channel sizes.
        sizes: Vec<usize>,
    },
    /// A streamed channel is complete.
    DataComplete {
        /// Data-connection id.
        data_conn: i32,
        /// Channel index.
        chan: usize,
        /// Element type.
        data_type: DataType,
        /// Channel content.
        data: Vec<u8>,
    },
    /// A shared memory transfer is mapped and readable.
    SharedStart {
        /// Data-connection id.
        data_conn: i32,
        /// Segment key.
        key: i32,
        /// Element type.
        data_type: DataType,
        /// Channel sizes within the segment.
        sizes: Vec<usize>,
    },
    /// A shared memory transfer ended and was detached.
    SharedEnd {
        /// Data-connection id.
        data_conn: i32,
        /// Segment key.
        key: i32,
    },
    /// A client asks to be authorized.
    AuthRequest {
        /// Client id on the central node.
        centrald_id: i32,
        /// Central node number.
        centrald_num: i32,
        /// Key to verify.
        key: i32,
    },
    /// The central node answered an authorization relayed through it.
    AuthReply {
        /// Client id on the central node.
        centrald_id: i32,
        /// Verdict.
        ok: bool,
    },
    /// The connection failed; its commands were failed and its values and
    /// transfers dropped.
    Broken {
        /// Cause.
        reason: String,
    },
    /// The connection was removed from the block and its socket closed.
    Deleted,
}

/// Told about device state changes before the new state is stored.
///
/// Runs synchronously inside [`Connection::set_state`](crate::Connection::set_state)
/// and [`Block::set_state`](crate::Block::set_state), so the observer sees
/// the transition while the old state is still in effect.
pub trait StateObserver: fmt::Debug {
    /// `conn` is the peer whose state changed, `None` for the block's own.
    fn state_changed(&self, conn: Option<ConnId>, old: DeviceState, new: DeviceState);
}
