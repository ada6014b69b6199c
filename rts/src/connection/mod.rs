//! Per-link protocol engine.
//!
//! A [`Connection`] owns one socket, its receive and send buffers, the
//! command queue, the mirror of the peer's device state and values, and the
//! binary transfers running over the link. It never blocks: the owning
//! [`Block`](crate::Block) calls [`receive`](Connection::receive),
//! [`writable`](Connection::writable) and [`idle`](Connection::idle) when the
//! readiness wait says so, then drains [`Event`]s.

mod handle;
mod socket;

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rts_proto::{AuthLine, DataHeader, DeviceState, E_CONNECTION, Line, RecvBuffer};

pub use self::socket::Socket;
use self::socket::{Connecting, connect_nonblocking, take_socket_error};
use crate::command::{Command, CommandQueue, Originator, Outcome};
use crate::config::ConnectionConfig;
use crate::data::{DataChannels, DataType};
use crate::error::{Error, Result};
use crate::event::{Event, StateObserver};
use crate::message::Message;
use crate::shm::SharedSegment;
use crate::value::{Value, Values};

/// Socket reads per readiness event before yielding to other connections.
const MAX_READS: usize = 8;

/// Identifier of a connection within its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u32);

impl ConnId {
    /// Wraps a raw id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnState {
    /// Outbound connection not started.
    Unknown,
    /// Waiting for the device address.
    ResolvingDevice,
    /// Creating the socket.
    Connecting,
    /// Non-blocking connect in flight.
    InProgress,
    /// Commands may flow.
    Connected,
    /// Failed; awaiting removal.
    Broken,
    /// Removed; the socket is closed.
    Delete,
    /// Authorization requested, not yet answered.
    AuthPending,
    /// Authorization granted.
    AuthOk,
    /// Authorization refused; awaiting removal.
    AuthFailed,
}

impl ConnState {
    /// Lower-case label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::ResolvingDevice => "resolving device",
            Self::Connecting => "connecting",
            Self::InProgress => "in progress",
            Self::Connected => "connected",
            Self::Broken => "broken",
            Self::Delete => "delete",
            Self::AuthPending => "auth pending",
            Self::AuthOk => "auth ok",
            Self::AuthFailed => "auth failed",
        }
    }

    /// `true` once the connection awaits removal.
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Broken | Self::Delete | Self::AuthFailed)
    }

    /// `true` while the socket carries protocol traffic.
    pub const fn is_linked(self) -> bool {
        matches!(self, Self::Connected | Self::AuthPending | Self::AuthOk)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnType {
    /// Not known yet.
    #[default]
    NotDefined,
    /// A client talking to us.
    Client,
    /// A device we talk to as a client.
    Device,
    /// Two devices talking to each other.
    DeviceDevice,
}

/// Streamed chunk whose raw bytes are being received.
#[derive(Debug)]
struct ActiveRead {
    /// Data-connection id.
    data_conn: i32,
    /// Channel index.
    chan: usize,
    /// Bytes still to come.
    remaining: usize,
    /// `false` when the chunk was rejected and its bytes are skipped.
    keep: bool,
}

/// One protocol link.
#[derive(Debug)]
pub struct Connection {
    /// Id within the block.
    id: ConnId,
    /// Peer name.
    name: String,
    /// Our own name, used as message originator.
    local_name: String,
    /// Peer role.
    conn_type: ConnType,
    /// Life cycle state.
    conn_state: ConnState,
    /// When `conn_state` last changed.
    state_since: Instant,
    /// Socket, until the connection is deleted.
    socket: Option<Box<dyn Socket>>,
    /// Received bytes not yet consumed.
    recv: RecvBuffer,
    /// Bytes accepted for sending but not yet written.
    outbuf: Vec<u8>,
    /// Last time bytes were written.
    sent_at: Instant,
    /// Last time bytes were read.
    recv_at: Instant,
    /// When the outstanding keepalive probe was sent.
    keepalive_sent: Option<Instant>,
    /// Idle-send timeout; `None` disables timeout checks.
    timeout: Option<Duration>,
    /// Wait for traffic after a keepalive probe.
    grace: Duration,
    /// Largest binary frame.
    data_frame: usize,
    /// Protocol errors tolerated in a row.
    max_protocol_errors: u32,
    /// Protocol errors seen in a row.
    protocol_errors: u32,
    /// Outgoing commands.
    queue: CommandQueue,
    /// Device state reported by the peer.
    state: DeviceState,
    /// BOP bits reported by the peer with `B`.
    peer_bop: u32,
    /// BOP bits of blocking connections, set by the block.
    external_bop: u32,
    /// Span of the peer's current operation.
    progress: Option<(f64, f64)>,
    /// Values declared by the peer.
    values: Values,
    /// Info time seen by the last [`info_time_changed`](Self::info_time_changed).
    last_info_time: Option<f64>,
    /// Transfers we send.
    write_channels: DataChannels,
    /// Transfers we receive.
    read_channels: DataChannels,
    /// Chunk currently being received.
    active_read: Option<ActiveRead>,
    /// Shared segments we announced, data-connection id to key.
    shared_out: BTreeMap<i32, i32>,
    /// Shared segments the peer announced, by data-connection id.
    shared_in: BTreeMap<i32, SharedSegment>,
    /// Next data-connection id to hand out.
    next_data_conn: i32,
    /// Client id on the central node.
    centrald_id: Option<i32>,
    /// Central node number.
    centrald_num: Option<i32>,
    /// Authorization key.
    key: Option<i32>,
    /// We asked the peer to authorize us.
    auth_requested: bool,
    /// Told about peer state changes before they are stored.
    observer: Option<Rc<dyn StateObserver>>,
    /// Events not yet drained by the block.
    events: Vec<Event>,
}

impl Connection {
    /// Wraps an established socket.
    pub fn new(
        id: ConnId,
        name: impl Into<String>,
        socket: Box<dyn Socket>,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        socket.set_nonblocking(true)?;
        let mut conn = Self::with_state(id, name.into(), ConnState::Connected, config);
        conn.socket = Some(socket);
        Ok(conn)
    }

    /// Creates an outbound connection to be connected by the block.
    pub fn outbound(id: ConnId, name: impl Into<String>, config: &ConnectionConfig) -> Self {
        let mut conn = Self::with_state(id, name.into(), ConnState::Unknown, config);
        conn.conn_type = ConnType::Device;
        conn
    }

    /// Shared constructor body.
    fn with_state(id: ConnId, name: String, conn_state: ConnState, config: &ConnectionConfig) -> Self {
        let now = Instant::now();
        Self {
            id,
            name,
            local_name: String::new(),
            conn_type: ConnType::NotDefined,
            conn_state,
            state_since: now,
            socket: None,
            recv: RecvBuffer::new(config.max_line),
            outbuf: Vec::new(),
            sent_at: now,
            recv_at: now,
            keepalive_sent: None,
            timeout: config.timeout(),
            grace: config.grace(),
            data_frame: config.data_frame.max(1),
            max_protocol_errors: config.max_protocol_errors,
            protocol_errors: 0,
            queue: CommandQueue::new(),
            state: DeviceState::default(),
            peer_bop: 0,
            external_bop: 0,
            progress: None,
            values: Values::new(),
            last_info_time: None,
            write_channels: DataChannels::new(),
            read_channels: DataChannels::new(),
            active_read: None,
            shared_out: BTreeMap::new(),
            shared_in: BTreeMap::new(),
            next_data_conn: 1,
            centrald_id: None,
            centrald_num: None,
            key: None,
            auth_requested: false,
            observer: None,
            events: Vec::new(),
        }
    }

    /// Id within the block.
    pub const fn id(&self) -> ConnId {
        self.id
    }

    /// Peer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the peer.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Sets our own name, used as originator of messages we send.
    pub fn set_local_name(&mut self, name: impl Into<String>) {
        self.local_name = name.into();
    }

    /// Peer role.
    pub const fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    /// Sets the peer role.
    pub const fn set_conn_type(&mut self, conn_type: ConnType) {
        self.conn_type = conn_type;
    }

    /// Client id on the central node.
    pub const fn centrald_id(&self) -> Option<i32> {
        self.centrald_id
    }

    /// Sets the client id on the central node.
    pub const fn set_centrald_id(&mut self, id: i32) {
        self.centrald_id = Some(id);
    }

    /// Central node number.
    pub const fn centrald_num(&self) -> Option<i32> {
        self.centrald_num
    }

    /// Sets the central node number.
    pub const fn set_centrald_num(&mut self, num: i32) {
        self.centrald_num = Some(num);
    }

    /// Authorization key.
    pub const fn key(&self) -> Option<i32> {
        self.key
    }

    /// Sets the authorization key. Returns `false` if one was already set.
    pub const fn set_key(&mut self, key: i32) -> bool {
        if self.key.is_some() {
            return false;
        }
        self.key = Some(key);
        true
    }

    /// Life cycle state.
    pub const fn conn_state(&self) -> ConnState {
        self.conn_state
    }

    /// Moves the life cycle state, raising [`Event::ConnState`].
    ///
    /// Entering `AuthFailed` or `Delete` fails every queued and running
    /// command with `E_CONNECTION`.
    pub fn set_conn_state(&mut self, new: ConnState) {
        let old = self.conn_state;
        if old == new {
            return;
        }
        tracing::debug!(conn = %self.name, id = %self.id, %old, %new, "connection state");
        self.conn_state = new;
        self.state_since = Instant::now();
        self.events.push(Event::ConnState { old, new });
        match new {
            ConnState::Connected => self.dispatch(),
            ConnState::AuthFailed | ConnState::Delete => self.fail_commands(),
            _ => {}
        }
    }

    /// `true` when commands may flow.
    pub fn is_connected(&self) -> bool {
        self.conn_state == ConnState::Connected
    }

    /// Device state reported by the peer.
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    /// Stores a new device state. When it differs from the previous one the
    /// state observer runs first, then [`Event::StateChanged`] is raised.
    pub fn set_state(&mut self, new: DeviceState, message: Option<String>) {
        let old = self.state;
        if old == new {
            return;
        }
        tracing::debug!(conn = %self.name, state = %new, "device state");
        if let Some(observer) = &self.observer {
            observer.state_changed(Some(self.id), old, new);
        }
        self.events.push(Event::StateChanged { old, new, message });
        self.state = new;
        self.dispatch();
    }

    /// Installs the observer told about peer state changes.
    pub fn set_state_observer(&mut self, observer: Option<Rc<dyn StateObserver>>) {
        self.observer = observer;
    }

    /// `true` when the peer reports good weather.
    pub const fn is_good_weather(&self) -> bool {
        self.state.is_good_weather()
    }

    /// `true` when the peer is idle.
    pub const fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    /// `true` when the peer allows movement.
    pub const fn can_move(&self) -> bool {
        self.state.can_move()
    }

    /// Device status without error, BOP, stop and weather bits.
    pub const fn real_state(&self) -> u32 {
        self.state.real_state()
    }

    /// Error sub-field of the peer state.
    pub const fn error_state(&self) -> u32 {
        self.state.error_state()
    }

    /// Human readable peer state.
    pub fn state_string(&self) -> String {
        self.state.to_string()
    }

    /// BOP bits this peer imposes: its state's BOP field and its `B` bits.
    pub const fn bop_state(&self) -> u32 {
        self.state.bop_state() | self.peer_bop
    }

    /// BOP bits gating our commands: [`bop_state`](Self::bop_state) plus
    /// the bits of every connection blocking this one.
    pub const fn full_bop_state(&self) -> u32 {
        self.bop_state() | self.external_bop
    }

    /// Sets the bits contributed by blocking connections.
    pub fn set_external_bop(&mut self, bits: u32) {
        if self.external_bop != bits {
            self.external_bop = bits;
            self.dispatch();
        }
    }

    /// Completed fraction of the peer's current operation at `now`.
    pub fn progress(&self, now: f64) -> Option<f64> {
        let (start, end) = self.progress?;
        (end > start).then(|| ((now - start) / (end - start)).clamp(0.0, 1.0))
    }

    /// Queues a command behind every earlier one.
    pub fn que_command(&mut self, command: Command) {
        tracing::trace!(conn = %self.name, command = command.text(), "queued");
        self.queue.push(command);
        self.dispatch();
    }

    /// Sends a command ahead of the queue, ignoring BOP state.
    ///
    /// It is written at once unless another command awaits its reply.
    pub fn que_send(&mut self, command: Command) {
        self.queue.push_immediate(command);
        self.dispatch();
    }

    /// Discards queued commands and a running command not yet written.
    pub fn que_clear(&mut self) {
        self.queue.clear();
    }

    /// `true` when nothing is queued and nothing awaits a reply.
    pub fn que_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// `true` when no command of `originator` is queued or running.
    pub fn que_empty_for_originator(&self, originator: &Rc<dyn Originator>) -> bool {
        self.queue.is_empty_for(originator)
    }

    /// `true` while a command of `originator` is queued or running.
    pub fn command_originator_pending(&self, originator: &Rc<dyn Originator>) -> bool {
        !self.que_empty_for_originator(originator)
    }

    /// The command queue.
    pub const fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Values declared by the peer.
    pub const fn values(&self) -> &Values {
        &self.values
    }

    /// Looks up a peer value.
    pub fn value(&self, name: &str) -> Result<&Value> {
        self.values.get(name)
    }

    /// Time of the peer's last info batch.
    pub fn info_time(&self) -> Option<f64> {
        self.values.info_time()
    }

    /// `true` once per distinct info time.
    pub fn info_time_changed(&mut self) -> bool {
        let now = self.info_time();
        if now.is_some() && now != self.last_info_time {
            self.last_info_time = now;
            true
        } else {
            false
        }
    }

    /// Forgets the seen info time so the next check reports a change.
    pub const fn reset_info_time(&mut self) {
        self.last_info_time = None;
    }

    /// Writes one protocol line.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        self.ensure_open()?;
        tracing::trace!(conn = %self.name, line, "send");
        self.outbuf.extend_from_slice(line.as_bytes());
        self.outbuf.push(b'\n');
        self.flush()
    }

    /// Sends a log record.
    pub fn send_message(&mut self, message: &Message) -> Result<()> {
        self.send_line(&message.to_line())
    }

    /// Sends our device state.
    pub fn send_state(&mut self, state: DeviceState, message: Option<&str>) -> Result<()> {
        self.send_line(&Line::Status { state, message }.to_string())
    }

    /// Sends extra BOP bits the peer must honor.
    pub fn send_bop_state(&mut self, bop: u32) -> Result<()> {
        self.send_line(&Line::BopState(bop).to_string())
    }

    /// Sends the span of our current operation.
    pub fn send_progress(&mut self, start: f64, end: f64) -> Result<()> {
        self.send_line(&Line::Progress { start, end }.to_string())
    }

    /// Declares a value (`E` and `F` lines).
    pub fn send_meta(&mut self, value: &Value) -> Result<()> {
        for line in value.meta_lines() {
            self.send_line(&line)?;
        }
        Ok(())
    }

    /// Sends the content of a value.
    pub fn send_value(&mut self, value: &Value) -> Result<()> {
        self.send_line(&value.value_line())
    }

    /// Sends pre-encoded content for a value.
    pub fn send_value_raw(&mut self, name: &str, raw: &str) -> Result<()> {
        self.send_line(&Line::Value { name, raw }.to_string())
    }

    /// Sends a time value.
    pub fn send_value_time(&mut self, name: &str, time: f64) -> Result<()> {
        self.send_value_raw(name, &time.to_string())
    }

    /// Ends the command the peer sent with a reply line.
    pub fn send_command_end(&mut self, code: i32, message: &str) -> Result<()> {
        self.send_line(&Line::Reply { code, text: message }.to_string())
    }

    /// Announces a streamed transfer and returns its data-connection id.
    pub fn start_binary_data(&mut self, data_type: DataType, sizes: &[usize]) -> Result<i32> {
        self.ensure_open()?;
        let data_conn = self.take_data_conn();
        let header = DataHeader::new(data_conn, data_type.code(), sizes.to_vec());
        self.send_line(&Line::BinaryStart(header).to_string())?;
        self.write_channels.start(data_conn, data_type, sizes);
        Ok(data_conn)
    }

    /// Streams bytes of one channel, framed in `C` chunks.
    ///
    /// Fails without sending anything if the bytes overflow the channel.
    /// Returns `true` when the channel is complete.
    pub fn send_binary_data(&mut self, data_conn: i32, chan: usize, data: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.write_channels.check(data_conn, chan, data.len())?;
        for chunk in data.chunks(self.data_frame) {
            let header = Line::BinaryChunk {
                data_conn,
                chan,
                len: chunk.len(),
            }
            .to_string();
            self.outbuf.extend_from_slice(header.as_bytes());
            self.outbuf.push(b'\n');
            self.outbuf.extend_from_slice(chunk);
        }
        self.flush()?;
        let done = self.write_channels.advance(data_conn, chan, data.len())?;
        Ok(done.is_some())
    }

    /// Bytes still to send on a transfer; 0 when unknown.
    pub fn write_binary_data_size(&self, data_conn: i32) -> usize {
        self.write_channels.remaining(data_conn)
    }

    /// Bytes still to send on one channel; 0 when unknown.
    pub fn write_binary_data_size_channel(&self, data_conn: i32, chan: usize) -> usize {
        self.write_channels.remaining_channel(data_conn, chan)
    }

    /// Transfers we are receiving.
    pub const fn read_channels(&self) -> &DataChannels {
        &self.read_channels
    }

    /// Announces a shared memory transfer and returns its data-connection id.
    pub fn start_shared_data(
        &mut self,
        segment: &SharedSegment,
        data_type: DataType,
        sizes: &[usize],
    ) -> Result<i32> {
        self.ensure_open()?;
        if !segment.is_attached() {
            return Err(Error::SharedDetached(segment.key()));
        }
        if sizes.iter().sum::<usize>() > segment.len() {
            return Err(Error::SharedBounds {
                key: segment.key(),
                len: segment.len(),
            });
        }
        let data_conn = self.take_data_conn();
        let header = DataHeader::new(data_conn, data_type.code(), sizes.to_vec());
        self.send_line(
            &Line::SharedStart {
                key: segment.key(),
                header,
            }
            .to_string(),
        )?;
        self.shared_out.insert(data_conn, segment.key());
        Ok(data_conn)
    }

    /// Ends a shared memory transfer; the peer detaches on receipt.
    pub fn end_shared_data(&mut self, data_conn: i32) -> Result<()> {
        let key = self
            .shared_out
            .get(&data_conn)
            .copied()
            .ok_or(Error::UnknownTransfer(data_conn))?;
        self.send_line(&Line::SharedEnd { data_conn, key }.to_string())?;
        self.shared_out.remove(&data_conn);
        Ok(())
    }

    /// Segment the peer announced under `data_conn`.
    pub fn shared_segment(&self, data_conn: i32) -> Option<&SharedSegment> {
        self.shared_in.get(&data_conn)
    }

    /// Asks the peer to authorize us through the central node.
    pub fn authorize(&mut self, centrald_id: i32, centrald_num: i32, key: i32) -> Result<()> {
        self.centrald_id = Some(centrald_id);
        self.centrald_num = Some(centrald_num);
        self.key = Some(key);
        self.send_line(
            &Line::Auth(AuthLine::Request {
                centrald_id,
                centrald_num,
                key,
            })
            .to_string(),
        )?;
        self.auth_requested = true;
        self.set_conn_state(ConnState::AuthPending);
        Ok(())
    }

    /// Grants a pending authorization request of the peer.
    pub fn auth_ok(&mut self) -> Result<()> {
        let centrald_id = self.centrald_id.unwrap_or_default();
        self.send_line(&Line::Auth(AuthLine::Ok { centrald_id }).to_string())?;
        self.set_conn_state(ConnState::AuthOk);
        self.set_conn_state(ConnState::Connected);
        Ok(())
    }

    /// Refuses a pending authorization request of the peer.
    pub fn auth_failed(&mut self) -> Result<()> {
        let centrald_id = self.centrald_id.unwrap_or_default();
        let sent = self.send_line(&Line::Auth(AuthLine::Failed { centrald_id }).to_string());
        self.set_conn_state(ConnState::AuthFailed);
        sent
    }

    /// Descriptor to wait on, while the socket is open.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.socket.as_ref().map(|s| s.as_fd())
    }

    /// `true` when the block should wait for writability.
    pub fn wants_write(&self) -> bool {
        self.socket.is_some()
            && (self.conn_state == ConnState::InProgress
                || (!self.outbuf.is_empty() && !self.conn_state.is_finished()))
    }

    /// Reads what the socket has and processes complete lines and chunks.
    pub fn receive(&mut self) {
        if self.conn_state.is_finished() {
            return;
        }
        let mut chunk = [0u8; 16 * 1024];
        let mut closed = None;
        for _ in 0..MAX_READS {
            let Some(socket) = self.socket.as_mut() else {
                return;
            };
            match socket.read(&mut chunk) {
                Ok(0) => {
                    closed = Some("connection closed by peer".to_owned());
                    break;
                }
                Ok(n) => {
                    self.recv.extend(&chunk[..n]);
                    self.recv_at = Instant::now();
                    self.keepalive_sent = None;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    closed = Some(format!("read failed: {e}"));
                    break;
                }
            }
        }
        self.process_buffer();
        if let Some(reason) = closed {
            self.connection_error(&reason);
        }
    }

    /// Completes a pending connect and flushes buffered output.
    pub fn writable(&mut self) {
        if self.conn_state == ConnState::InProgress {
            let Some(socket) = self.socket.as_ref() else {
                return;
            };
            match take_socket_error(&socket.as_fd()) {
                Ok(()) => {
                    tracing::info!(conn = %self.name, "connected");
                    self.set_conn_state(ConnState::Connected);
                }
                Err(e) => {
                    self.connection_error(&format!("connect failed: {e}"));
                    return;
                }
            }
        }
        if !self.outbuf.is_empty() {
            // A failed flush has already broken the connection.
            let _ = self.flush();
        }
    }

    /// Timeout bookkeeping: connect deadline, keepalive probe and its grace.
    pub fn idle(&mut self, now: Instant) {
        let Some(timeout) = self.timeout else {
            return;
        };
        match self.conn_state {
            ConnState::Connecting | ConnState::InProgress
                if now.saturating_duration_since(self.state_since) > timeout =>
            {
                self.connection_error("connect timed out");
            }
            state if state.is_linked() => {
                if let Some(probe) = self.keepalive_sent {
                    if now.saturating_duration_since(probe) > self.grace {
                        self.connection_error("keepalive timed out");
                    }
                } else if now.saturating_duration_since(self.sent_at) > timeout
                    && self.send_line("T ready").is_ok()
                {
                    self.keepalive_sent = Some(now);
                }
            }
            _ => {}
        }
    }

    /// Starts a non-blocking connect to `addr`.
    pub(crate) fn connect(&mut self, addr: SocketAddr) {
        self.set_conn_state(ConnState::Connecting);
        match connect_nonblocking(addr) {
            Ok(Connecting::Done(stream)) => {
                self.socket = Some(Box::new(stream));
                self.set_conn_state(ConnState::Connected);
            }
            Ok(Connecting::InProgress(stream)) => {
                self.socket = Some(Box::new(stream));
                self.set_conn_state(ConnState::InProgress);
            }
            Err(e) => self.connection_error(&format!("connect to {addr} failed: {e}")),
        }
    }

    /// Breaks the connection: fails every command with `E_CONNECTION`,
    /// drops mirrored values and transfers, and raises [`Event::Broken`].
    pub fn connection_error(&mut self, reason: &str) {
        if matches!(self.conn_state, ConnState::Broken | ConnState::Delete) {
            return;
        }
        tracing::warn!(conn = %self.name, id = %self.id, reason, "connection broken");
        self.set_conn_state(ConnState::Broken);
        self.fail_commands();
        self.values.clear();
        self.last_info_time = None;
        self.read_channels.clear();
        self.write_channels.clear();
        self.active_read = None;
        self.shared_out.clear();
        self.shared_in.clear();
        self.outbuf.clear();
        self.events.push(Event::Broken {
            reason: reason.to_owned(),
        });
    }

    /// Fails every queued and running command with `E_CONNECTION`.
    fn fail_commands(&mut self) {
        let outcome = Outcome::Failed(E_CONNECTION);
        for command in self.queue.drain() {
            command.notify(outcome);
            self.events.push(Event::CommandReturned {
                command: command.text().to_owned(),
                outcome,
            });
        }
    }

    /// Marks the connection deleted and closes the socket.
    pub(crate) fn release(&mut self) {
        self.set_conn_state(ConnState::Delete);
        self.socket = None;
    }

    /// Drains pending events.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Writes the next eligible command, if any.
    fn dispatch(&mut self) {
        if self.conn_state != ConnState::Connected || self.socket.is_none() {
            return;
        }
        if let Some(text) = self.queue.dispatch(self.full_bop_state()) {
            tracing::debug!(conn = %self.name, command = %text, "send command");
            // A failed send breaks the connection and fails the command.
            let _ = self.send_line(&text);
        }
    }

    /// Fails unless the socket can take output.
    fn ensure_open(&self) -> Result<()> {
        if self.socket.is_none() || self.conn_state.is_finished() {
            return Err(Error::NotConnected(self.name.clone()));
        }
        Ok(())
    }

    /// Hands out the next data-connection id.
    fn take_data_conn(&mut self) -> i32 {
        let id = self.next_data_conn;
        self.next_data_conn = self.next_data_conn.wrapping_add(1).max(1);
        id
    }

    /// Writes buffered output until the socket would block.
    fn flush(&mut self) -> Result<()> {
        let result = loop {
            if self.outbuf.is_empty() {
                break Ok(());
            }
            let Some(socket) = self.socket.as_mut() else {
                break Err(io::Error::from(io::ErrorKind::NotConnected));
            };
            match socket.write(&self.outbuf) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.outbuf.drain(..n);
                    self.sent_at = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        result.map_err(|e| {
            self.connection_error(&format!("write failed: {e}"));
            Error::Io(e)
        })
    }
}
