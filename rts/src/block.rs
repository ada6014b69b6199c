//! Dispatcher owning every connection of one process.
//!
//! A [`Block`] is a single-threaded reactor: [`run_once`](Block::run_once)
//! waits with `poll(2)` on the listening socket and every connection, lets
//! ready connections read and write, then hands their [`Event`]s to a
//! [`Handler`]. The block also answers the commands every node supports
//! (`info`, `X` set-value, authorization) and keeps the blocked-by graph that
//! gates commands on other devices' BOP bits.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use rts_proto::{
    DeviceState, E_COMMAND, E_PARAMSNUM, E_PARAMSVAL, E_SYSTEM, INFO_TIME, OK, ParamError, Params,
    ValueOp,
};

use crate::command::{Command, Outcome};
use crate::config::{BlockConfig, lookup};
use crate::connection::{ConnId, ConnState, ConnType, Connection, Socket};
use crate::error::{Error, Result};
use crate::event::{Event, StateObserver};
use crate::message::Message;
use crate::value::{Value, ValueData, Values, epoch_now};

/// Failure reply to a peer command: a negative code and a text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({code})")]
pub struct CommandError {
    /// Reply code sent to the peer.
    code: i32,
    /// Reply text.
    message: String,
}

impl CommandError {
    /// Creates an error with an explicit reply code.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Unknown command verb.
    pub fn unknown(verb: &str) -> Self {
        Self::new(E_COMMAND, format!("unknown command {verb}"))
    }

    /// Reply code.
    pub const fn code(&self) -> i32 {
        self.code
    }

    /// Reply text.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ParamError> for CommandError {
    fn from(e: ParamError) -> Self {
        let code = match e {
            ParamError::Missing => E_PARAMSNUM,
            _ => E_PARAMSVAL,
        };
        Self::new(code, e.to_string())
    }
}

impl From<Error> for CommandError {
    fn from(e: Error) -> Self {
        match e {
            Error::Param(p) => p.into(),
            Error::ValueType { .. }
            | Error::UnknownValue(_)
            | Error::ReadOnly(_)
            | Error::Selection { .. } => Self::new(E_PARAMSVAL, e.to_string()),
            _ => Self::new(E_SYSTEM, e.to_string()),
        }
    }
}

/// Application hooks called by [`Block::run_once`].
///
/// Every method has a default so handlers implement only what they need.
pub trait Handler {
    /// Called for every event after the block's own processing.
    fn event(&mut self, block: &mut Block, conn: ConnId, event: &Event) {
        let _ = (block, conn, event);
    }

    /// Executes a peer command. `params` is positioned after the verb.
    ///
    /// `Ok` is answered with `+000`, an error with its code.
    fn command(
        &mut self,
        block: &mut Block,
        conn: ConnId,
        verb: &str,
        params: &mut Params<'_>,
    ) -> std::result::Result<(), CommandError> {
        let _ = (block, conn, params);
        Err(CommandError::unknown(verb))
    }

    /// Refreshes local values before an `info` reply is sent.
    fn info(&mut self, block: &mut Block) -> std::result::Result<(), CommandError> {
        let _ = block;
        Ok(())
    }

    /// Accepts or vetoes a peer's change of a writable local value.
    fn set_value(
        &mut self,
        block: &mut Block,
        name: &str,
        data: &ValueData,
    ) -> std::result::Result<(), CommandError> {
        let _ = (block, name, data);
        Ok(())
    }

    /// Decides an authorization request when no central node is connected.
    fn authorize(&mut self, block: &mut Block, conn: ConnId, centrald_id: i32, key: i32) -> bool {
        let _ = (block, conn, centrald_id, key);
        true
    }

    /// Called once per reactor step before the readiness wait.
    fn idle(&mut self, block: &mut Block) {
        let _ = block;
    }
}

/// Readiness of one polled descriptor: `None` is the listener.
type Ready = (Option<ConnId>, PollFlags);

/// Host name lookup running on a helper thread.
#[derive(Debug)]
struct Lookup {
    /// Address being resolved.
    address: String,
    /// Receives the result once.
    result: mpsc::Receiver<Option<SocketAddr>>,
}

impl Lookup {
    /// Starts resolving `address`.
    fn spawn(address: &str) -> Self {
        let (tx, rx) = mpsc::channel();
        let host = address.to_owned();
        let spawned = thread::Builder::new()
            .name("rts-lookup".into())
            .spawn(move || {
                let _ = tx.send(lookup(&host));
            });
        if let Err(e) = spawned {
            // The sender went down with the closure; the receiver reports it.
            tracing::warn!(address, error = %e, "cannot start lookup");
        }
        Self {
            address: address.to_owned(),
            result: rx,
        }
    }
}

/// The dispatcher.
#[derive(Debug)]
pub struct Block {
    /// Configuration, including the device address book.
    config: BlockConfig,
    /// Socket accepting client connections.
    listener: Option<TcpListener>,
    /// Every live connection.
    conns: BTreeMap<ConnId, Connection>,
    /// Next connection id.
    next_id: u32,
    /// Our own device state.
    state: DeviceState,
    /// Explanation of the last state change.
    state_message: Option<String>,
    /// Our own values, always including `infotime`.
    values: Values,
    /// Authorization requests relayed to the central node, by client id.
    pending_auth: BTreeMap<i32, ConnId>,
    /// Host name lookups of outbound connections.
    lookups: BTreeMap<ConnId, Lookup>,
    /// Told about state changes before they are stored.
    observer: Option<Rc<dyn StateObserver>>,
}

impl Block {
    /// Creates a block and binds its listener, if configured.
    pub fn new(config: BlockConfig) -> Result<Self> {
        let listener = match &config.listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr)?;
                listener.set_nonblocking(true)?;
                tracing::info!(block = %config.name, addr = %listener.local_addr()?, "listening");
                Some(listener)
            }
            None => None,
        };
        let mut values = Values::new();
        values.add(Value::new(
            INFO_TIME,
            "time of the last info",
            ValueData::Time(f64::NAN),
        ))?;
        Ok(Self {
            config,
            listener,
            conns: BTreeMap::new(),
            next_id: 1,
            state: DeviceState::default(),
            state_message: None,
            values,
            pending_auth: BTreeMap::new(),
            lookups: BTreeMap::new(),
            observer: None,
        })
    }

    /// Our own name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration in use.
    pub const fn config(&self) -> &BlockConfig {
        &self.config
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Adopts an established socket.
    ///
    /// Clients are greeted with our state and values at once, or after they
    /// authorize when the block requires it.
    pub fn add_connection(
        &mut self,
        name: impl Into<String>,
        socket: Box<dyn Socket>,
        conn_type: ConnType,
    ) -> Result<ConnId> {
        let id = self.take_id();
        let mut conn = Connection::new(id, name, socket, &self.config.connection)?;
        conn.set_local_name(self.config.name.as_str());
        conn.set_state_observer(self.observer.as_ref().map(Rc::clone));
        conn.set_conn_type(conn_type);
        let guarded = self.config.authorize && conn_type == ConnType::Client;
        if guarded {
            conn.set_conn_state(ConnState::AuthPending);
        }
        tracing::info!(block = %self.config.name, conn = conn.name(), %id, "connection added");
        self.conns.insert(id, conn);
        if conn_type == ConnType::Client && !guarded {
            self.greet(id);
        }
        Ok(id)
    }

    /// Opens (or returns) the outbound connection to a named device.
    ///
    /// The connection waits in `ResolvingDevice` until the address book
    /// knows the device.
    pub fn connect_device(&mut self, name: &str) -> ConnId {
        if let Some(id) = self.find(name) {
            return id;
        }
        let id = self.take_id();
        let mut conn = Connection::outbound(id, name, &self.config.connection);
        conn.set_local_name(self.config.name.as_str());
        conn.set_state_observer(self.observer.as_ref().map(Rc::clone));
        self.conns.insert(id, conn);
        id
    }

    /// Records the address of a named device.
    pub fn set_address(&mut self, name: &str, address: impl Into<String>) {
        self.config
            .devices
            .entry(name.to_owned())
            .or_default()
            .address = Some(address.into());
    }

    /// Sets the devices whose BOP bits gate commands to `name`.
    pub fn set_blocked_by<I, S>(&mut self, name: &str, blockers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .devices
            .entry(name.to_owned())
            .or_default()
            .blocked_by = blockers.into_iter().map(Into::into).collect();
        self.recompute_bop();
    }

    /// Connection by id.
    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    /// Mutable connection by id.
    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// Id of the connection named `name`.
    pub fn find(&self, name: &str) -> Option<ConnId> {
        self.conns
            .values()
            .find(|c| c.name() == name)
            .map(Connection::id)
    }

    /// Mutable connection by name.
    pub fn by_name(&mut self, name: &str) -> Result<&mut Connection> {
        self.conns
            .values_mut()
            .find(|c| c.name() == name)
            .ok_or_else(|| Error::UnknownConnection(name.to_owned()))
    }

    /// Every live connection.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    /// Our own device state.
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    /// Installs an observer told about our own and every peer's state
    /// changes before they are stored.
    pub fn set_state_observer(&mut self, observer: Rc<dyn StateObserver>) {
        for conn in self.conns.values_mut() {
            conn.set_state_observer(Some(Rc::clone(&observer)));
        }
        self.observer = Some(observer);
    }

    /// Changes our device state and broadcasts it to connected peers.
    ///
    /// The state observer runs first, while the old state is still stored.
    pub fn set_state(&mut self, state: DeviceState, message: Option<&str>) {
        if self.state == state {
            return;
        }
        tracing::info!(block = %self.config.name, old = %self.state, new = %state, "state changed");
        if let Some(observer) = &self.observer {
            observer.state_changed(None, self.state, state);
        }
        self.state = state;
        self.state_message = message.map(str::to_owned);
        for conn in self.conns.values_mut().filter(|c| c.is_connected()) {
            // A failed send breaks only that connection.
            let _ = conn.send_state(state, message);
        }
    }

    /// Our own values.
    pub const fn values(&self) -> &Values {
        &self.values
    }

    /// Registers a local value and declares it to connected peers.
    ///
    /// A rejected value is not announced.
    pub fn add_value(&mut self, value: Value) -> Result<()> {
        let name = value.name().to_owned();
        self.values.add(value)?;
        let value = self.values.get(&name)?;
        for conn in self.conns.values_mut().filter(|c| c.is_connected()) {
            // A failed send breaks only that connection.
            let _ = conn.send_meta(value).and_then(|()| conn.send_value(value));
        }
        Ok(())
    }

    /// Stores new content in a local value and broadcasts it.
    pub fn set_value(&mut self, name: &str, data: ValueData) -> Result<()> {
        let value = self.values.get_mut(name)?;
        value.set(data)?;
        let line = value.value_line();
        self.broadcast(&line);
        Ok(())
    }

    /// Sends a log record to every connected peer.
    pub fn send_message(&mut self, kind: u32, text: &str) {
        let message = Message::new(self.config.name.as_str(), kind, text);
        message.log();
        self.broadcast(&message.to_line());
    }

    /// Sends the span of our current operation to every connected peer.
    pub fn send_progress(&mut self, start: f64, end: f64) {
        for conn in self.conns.values_mut().filter(|c| c.is_connected()) {
            let _ = conn.send_progress(start, end);
        }
    }

    /// Recomputes the BOP bits each connection inherits from its blockers.
    pub fn recompute_bop(&mut self) {
        let own: BTreeMap<&str, u32> = self
            .conns
            .values()
            .map(|c| (c.name(), c.bop_state()))
            .collect();
        let inherited: Vec<(ConnId, u32)> = self
            .conns
            .values()
            .map(|c| (c.id(), self.blocking_bits(c.name(), &own)))
            .collect();
        for (id, bits) in inherited {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.set_external_bop(bits);
            }
        }
    }

    /// ORs the BOP bits of every device blocking `name`, transitively.
    /// Each device is visited once, so cycles terminate.
    fn blocking_bits(&self, name: &str, own: &BTreeMap<&str, u32>) -> u32 {
        let mut visited = BTreeSet::from([name]);
        let mut stack: Vec<&str> = self.blockers(name).collect();
        let mut bits = 0;
        while let Some(blocker) = stack.pop() {
            if !visited.insert(blocker) {
                continue;
            }
            bits |= own.get(blocker).copied().unwrap_or(0);
            stack.extend(self.blockers(blocker));
        }
        bits
    }

    /// Direct blockers of `name`.
    fn blockers<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.config
            .devices
            .get(name)
            .into_iter()
            .flat_map(|d| d.blocked_by.iter().map(String::as_str))
    }

    /// Runs reactor steps until `stop` is raised.
    pub fn run(&mut self, handler: &mut impl Handler, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.run_once(handler, self.config.poll_interval())?;
        }
        Ok(())
    }

    /// One reactor step: timeouts, connects, reaping, one readiness wait of
    /// at most `timeout`, socket I/O and event delivery.
    pub fn run_once(&mut self, handler: &mut impl Handler, timeout: Duration) -> Result<()> {
        let now = Instant::now();
        for conn in self.conns.values_mut() {
            conn.idle(now);
        }
        self.resolve();
        self.drain_events(handler);
        self.reap(handler);
        handler.idle(self);

        for (id, revents) in self.wait(timeout)? {
            let Some(id) = id else {
                if revents.contains(PollFlags::POLLIN) {
                    self.accept();
                }
                continue;
            };
            let Some(conn) = self.conns.get_mut(&id) else {
                continue;
            };
            if revents.contains(PollFlags::POLLNVAL) {
                conn.connection_error("invalid descriptor");
            } else if conn.conn_state() == ConnState::InProgress {
                if !revents.is_empty() {
                    conn.writable();
                }
            } else {
                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                    conn.receive();
                }
                if revents.contains(PollFlags::POLLOUT) {
                    conn.writable();
                }
            }
        }

        self.drain_events(handler);
        self.reap(handler);
        Ok(())
    }

    /// Waits for readiness on the listener and every open connection.
    fn wait(&self, timeout: Duration) -> Result<Vec<Ready>> {
        let mut ids = Vec::with_capacity(self.conns.len() + 1);
        let mut fds = Vec::with_capacity(self.conns.len() + 1);
        if let Some(listener) = &self.listener {
            ids.push(None);
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        }
        for (id, conn) in &self.conns {
            let Some(fd) = conn.as_fd() else {
                continue;
            };
            let flags = if conn.conn_state() == ConnState::InProgress {
                PollFlags::POLLOUT
            } else if conn.wants_write() {
                PollFlags::POLLIN | PollFlags::POLLOUT
            } else {
                PollFlags::POLLIN
            };
            ids.push(Some(*id));
            fds.push(PollFd::new(fd, flags));
        }
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        Ok(ids
            .into_iter()
            .zip(fds.iter().map(|f| f.revents().unwrap_or(PollFlags::empty())))
            .filter(|(_, revents)| !revents.is_empty())
            .collect())
    }

    /// Accepts every pending client.
    fn accept(&mut self) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    if let Err(e) =
                        self.add_connection(peer.to_string(), Box::new(stream), ConnType::Client)
                    {
                        tracing::warn!(%peer, error = %e, "cannot adopt connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Moves outbound connections towards `Connecting` once their device
    /// address is known.
    ///
    /// Literal socket addresses connect at once. Host names are resolved on
    /// a helper thread; the connection stays in `ResolvingDevice` meanwhile.
    fn resolve(&mut self) {
        for conn in self.conns.values_mut() {
            if !matches!(
                conn.conn_state(),
                ConnState::Unknown | ConnState::ResolvingDevice
            ) {
                continue;
            }
            let id = conn.id();
            let Some((device, address)) = self
                .config
                .devices
                .get(conn.name())
                .and_then(|d| Some((d, d.address.as_deref()?)))
            else {
                conn.set_conn_state(ConnState::ResolvingDevice);
                continue;
            };
            if let Some(addr) = device.socket_addr() {
                self.lookups.remove(&id);
                conn.connect(addr);
                continue;
            }
            conn.set_conn_state(ConnState::ResolvingDevice);
            if self.lookups.get(&id).is_none_or(|l| l.address != address) {
                self.lookups.insert(id, Lookup::spawn(address));
            }
            let Some(lookup) = self.lookups.get(&id) else {
                continue;
            };
            match lookup.result.try_recv() {
                Ok(Some(addr)) => {
                    self.lookups.remove(&id);
                    conn.connect(addr);
                }
                Ok(None) | Err(TryRecvError::Disconnected) => {
                    self.lookups.remove(&id);
                    conn.connection_error(&Error::Address(address.to_owned()).to_string());
                }
                Err(TryRecvError::Empty) => {}
            }
        }
    }

    /// Removes broken and refused connections, delivering their last events
    /// followed by [`Event::Deleted`].
    fn reap(&mut self, handler: &mut impl Handler) {
        let dead: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| matches!(c.conn_state(), ConnState::Broken | ConnState::AuthFailed))
            .map(|(id, _)| *id)
            .collect();
        if dead.is_empty() {
            return;
        }
        for id in dead {
            let Some(mut conn) = self.conns.remove(&id) else {
                continue;
            };
            conn.release();
            self.lookups.remove(&id);
            self.pending_auth.retain(|_, c| *c != id);
            if self.is_central(conn.name()) {
                self.fail_relayed_auth();
            }
            tracing::info!(block = %self.config.name, conn = conn.name(), %id, "connection deleted");
            let mut events = conn.take_events();
            events.push(Event::Deleted);
            for event in &events {
                handler.event(self, id, event);
            }
        }
        self.recompute_bop();
    }

    /// Delivers queued events until every connection is quiet.
    fn drain_events(&mut self, handler: &mut impl Handler) {
        loop {
            let batch: Vec<(ConnId, Event)> = self
                .conns
                .iter_mut()
                .flat_map(|(id, c)| c.take_events().into_iter().map(move |e| (*id, e)))
                .collect();
            if batch.is_empty() {
                break;
            }
            for (id, event) in &batch {
                self.handle_event(handler, *id, event);
                handler.event(self, *id, event);
            }
            self.recompute_bop();
        }
    }

    /// Block-level reaction to one event.
    fn handle_event(&mut self, handler: &mut impl Handler, id: ConnId, event: &Event) {
        match event {
            Event::ConnState {
                new: ConnState::Connected,
                old,
            } => self.connected(id, *old),
            Event::Command(text) => self.run_command(handler, id, text),
            Event::SetValue { name, op, raw } => {
                let result = self.set_from_peer(handler, name, *op, raw);
                self.reply(id, result);
            }
            Event::AuthRequest {
                centrald_id, key, ..
            } => self.auth_request(handler, id, *centrald_id, *key),
            Event::AuthReply { centrald_id, ok } => {
                if let Some(client) = self.pending_auth.remove(centrald_id) {
                    self.finish_auth(client, *ok);
                }
            }
            Event::CommandReturned {
                command,
                outcome: Outcome::Failed(code),
            } if self
                .conns
                .get(&id)
                .is_some_and(|c| self.is_central(c.name())) =>
            {
                self.relay_failed(command, *code);
            }
            _ => {}
        }
    }

    /// Greets a connection that just reached `Connected`.
    fn connected(&mut self, id: ConnId, old: ConnState) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        match conn.conn_type() {
            ConnType::Device if matches!(old, ConnState::Connecting | ConnState::InProgress) => {
                conn.que_command(Command::info());
            }
            ConnType::Client => self.greet(id),
            _ => {}
        }
    }

    /// Sends our state and the declaration and content of every value.
    fn greet(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let sent = conn
            .send_state(self.state, self.state_message.as_deref())
            .and_then(|()| {
                self.values
                    .iter()
                    .try_for_each(|v| conn.send_meta(v).and_then(|()| conn.send_value(v)))
            });
        if let Err(e) = sent {
            tracing::debug!(conn = conn.name(), error = %e, "greeting failed");
        }
    }

    /// Executes a peer command and sends its reply.
    fn run_command(&mut self, handler: &mut impl Handler, id: ConnId, text: &str) {
        let mut params = Params::new(text);
        let result = match params.next_string() {
            Ok(verb) if verb == "info" => params
                .expect_end()
                .map_err(CommandError::from)
                .and_then(|()| self.info(handler, id)),
            Ok(verb) => {
                let verb = verb.into_owned();
                handler.command(self, id, &verb, &mut params)
            }
            Err(_) => Err(CommandError::unknown(text)),
        };
        self.reply(id, result);
    }

    /// Sends a command reply.
    fn reply(&mut self, id: ConnId, result: std::result::Result<(), CommandError>) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let sent = match &result {
            Ok(()) => conn.send_command_end(OK, "OK"),
            Err(e) => conn.send_command_end(e.code(), e.message()),
        };
        if let Err(e) = sent {
            tracing::debug!(conn = conn.name(), error = %e, "reply not sent");
        }
    }

    /// `info`: refresh, stamp `infotime`, send every value, `infotime` last.
    fn info(
        &mut self,
        handler: &mut impl Handler,
        id: ConnId,
    ) -> std::result::Result<(), CommandError> {
        handler.info(self)?;
        self.values
            .get_mut(INFO_TIME)?
            .set(ValueData::Time(epoch_now()))?;
        let conn = self
            .conns
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownConnection(id.to_string()))?;
        for value in self.values.iter().filter(|v| v.name() != INFO_TIME) {
            conn.send_value(value)?;
        }
        conn.send_value(self.values.get(INFO_TIME)?)?;
        Ok(())
    }

    /// `X`: change a writable local value on behalf of a peer.
    fn set_from_peer(
        &mut self,
        handler: &mut impl Handler,
        name: &str,
        op: ValueOp,
        raw: &str,
    ) -> std::result::Result<(), CommandError> {
        let value = self.values.get(name)?;
        if !value.is_writable() {
            return Err(Error::ReadOnly(name.to_owned()).into());
        }
        let data = value.apply(op, raw)?;
        handler.set_value(self, name, &data)?;
        self.set_value(name, data)?;
        Ok(())
    }

    /// Relays an authorization request to the central node, or lets the
    /// handler decide when no central node is connected.
    fn auth_request(&mut self, handler: &mut impl Handler, id: ConnId, centrald_id: i32, key: i32) {
        let central = self
            .conns
            .values_mut()
            .find(|c| {
                c.is_connected() && self.config.devices.get(c.name()).is_some_and(|d| d.central)
            });
        if let Some(central) = central {
            tracing::debug!(conn = %id, centrald_id, "relaying authorization");
            central.que_command(Command::new(format!("authorize {centrald_id} {key}")));
            self.pending_auth.insert(centrald_id, id);
            return;
        }
        let ok = handler.authorize(self, id, centrald_id, key);
        self.finish_auth(id, ok);
    }

    /// `true` when `name` is configured as the central node.
    fn is_central(&self, name: &str) -> bool {
        self.config.devices.get(name).is_some_and(|d| d.central)
    }

    /// Refuses the client whose relayed `authorize` command failed.
    fn relay_failed(&mut self, command: &str, code: i32) {
        let mut params = Params::new(command);
        if !matches!(params.next_string().as_deref(), Ok("authorize")) {
            return;
        }
        let Ok(centrald_id) = params.next_integer() else {
            return;
        };
        if let Some(client) = self.pending_auth.remove(&centrald_id) {
            tracing::warn!(conn = %client, centrald_id, code, "authorization relay failed");
            self.finish_auth(client, false);
        }
    }

    /// Refuses every client still waiting for the central node.
    fn fail_relayed_auth(&mut self) {
        for (centrald_id, client) in std::mem::take(&mut self.pending_auth) {
            tracing::warn!(conn = %client, centrald_id, "central node gone");
            self.finish_auth(client, false);
        }
    }

    /// Answers a pending authorization request.
    fn finish_auth(&mut self, id: ConnId, ok: bool) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let sent = if ok { conn.auth_ok() } else { conn.auth_failed() };
        if let Err(e) = sent {
            tracing::debug!(conn = conn.name(), error = %e, "authorization reply not sent");
        }
    }

    /// Writes a line to every connected peer.
    fn broadcast(&mut self, line: &str) {
        for conn in self.conns.values_mut().filter(|c| c.is_connected()) {
            // A failed send breaks only that connection.
            let _ = conn.send_line(line);
        }
    }

    /// Hands out the next connection id.
    const fn take_id(&mut self) -> ConnId {
        let id = ConnId::new(self.next_id);
        self.next_id += 1;
        id
    }
}
