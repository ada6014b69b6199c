//! Inbound line dispatch.

use std::fmt::Display;

use rts_proto::{AuthLine, DataHeader, E_NOT_AUTHORIZED, Line, LineError};

use super::{ActiveRead, ConnState, Connection};
use crate::command::ReplyMatch;
use crate::data::DataType;
use crate::error::Error;
use crate::event::Event;
use crate::message::{MESSAGE_ERROR, Message};
use crate::shm::SharedSegment;
use crate::value::{VALUE_TYPE_MASK, Value};

impl Connection {
    /// Consumes buffered input: raw chunk bytes first, then whole lines.
    pub(super) fn process_buffer(&mut self) {
        loop {
            if self.conn_state.is_finished() {
                return;
            }
            if let Some(active) = self.active_read.as_mut() {
                let mut bytes = Vec::new();
                let n = self.recv.take_raw(active.remaining, &mut bytes);
                if n == 0 {
                    return;
                }
                active.remaining -= n;
                let (data_conn, chan, keep) = (active.data_conn, active.chan, active.keep);
                if active.remaining == 0 {
                    self.active_read = None;
                }
                if keep {
                    self.receive_chunk(data_conn, chan, &bytes);
                }
                continue;
            }
            match self.recv.next_line() {
                Ok(Some(line)) => self.handle_line(&line),
                Ok(None) => return,
                Err(e @ LineError::TooLong { .. }) => {
                    self.connection_error(&e.to_string());
                    return;
                }
                Err(e) => self.protocol_error("", &e),
            }
        }
    }

    /// Acts on one received line.
    fn handle_line(&mut self, text: &str) {
        tracing::trace!(conn = %self.name, line = text, "recv");
        let line = match Line::parse(text) {
            Ok(line) => line,
            Err(e) => {
                self.protocol_error(text, &e);
                return;
            }
        };
        let errors = self.protocol_errors;
        match line {
            Line::Reply { code, text: reply } => self.handle_reply(text, code, reply),
            Line::Status { state, message } => self.set_state(state, message.map(str::to_owned)),
            Line::BopState(bop) => {
                self.peer_bop = bop;
                self.events.push(Event::BopReported(bop));
                self.dispatch();
            }
            Line::Progress { start, end } => {
                self.progress = Some((start, end));
                self.events.push(Event::Progress { start, end });
            }
            Line::Message {
                sec,
                usec,
                originator,
                kind,
                text: body,
            } => {
                let message = Message::at(sec, usec, originator, kind, body);
                message.log();
                self.events.push(Event::Message(message));
            }
            Line::MetaInfo {
                flags,
                name,
                description,
            } => self.declare_value(text, flags, name, &description),
            Line::SelMetaInfo { name, option } => {
                let added = self
                    .values
                    .get_mut(name)
                    .and_then(|v| v.add_option(option.into_owned()));
                if let Err(e) = added {
                    self.protocol_error(text, &e);
                }
            }
            Line::Value { name, raw } => match self.values.get_mut(name).and_then(|v| v.decode(raw)) {
                Ok(()) => self.events.push(Event::ValueChanged(name.to_owned())),
                Err(e) => self.protocol_error(text, &e),
            },
            Line::SetValue { name, op, raw } => {
                if self.is_connected() {
                    self.events.push(Event::SetValue {
                        name: name.to_owned(),
                        op,
                        raw: raw.to_owned(),
                    });
                } else {
                    self.refuse();
                }
            }
            Line::BinaryStart(header) => self.start_read(text, header),
            Line::BinaryChunk {
                data_conn,
                chan,
                len,
            } => self.start_chunk(text, data_conn, chan, len),
            Line::SharedStart { key, header } => self.attach_shared(text, key, header),
            Line::SharedEnd { data_conn, key } => self.detach_shared(text, data_conn, key),
            Line::Auth(auth) => self.handle_auth(auth),
            Line::Technical("ready") => {
                // A failed send has already broken the connection.
                let _ = self.send_line("T OK");
            }
            Line::Technical(_) => {}
            Line::Command(command) => {
                if self.is_connected() {
                    self.events.push(Event::Command(command.to_owned()));
                } else {
                    self.refuse();
                }
            }
            _ => self.protocol_error(text, &"unsupported line"),
        }
        if self.protocol_errors == errors {
            self.protocol_errors = 0;
        }
    }

    /// Matches a reply to the running command and notifies its originator.
    fn handle_reply(&mut self, text: &str, code: i32, reply: &str) {
        match self.queue.reply(code) {
            ReplyMatch::Running(outcome) => {
                if let Some((command, _)) = self.queue.running() {
                    command.notify(outcome);
                }
                if let Some(command) = self.queue.finish() {
                    if outcome.is_ok() {
                        tracing::debug!(conn = %self.name, command = command.text(), "command ok");
                    } else {
                        tracing::warn!(
                            conn = %self.name,
                            command = command.text(),
                            code,
                            reply,
                            "command failed"
                        );
                    }
                    self.events.push(Event::CommandReturned {
                        command: command.text().to_owned(),
                        outcome,
                    });
                }
                self.dispatch();
            }
            ReplyMatch::Orphan => {
                tracing::debug!(conn = %self.name, code, "reply to a cleared command");
                self.dispatch();
            }
            ReplyMatch::Unexpected => self.protocol_error(text, &"unexpected reply"),
        }
    }

    /// Declares a peer value; a redeclaration with the same type keeps it.
    fn declare_value(&mut self, text: &str, flags: u32, name: &str, description: &str) {
        if let Some(value) = self.values.find(name) {
            if value.type_flags() == flags & VALUE_TYPE_MASK {
                return;
            }
            self.values.remove(name);
        }
        match Value::declare(name, description, flags).and_then(|v| self.values.add(v)) {
            Ok(()) => self.events.push(Event::ValueDeclared(name.to_owned())),
            Err(e) => self.protocol_error(text, &e),
        }
    }

    /// Opens receive channels for a `D` header.
    fn start_read(&mut self, text: &str, header: DataHeader) {
        match DataType::from_code(header.data_type) {
            Ok(data_type) => {
                self.read_channels
                    .start(header.data_conn, data_type, &header.sizes);
                self.events.push(Event::DataStart {
                    data_conn: header.data_conn,
                    data_type,
                    sizes: header.sizes,
                });
            }
            Err(e) => self.protocol_error(text, &e),
        }
    }

    /// Prepares to receive the raw bytes of a `C` chunk.
    ///
    /// Bytes of a rejected chunk are still consumed so the stream stays
    /// aligned on line boundaries.
    fn start_chunk(&mut self, text: &str, data_conn: i32, chan: usize, len: usize) {
        let keep = match self.read_channels.check(data_conn, chan, len) {
            Ok(()) => true,
            Err(e) => {
                self.protocol_error(text, &e);
                false
            }
        };
        if len > 0 && !self.conn_state.is_finished() {
            self.active_read = Some(ActiveRead {
                data_conn,
                chan,
                remaining: len,
                keep,
            });
        }
    }

    /// Stores chunk bytes and reports completed channels.
    fn receive_chunk(&mut self, data_conn: i32, chan: usize, bytes: &[u8]) {
        match self.read_channels.receive(data_conn, chan, bytes) {
            Ok(Some(done)) => {
                tracing::debug!(conn = %self.name, data_conn, chan, len = done.data.len(), "channel complete");
                self.events.push(Event::DataComplete {
                    data_conn: done.data_conn,
                    chan: done.chan,
                    data_type: done.data_type,
                    data: done.data,
                });
            }
            Ok(None) => {}
            Err(e) => self.protocol_error("", &e),
        }
    }

    /// Maps a segment the peer announced with `H`.
    fn attach_shared(&mut self, text: &str, key: i32, header: DataHeader) {
        let data_type = match DataType::from_code(header.data_type) {
            Ok(data_type) => data_type,
            Err(e) => return self.protocol_error(text, &e),
        };
        let segment = match SharedSegment::attach(key) {
            Ok(segment) => segment,
            Err(e) => return self.protocol_error(text, &e),
        };
        if header.sizes.iter().sum::<usize>() > segment.len() {
            let e = Error::SharedBounds {
                key,
                len: segment.len(),
            };
            return self.protocol_error(text, &e);
        }
        self.shared_in.insert(header.data_conn, segment);
        self.events.push(Event::SharedStart {
            data_conn: header.data_conn,
            key,
            data_type,
            sizes: header.sizes,
        });
    }

    /// Detaches a segment on `Z`; a repeated or mismatched end is an error.
    fn detach_shared(&mut self, text: &str, data_conn: i32, key: i32) {
        let matches = self
            .shared_in
            .get(&data_conn)
            .is_some_and(|s| s.key() == key);
        let Some(mut segment) = self.shared_in.remove(&data_conn).filter(|_| matches) else {
            return self.protocol_error(text, &Error::UnknownTransfer(data_conn));
        };
        if let Err(e) = segment.detach() {
            tracing::warn!(conn = %self.name, key, error = %e, "detach failed");
        }
        self.events.push(Event::SharedEnd { data_conn, key });
    }

    /// Authorization handshake, on both the device and the client side.
    fn handle_auth(&mut self, auth: AuthLine) {
        match auth {
            AuthLine::Request {
                centrald_id,
                centrald_num,
                key,
            } => {
                self.centrald_id = Some(centrald_id);
                self.centrald_num = Some(centrald_num);
                self.key = Some(key);
                self.set_conn_state(ConnState::AuthPending);
                self.events.push(Event::AuthRequest {
                    centrald_id,
                    centrald_num,
                    key,
                });
            }
            AuthLine::Ok { centrald_id } if self.auth_requested => {
                self.auth_requested = false;
                tracing::info!(conn = %self.name, centrald_id, "authorized");
                self.set_conn_state(ConnState::AuthOk);
                self.set_conn_state(ConnState::Connected);
            }
            AuthLine::Failed { centrald_id } if self.auth_requested => {
                self.auth_requested = false;
                tracing::warn!(conn = %self.name, centrald_id, "authorization refused");
                self.set_conn_state(ConnState::AuthFailed);
            }
            AuthLine::Ok { centrald_id } => {
                self.events.push(Event::AuthReply {
                    centrald_id,
                    ok: true,
                });
            }
            AuthLine::Failed { centrald_id } => {
                self.events.push(Event::AuthReply {
                    centrald_id,
                    ok: false,
                });
            }
            _ => self.protocol_error("A", &"unsupported auth line"),
        }
    }

    /// Replies `E_NOT_AUTHORIZED` to a command received before authorization.
    fn refuse(&mut self) {
        // A failed send has already broken the connection.
        let _ = self.send_command_end(E_NOT_AUTHORIZED, "not authorized");
    }

    /// Reports a protocol violation to the peer and breaks the connection
    /// once too many arrive in a row.
    pub(super) fn protocol_error(&mut self, text: &str, error: &dyn Display) {
        self.protocol_errors += 1;
        tracing::warn!(conn = %self.name, line = text, %error, "protocol error");
        let report = Message::new(
            self.local_name.clone(),
            MESSAGE_ERROR,
            format!("protocol error: {error} in {text:?}"),
        );
        // A failed send has already broken the connection.
        let _ = self.send_message(&report);
        if self.protocol_errors > self.max_protocol_errors {
            self.connection_error("too many protocol errors");
        }
    }
}
