//! Connection protocol engine for distributed observatory control.
//!
//! Devices (cameras, mounts, domes) and clients talk over persistent TCP
//! connections carrying a line-oriented text protocol with a binary data
//! sideband. `rts` implements one node of that network:
//!
//! - [`Connection`]: the per-link state machine, command queue with BOP
//!   gating, mirrored peer [`Values`], and binary / shared memory transfers.
//! - [`Block`]: the single-threaded `poll(2)` reactor owning every
//!   connection, answering `info` and `X`, and relaying authorization.
//! - [`Handler`] and the [`Device`] capability traits: where applications
//!   plug in.
//!
//! # Quick start: a device answering `expose`
//!
//! ```no_run
//! use rts::{ActionResult, Block, BlockConfig, Device, DeviceHandler, Exposable};
//!
//! struct Camera;
//!
//! impl Exposable for Camera {
//!     fn start_exposure(&mut self, _block: &mut Block, _time: f64) -> ActionResult {
//!         Ok(())
//!     }
//!
//!     fn stop_exposure(&mut self, _block: &mut Block) -> ActionResult {
//!         Ok(())
//!     }
//! }
//!
//! impl Device for Camera {
//!     fn exposable(&mut self) -> Option<&mut dyn Exposable> {
//!         Some(self)
//!     }
//! }
//!
//! let mut config = BlockConfig::named("C0");
//! config.listen = Some("0.0.0.0:1617".into());
//! let mut block = Block::new(config).expect("cannot listen");
//! let stop = std::sync::atomic::AtomicBool::new(false);
//! block
//!     .run(&mut DeviceHandler::new(Camera), &stop)
//!     .expect("reactor failed");
//! ```

mod block;
mod command;
mod config;
mod connection;
mod data;
mod device;
mod error;
mod event;
mod message;
mod shm;
mod value;

pub use block::{Block, CommandError, Handler};
pub use command::{Command, CommandQueue, CommandStatus, Originator, Outcome, ReplyMatch};
pub use config::{BlockConfig, ConnectionConfig, DeviceConfig};
pub use connection::{ConnId, ConnState, ConnType, Connection, Socket};
pub use data::{Channel, Completed, DataChannels, DataType};
pub use device::{ActionResult, Coolable, Device, DeviceHandler, Exposable, Movable};
pub use error::{Error, Result};
pub use event::{Event, StateObserver};
pub use message::{
    MESSAGE_CRITICAL, MESSAGE_DEBUG, MESSAGE_ERROR, MESSAGE_INFO, MESSAGE_MASK_ALL,
    MESSAGE_REPORTIT, MESSAGE_WARNING, Message,
};
pub use rts_proto::{
    DeviceState, E_COMMAND, E_CONNECTION, E_HW, E_NOT_AUTHORIZED, E_PARAMSNUM, E_PARAMSVAL,
    E_SYSTEM, E_TIMEOUT, INFO_TIME, OK, Params, ValueOp, status,
};
pub use shm::SharedSegment;
pub use value::{
    ArrayData, Stat, VALUE_ARRAY, VALUE_BASE_MASK, VALUE_BOOL, VALUE_DOUBLE, VALUE_FITS,
    VALUE_HIDDEN, VALUE_INTEGER, VALUE_RADEC, VALUE_SELECTION, VALUE_STAT, VALUE_STRING,
    VALUE_TIME, VALUE_TYPE_MASK, VALUE_WRITABLE, Value, ValueData, Values,
};
