//! Binary data channels multiplexed over one connection.
//!
//! A transfer is opened with a data-connection id and a list of channel
//! sizes. Each channel counts transferred bytes and disappears the moment it
//! is complete; a channel not present counts as size zero.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Element type of a binary transfer, by FITS BITPIX code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DataType {
    /// Unsigned byte.
    U8,
    /// Signed byte.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl DataType {
    /// BITPIX code.
    pub const fn code(self) -> i32 {
        match self {
            Self::U8 => 8,
            Self::I8 => 10,
            Self::I16 => 16,
            Self::U16 => 20,
            Self::I32 => 32,
            Self::U32 => 40,
            Self::I64 => 64,
            Self::F32 => -32,
            Self::F64 => -64,
        }
    }

    /// Type for a BITPIX code.
    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            8 => Self::U8,
            10 => Self::I8,
            16 => Self::I16,
            20 => Self::U16,
            32 => Self::I32,
            40 => Self::U32,
            64 => Self::I64,
            -32 => Self::F32,
            -64 => Self::F64,
            other => return Err(Error::DataType(other)),
        })
    }

    /// Bytes per element.
    pub const fn element_size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

/// Transfer state of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Declared byte size.
    size: usize,
    /// Bytes transferred so far.
    transferred: usize,
    /// Received bytes; unused on the sending side.
    buf: Vec<u8>,
}

impl Channel {
    /// Declared byte size.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Bytes transferred so far.
    pub const fn transferred(&self) -> usize {
        self.transferred
    }

    /// Bytes still expected.
    pub const fn remaining(&self) -> usize {
        self.size - self.transferred
    }
}

/// One open transfer.
#[derive(Debug, Clone)]
struct Transfer {
    /// Element type.
    data_type: DataType,
    /// Incomplete channels by index.
    channels: BTreeMap<usize, Channel>,
}

/// Channels completed by a [`DataChannels::advance`] or
/// [`DataChannels::receive`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Completed {
    /// Data-connection id.
    pub data_conn: i32,
    /// Channel index.
    pub chan: usize,
    /// Element type.
    pub data_type: DataType,
    /// Channel content (empty on the sending side).
    pub data: Vec<u8>,
}

/// Open transfers of one direction, keyed by data-connection id.
#[derive(Debug, Clone, Default)]
pub struct DataChannels {
    /// Transfers with at least one incomplete channel.
    transfers: BTreeMap<i32, Transfer>,
}

impl DataChannels {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transfer. Zero-sized channels are complete from the start.
    ///
    /// Reopening an id replaces the previous transfer.
    pub fn start(&mut self, data_conn: i32, data_type: DataType, sizes: &[usize]) {
        let channels: BTreeMap<_, _> = sizes
            .iter()
            .enumerate()
            .filter(|(_, size)| **size > 0)
            .map(|(chan, &size)| {
                (
                    chan,
                    Channel {
                        size,
                        transferred: 0,
                        buf: Vec::new(),
                    },
                )
            })
            .collect();
        if channels.is_empty() {
            self.transfers.remove(&data_conn);
        } else {
            self.transfers.insert(
                data_conn,
                Transfer {
                    data_type,
                    channels,
                },
            );
        }
    }

    /// Checks that `len` more bytes fit into the channel.
    pub fn check(&self, data_conn: i32, chan: usize, len: usize) -> Result<()> {
        let channel = self
            .channel(data_conn, chan)
            .ok_or(Error::UnknownChannel { data_conn, chan })?;
        if len > channel.remaining() {
            return Err(Error::ChannelOverflow {
                data_conn,
                chan,
                len,
                remaining: channel.remaining(),
            });
        }
        Ok(())
    }

    /// Counts `len` sent bytes. On error nothing changes.
    pub fn advance(&mut self, data_conn: i32, chan: usize, len: usize) -> Result<Option<Completed>> {
        self.transfer_bytes(data_conn, chan, len, None)
    }

    /// Stores received bytes. On error nothing changes.
    pub fn receive(&mut self, data_conn: i32, chan: usize, bytes: &[u8]) -> Result<Option<Completed>> {
        self.transfer_bytes(data_conn, chan, bytes.len(), Some(bytes))
    }

    /// Open channel, if incomplete.
    pub fn channel(&self, data_conn: i32, chan: usize) -> Option<&Channel> {
        self.transfers.get(&data_conn)?.channels.get(&chan)
    }

    /// Element type of an open transfer.
    pub fn data_type(&self, data_conn: i32) -> Option<DataType> {
        self.transfers.get(&data_conn).map(|t| t.data_type)
    }

    /// Bytes still expected on every channel of a transfer; 0 when unknown.
    pub fn remaining(&self, data_conn: i32) -> usize {
        self.transfers
            .get(&data_conn)
            .map_or(0, |t| t.channels.values().map(Channel::remaining).sum())
    }

    /// Bytes still expected on one channel; 0 when unknown.
    pub fn remaining_channel(&self, data_conn: i32, chan: usize) -> usize {
        self.channel(data_conn, chan).map_or(0, Channel::remaining)
    }

    /// `true` while the transfer has an incomplete channel.
    pub fn is_open(&self, data_conn: i32) -> bool {
        self.transfers.contains_key(&data_conn)
    }

    /// `true` without open transfers.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Drops every transfer.
    pub fn clear(&mut self) {
        self.transfers.clear();
    }

    /// Shared body of [`advance`](Self::advance) and
    /// [`receive`](Self::receive).
    fn transfer_bytes(
        &mut self,
        data_conn: i32,
        chan: usize,
        len: usize,
        bytes: Option<&[u8]>,
    ) -> Result<Option<Completed>> {
        self.check(data_conn, chan, len)?;
        let Some(transfer) = self.transfers.get_mut(&data_conn) else {
            return Err(Error::UnknownChannel { data_conn, chan });
        };
        let data_type = transfer.data_type;
        let Some(channel) = transfer.channels.get_mut(&chan) else {
            return Err(Error::UnknownChannel { data_conn, chan });
        };
        channel.transferred += len;
        if let Some(bytes) = bytes {
            channel.buf.extend_from_slice(bytes);
        }
        if channel.remaining() > 0 {
            return Ok(None);
        }
        let data = transfer
            .channels
            .remove(&chan)
            .map(|c| c.buf)
            .unwrap_or_default();
        if transfer.channels.is_empty() {
            self.transfers.remove(&data_conn);
        }
        Ok(Some(Completed {
            data_conn,
            chan,
            data_type,
            data,
        }))
    }
}
