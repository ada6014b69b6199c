//! Protocol line kinds, parsing and encoding.

use std::borrow::Cow;
use std::fmt;

use crate::params::{ParamError, Params};
use crate::status::DeviceState;

/// Command finished without error.
pub const OK: i32 = 0;
/// Unknown command.
pub const E_COMMAND: i32 = -1;
/// Wrong number of parameters.
pub const E_PARAMSNUM: i32 = -2;
/// Invalid parameter value.
pub const E_PARAMSVAL: i32 = -3;
/// Hardware failure.
pub const E_HW: i32 = -4;
/// System failure.
pub const E_SYSTEM: i32 = -5;
/// Peer is not authorized.
pub const E_NOT_AUTHORIZED: i32 = -6;
/// Command timed out.
pub const E_TIMEOUT: i32 = -7;
/// The connection dropped before a reply arrived. Local only, never sent.
pub const E_CONNECTION: i32 = -8;

/// Name of the value stamping each info batch.
pub const INFO_TIME: &str = "infotime";

/// Upper bound on channels announced by one data header.
const MAX_CHANNELS: usize = 1024;

/// Errors raised while parsing a protocol line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// Blank line.
    #[error("empty line")]
    Empty,
    /// Reserved single letter keyword this side does not know.
    #[error("unknown keyword {0:?}")]
    UnknownKeyword(String),
    /// A keyword line with bad parameters.
    #[error("malformed {keyword} line: {source}")]
    Malformed {
        /// Keyword of the offending line.
        keyword: String,
        /// Parameter failure.
        #[source]
        source: ParamError,
    },
    /// A data header announcing too many channels.
    #[error("data header announces {0} channels")]
    TooManyChannels(usize),
}

/// Operator of a set-value request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValueOp {
    /// `=`
    Set,
    /// `+=`
    Add,
    /// `-=`
    Sub,
}

impl ValueOp {
    /// Wire spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Set => "=",
            Self::Add => "+=",
            Self::Sub => "-=",
        }
    }

    /// Parses the wire spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "=" => Some(Self::Set),
            "+=" => Some(Self::Add),
            "-=" => Some(Self::Sub),
            _ => None,
        }
    }
}

/// Binary transfer announcement shared by `D` and `H` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DataHeader {
    /// Data-connection id.
    pub data_conn: i32,
    /// Element type (FITS BITPIX code).
    pub data_type: i32,
    /// Byte size of every channel.
    pub sizes: Vec<usize>,
}

impl DataHeader {
    /// Creates a header.
    pub const fn new(data_conn: i32, data_type: i32, sizes: Vec<usize>) -> Self {
        Self {
            data_conn,
            data_type,
            sizes,
        }
    }

    /// Parses `<type> <count> <size>...` after the data-connection id.
    fn parse_rest(data_conn: i32, p: &mut Params<'_>) -> Result<Self, ProtoError> {
        let data_type = p.next_integer().map_err(malformed("D"))?;
        let count = p.next_size().map_err(malformed("D"))?;
        if count > MAX_CHANNELS {
            return Err(ProtoError::TooManyChannels(count));
        }
        let sizes = (0..count)
            .map(|_| p.next_size())
            .collect::<Result<Vec<_>, _>>()
            .map_err(malformed("D"))?;
        Ok(Self::new(data_conn, data_type, sizes))
    }
}

impl fmt::Display for DataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.data_conn, self.data_type, self.sizes.len())?;
        for size in &self.sizes {
            write!(f, " {size}")?;
        }
        Ok(())
    }
}

/// Authorization handshake lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthLine {
    /// Client asks a device to authorize it through the central node.
    Request {
        /// Client id on the central node.
        centrald_id: i32,
        /// Central node number.
        centrald_num: i32,
        /// Key handed out by the central node.
        key: i32,
    },
    /// Central node accepted the client.
    Ok {
        /// Client id on the central node.
        centrald_id: i32,
    },
    /// Central node rejected the client.
    Failed {
        /// Client id on the central node.
        centrald_id: i32,
    },
}

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Line<'a> {
    /// `+ddd text` / `-ddd text`: end of the running command.
    Reply {
        /// Zero on success, negative error code otherwise.
        code: i32,
        /// Free text.
        text: &'a str,
    },
    /// `S <state> [message]`
    Status {
        /// New state word.
        state: DeviceState,
        /// Optional explanation.
        message: Option<&'a str>,
    },
    /// `B <bop>`: BOP bits the peer asks us to honor on top of its state.
    BopState(u32),
    /// `R <start> <end>`
    Progress {
        /// Start of the current operation (epoch seconds).
        start: f64,
        /// Expected end of the current operation (epoch seconds).
        end: f64,
    },
    /// `M <sec> <usec> <originator> <type> <text>`
    Message {
        /// Seconds of the timestamp.
        sec: i64,
        /// Microseconds of the timestamp.
        usec: i64,
        /// Originating component.
        originator: &'a str,
        /// Severity bitmask.
        kind: u32,
        /// Free text.
        text: &'a str,
    },
    /// `E <flags> <name> "<description>"`
    MetaInfo {
        /// Type and behaviour flags.
        flags: u32,
        /// Value name.
        name: &'a str,
        /// Human description.
        description: Cow<'a, str>,
    },
    /// `F <name> "<option>"`
    SelMetaInfo {
        /// Selection value name.
        name: &'a str,
        /// Option appended to the selection list.
        option: Cow<'a, str>,
    },
    /// `V <name> <value...>`
    Value {
        /// Value name.
        name: &'a str,
        /// Encoded content.
        raw: &'a str,
    },
    /// `X <name> <op> <value...>`
    SetValue {
        /// Value name.
        name: &'a str,
        /// Operator.
        op: ValueOp,
        /// Encoded operand.
        raw: &'a str,
    },
    /// `D <data_conn> <type> <count> <size>...`
    BinaryStart(DataHeader),
    /// `C <data_conn> <chan> <len>` followed by `len` raw bytes.
    BinaryChunk {
        /// Data-connection id.
        data_conn: i32,
        /// Channel index.
        chan: usize,
        /// Raw bytes following the line.
        len: usize,
    },
    /// `H <data_conn> <key> <type> <count> <size>...`
    SharedStart {
        /// Shared memory key.
        key: i32,
        /// Transfer description.
        header: DataHeader,
    },
    /// `Z <data_conn> <key>`
    SharedEnd {
        /// Data-connection id.
        data_conn: i32,
        /// Shared memory key.
        key: i32,
    },
    /// `A ...`
    Auth(AuthLine),
    /// `T <text>`: keepalive traffic.
    Technical(&'a str),
    /// Any other line: a command for this side.
    Command(&'a str),
}

/// Builds a `map_err` adapter tagging parameter errors with `keyword`.
fn malformed(keyword: &'static str) -> impl Fn(ParamError) -> ProtoError {
    move |source| ProtoError::Malformed {
        keyword: keyword.to_owned(),
        source,
    }
}

/// Requires non-empty remaining text.
fn rest<'a>(keyword: &'static str, p: &Params<'a>) -> Result<&'a str, ProtoError> {
    let rest = p.remaining().trim_end();
    if rest.is_empty() {
        Err(malformed(keyword)(ParamError::Missing))
    } else {
        Ok(rest)
    }
}

/// Next unquoted token as a borrowed name.
fn name<'a>(keyword: &'static str, p: &mut Params<'a>) -> Result<&'a str, ProtoError> {
    match p.next_string().map_err(malformed(keyword))? {
        Cow::Borrowed(s) => Ok(s),
        Cow::Owned(s) => Err(malformed(keyword)(ParamError::Invalid {
            expected: "name",
            token: s,
        })),
    }
}

impl<'a> Line<'a> {
    /// Parses one line (without its newline).
    pub fn parse(line: &'a str) -> Result<Self, ProtoError> {
        let line = line.trim();
        let bytes = line.as_bytes();
        let Some(&first) = bytes.first() else {
            return Err(ProtoError::Empty);
        };
        if matches!(first, b'+' | b'-') && bytes.get(1).is_some_and(u8::is_ascii_digit) {
            return Self::parse_reply(line);
        }
        let keyword = line.split(char::is_whitespace).next().unwrap_or(line);
        if keyword.len() != 1 || !first.is_ascii_uppercase() {
            return Ok(Self::Command(line));
        }
        let mut p = Params::new(line);
        p.next_string().map_err(malformed("keyword"))?;
        match first {
            b'S' => {
                let state = p.next_unsigned().map_err(malformed("S"))?;
                let message = Some(p.remaining().trim_end()).filter(|m| !m.is_empty());
                Ok(Self::Status {
                    state: DeviceState(state),
                    message,
                })
            }
            b'B' => Ok(Self::BopState(p.next_unsigned().map_err(malformed("B"))?)),
            b'R' => Ok(Self::Progress {
                start: p.next_double().map_err(malformed("R"))?,
                end: p.next_double().map_err(malformed("R"))?,
            }),
            b'M' => {
                let (sec, usec) = p.next_timeval().map_err(malformed("M"))?;
                let originator = name("M", &mut p)?;
                let kind = p.next_unsigned().map_err(malformed("M"))?;
                Ok(Self::Message {
                    sec,
                    usec,
                    originator,
                    kind,
                    text: p.remaining().trim_end(),
                })
            }
            b'E' => Ok(Self::MetaInfo {
                flags: p.next_unsigned().map_err(malformed("E"))?,
                name: name("E", &mut p)?,
                description: p.next_string().unwrap_or(Cow::Borrowed("")),
            }),
            b'F' => Ok(Self::SelMetaInfo {
                name: name("F", &mut p)?,
                option: p.next_string().map_err(malformed("F"))?,
            }),
            b'V' => Ok(Self::Value {
                name: name("V", &mut p)?,
                raw: p.remaining().trim_end(),
            }),
            b'X' => {
                let name = name("X", &mut p)?;
                let op_token = p.next_string().map_err(malformed("X"))?;
                let op = ValueOp::parse(&op_token).ok_or_else(|| {
                    malformed("X")(ParamError::Invalid {
                        expected: "operator",
                        token: op_token.into_owned(),
                    })
                })?;
                Ok(Self::SetValue {
                    name,
                    op,
                    raw: rest("X", &p)?,
                })
            }
            b'D' => {
                let data_conn = p.next_integer().map_err(malformed("D"))?;
                Ok(Self::BinaryStart(DataHeader::parse_rest(data_conn, &mut p)?))
            }
            b'C' => Ok(Self::BinaryChunk {
                data_conn: p.next_integer().map_err(malformed("C"))?,
                chan: p.next_size().map_err(malformed("C"))?,
                len: p.next_size().map_err(malformed("C"))?,
            }),
            b'H' => {
                let data_conn = p.next_integer().map_err(malformed("H"))?;
                let key = p.next_integer().map_err(malformed("H"))?;
                Ok(Self::SharedStart {
                    key,
                    header: DataHeader::parse_rest(data_conn, &mut p)?,
                })
            }
            b'Z' => Ok(Self::SharedEnd {
                data_conn: p.next_integer().map_err(malformed("Z"))?,
                key: p.next_integer().map_err(malformed("Z"))?,
            }),
            b'A' => Self::parse_auth(&mut p).map(Self::Auth),
            b'T' => Ok(Self::Technical(p.remaining().trim_end())),
            _ => Err(ProtoError::UnknownKeyword(keyword.to_owned())),
        }
    }

    /// Parses `+ddd text` / `-ddd text`.
    fn parse_reply(line: &'a str) -> Result<Self, ProtoError> {
        let mut p = Params::new(line);
        let code = p.next_integer().map_err(malformed("reply"))?;
        Ok(Self::Reply {
            code,
            text: p.remaining().trim_end(),
        })
    }

    /// Parses the body of an `A` line.
    fn parse_auth(p: &mut Params<'_>) -> Result<AuthLine, ProtoError> {
        let verb = p.next_string().map_err(malformed("A"))?;
        let id = p.next_integer().map_err(malformed("A"))?;
        match verb.as_ref() {
            "auth" => Ok(AuthLine::Request {
                centrald_id: id,
                centrald_num: p.next_integer().map_err(malformed("A"))?,
                key: p.next_integer().map_err(malformed("A"))?,
            }),
            "authorization_ok" => Ok(AuthLine::Ok { centrald_id: id }),
            "authorization_failed" => Ok(AuthLine::Failed { centrald_id: id }),
            other => Err(malformed("A")(ParamError::Invalid {
                expected: "auth verb",
                token: other.to_owned(),
            })),
        }
    }
}

/// Double-quotes `s`, escaping `"` and `\`, and writing line breaks as
/// `\n` and `\r` so the result stays on one line.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Free text with line breaks turned into spaces.
fn one_line(text: &str) -> Cow<'_, str> {
    if text.contains(['\n', '\r']) {
        Cow::Owned(text.replace(['\n', '\r'], " "))
    } else {
        Cow::Borrowed(text)
    }
}

impl fmt::Display for Line<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reply { code, text } if text.is_empty() => write!(f, "{code:+04}"),
            Self::Reply { code, text } => write!(f, "{code:+04} {}", one_line(text)),
            Self::Status {
                state,
                message: Some(m),
            } => write!(f, "S {} {}", state.bits(), one_line(m)),
            Self::Status {
                state,
                message: None,
            } => write!(f, "S {}", state.bits()),
            Self::BopState(bop) => write!(f, "B {bop}"),
            Self::Progress { start, end } => write!(f, "R {start} {end}"),
            Self::Message {
                sec,
                usec,
                originator,
                kind,
                text,
            } => write!(f, "M {sec} {usec} {originator} {kind} {}", one_line(text)),
            Self::MetaInfo {
                flags,
                name,
                description,
            } => write!(f, "E {flags} {name} {}", quote(description)),
            Self::SelMetaInfo { name, option } => write!(f, "F {name} {}", quote(option)),
            Self::Value { name, raw } if raw.is_empty() => write!(f, "V {name}"),
            Self::Value { name, raw } => write!(f, "V {name} {raw}"),
            Self::SetValue { name, op, raw } => write!(f, "X {name} {} {raw}", op.as_str()),
            Self::BinaryStart(header) => write!(f, "D {header}"),
            Self::BinaryChunk {
                data_conn,
                chan,
                len,
            } => write!(f, "C {data_conn} {chan} {len}"),
            Self::SharedStart { key, header } => {
                write!(
                    f,
                    "H {} {key} {} {}",
                    header.data_conn,
                    header.data_type,
                    header.sizes.len()
                )?;
                for size in &header.sizes {
                    write!(f, " {size}")?;
                }
                Ok(())
            }
            Self::SharedEnd { data_conn, key } => write!(f, "Z {data_conn} {key}"),
            Self::Auth(AuthLine::Request {
                centrald_id,
                centrald_num,
                key,
            }) => write!(f, "A auth {centrald_id} {centrald_num} {key}"),
            Self::Auth(AuthLine::Ok { centrald_id }) => {
                write!(f, "A authorization_ok {centrald_id}")
            }
            Self::Auth(AuthLine::Failed { centrald_id }) => {
                write!(f, "A authorization_failed {centrald_id}")
            }
            Self::Technical(text) => write!(f, "T {text}"),
            Self::Command(text) => f.write_str(text),
        }
    }
}
