//! Timestamped log records passed between processes.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rts_proto::Line;

/// Critical failure.
pub const MESSAGE_CRITICAL: u32 = 0x0010;
/// Error.
pub const MESSAGE_ERROR: u32 = 0x0001;
/// Warning.
pub const MESSAGE_WARNING: u32 = 0x0002;
/// Information.
pub const MESSAGE_INFO: u32 = 0x0004;
/// Debugging output.
pub const MESSAGE_DEBUG: u32 = 0x0008;
/// The record should reach the operator's report.
pub const MESSAGE_REPORTIT: u32 = 0x1000;
/// Every severity.
pub const MESSAGE_MASK_ALL: u32 = 0xffff;

/// Immutable log record: time, originator, severity and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Seconds since the epoch.
    sec: i64,
    /// Microseconds within the second.
    usec: i64,
    /// Component that produced the record.
    originator: String,
    /// Severity bitmask.
    kind: u32,
    /// Free text.
    text: String,
}

impl Message {
    /// Creates a record stamped with the current time.
    pub fn new(originator: impl Into<String>, kind: u32, text: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::at(
            i64::try_from(now.as_secs()).unwrap_or(i64::MAX),
            i64::from(now.subsec_micros()),
            originator,
            kind,
            text,
        )
    }

    /// Creates a record with an explicit timestamp.
    pub fn at(
        sec: i64,
        usec: i64,
        originator: impl Into<String>,
        kind: u32,
        text: impl Into<String>,
    ) -> Self {
        Self {
            sec,
            usec,
            originator: originator.into(),
            kind,
            text: text.into(),
        }
    }

    /// Seconds part of the timestamp.
    pub const fn sec(&self) -> i64 {
        self.sec
    }

    /// Microseconds part of the timestamp.
    pub const fn usec(&self) -> i64 {
        self.usec
    }

    /// Timestamp as fractional seconds.
    #[allow(clippy::cast_precision_loss)]
    pub fn time(&self) -> f64 {
        self.sec as f64 + self.usec as f64 / 1e6
    }

    /// Originating component.
    pub fn originator(&self) -> &str {
        &self.originator
    }

    /// Severity bitmask.
    pub const fn kind(&self) -> u32 {
        self.kind
    }

    /// Free text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// `true` when any bit of `mask` is set in the severity.
    pub const fn pass_mask(&self, mask: u32) -> bool {
        self.kind & mask != 0
    }

    /// `true` for records worth keeping beyond a debug log.
    pub const fn is_not_debug(&self) -> bool {
        self.kind & MESSAGE_DEBUG == 0
    }

    /// Severity label.
    pub const fn type_str(&self) -> &'static str {
        match self.kind & !MESSAGE_REPORTIT {
            MESSAGE_CRITICAL => "critical",
            MESSAGE_ERROR => "error",
            MESSAGE_WARNING => "warning",
            MESSAGE_INFO => "info",
            MESSAGE_DEBUG => "debug",
            _ => "unknown",
        }
    }

    /// `M` protocol line.
    pub fn to_line(&self) -> String {
        Line::Message {
            sec: self.sec,
            usec: self.usec,
            originator: &self.originator,
            kind: self.kind,
            text: &self.text,
        }
        .to_string()
    }

    /// Re-emits the record through `tracing` at the matching level.
    pub fn log(&self) {
        let (originator, text) = (self.originator.as_str(), self.text.as_str());
        if self.pass_mask(MESSAGE_CRITICAL | MESSAGE_ERROR) {
            tracing::error!(originator, time = self.time(), "{text}");
        } else if self.pass_mask(MESSAGE_WARNING) {
            tracing::warn!(originator, time = self.time(), "{text}");
        } else if self.pass_mask(MESSAGE_INFO) {
            tracing::info!(originator, time = self.time(), "{text}");
        } else {
            tracing::debug!(originator, time = self.time(), "{text}");
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06} {} {} {}",
            self.sec,
            self.usec,
            self.originator,
            self.type_str(),
            self.text
        )
    }
}
