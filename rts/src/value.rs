//! Typed values mirrored between the two ends of a connection.
//!
//! Every value carries its declared type in the low flag bits. Content is a
//! [`ValueData`] sum type; accessors for another type fail with
//! [`Error::ValueType`] instead of coercing.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

use rts_proto::{INFO_TIME, Line, ParamError, Params, ValueOp, quote};

use crate::error::{Error, Result};

/// String value.
pub const VALUE_STRING: u32 = 0x01;
/// 32-bit integer value.
pub const VALUE_INTEGER: u32 = 0x02;
/// Time value, seconds since the epoch.
pub const VALUE_TIME: u32 = 0x03;
/// Double value.
pub const VALUE_DOUBLE: u32 = 0x04;
/// Boolean value.
pub const VALUE_BOOL: u32 = 0x06;
/// Selection among named options.
pub const VALUE_SELECTION: u32 = 0x07;
/// Right ascension / declination pair in degrees.
pub const VALUE_RADEC: u32 = 0x09;
/// Base type bits.
pub const VALUE_BASE_MASK: u32 = 0x0f;
/// Statistical aggregate over doubles.
pub const VALUE_STAT: u32 = 0x10;
/// Array of the base type.
pub const VALUE_ARRAY: u32 = 0x40;
/// Every type bit.
pub const VALUE_TYPE_MASK: u32 = 0xff;
/// Peers may change the value.
pub const VALUE_WRITABLE: u32 = 0x0200_0000;
/// Recorded into FITS headers by consumers.
pub const VALUE_FITS: u32 = 0x0010_0000;
/// Hidden from default listings.
pub const VALUE_HIDDEN: u32 = 0x0080_0000;

/// Current wall-clock time in seconds since the epoch.
pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Statistical summary of a sample set.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct Stat {
    /// Number of samples.
    pub num: usize,
    /// Mean.
    pub mean: f64,
    /// Minimum.
    pub min: f64,
    /// Maximum.
    pub max: f64,
    /// Population standard deviation.
    pub stdev: f64,
}

impl Stat {
    /// Creates a summary from its parts.
    pub const fn new(num: usize, mean: f64, min: f64, max: f64, stdev: f64) -> Self {
        Self {
            num,
            mean,
            min,
            max,
            stdev,
        }
    }

    /// Summarizes `samples`. An empty set yields zero samples and NaN moments.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::new(0, f64::NAN, f64::NAN, f64::NAN, f64::NAN);
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self::new(samples.len(), mean, min, max, var.sqrt())
    }
}

/// Items of an array value.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ArrayData {
    /// Strings.
    String(Vec<String>),
    /// Integers.
    Integer(Vec<i32>),
    /// Doubles.
    Double(Vec<f64>),
    /// Booleans.
    Bool(Vec<bool>),
    /// Times.
    Time(Vec<f64>),
}

impl ArrayData {
    /// Number of items.
    pub fn len(&self) -> usize {
        match self {
            Self::String(v) => v.len(),
            Self::Integer(v) => v.len(),
            Self::Double(v) | Self::Time(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    /// `true` without items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base type bits of the items.
    const fn base_flags(&self) -> u32 {
        match self {
            Self::String(_) => VALUE_STRING,
            Self::Integer(_) => VALUE_INTEGER,
            Self::Double(_) => VALUE_DOUBLE,
            Self::Bool(_) => VALUE_BOOL,
            Self::Time(_) => VALUE_TIME,
        }
    }

    /// Empty array of the same item type.
    fn empty_like(&self) -> Self {
        match self {
            Self::String(_) => Self::String(Vec::new()),
            Self::Integer(_) => Self::Integer(Vec::new()),
            Self::Double(_) => Self::Double(Vec::new()),
            Self::Bool(_) => Self::Bool(Vec::new()),
            Self::Time(_) => Self::Time(Vec::new()),
        }
    }

    /// Item `i` as a scalar.
    fn at(&self, i: usize) -> Option<ValueData> {
        match self {
            Self::String(v) => v.get(i).cloned().map(ValueData::String),
            Self::Integer(v) => v.get(i).copied().map(ValueData::Integer),
            Self::Double(v) => v.get(i).copied().map(ValueData::Double),
            Self::Bool(v) => v.get(i).copied().map(ValueData::Bool),
            Self::Time(v) => v.get(i).copied().map(ValueData::Time),
        }
    }

    /// Wire text: items separated by spaces.
    fn encode(&self) -> String {
        let items: Vec<String> = match self {
            Self::String(v) => v.iter().map(|s| quote(s)).collect(),
            Self::Integer(v) => v.iter().map(ToString::to_string).collect(),
            Self::Double(v) | Self::Time(v) => v.iter().map(ToString::to_string).collect(),
            Self::Bool(v) => v.iter().map(|b| encode_bool(*b).to_owned()).collect(),
        };
        items.join(" ")
    }

    /// Reads items until the end of the line.
    fn parse_items(&self, p: &mut Params<'_>) -> std::result::Result<Self, ParamError> {
        let mut out = self.empty_like();
        while !p.end() {
            match &mut out {
                Self::String(v) => v.push(p.next_string()?.into_owned()),
                Self::Integer(v) => v.push(p.next_integer()?),
                Self::Double(v) => v.push(p.next_double()?),
                Self::Bool(v) => v.push(parse_bool(p)?),
                Self::Time(v) => v.push(p.next_double_time()?),
            }
        }
        Ok(out)
    }
}

/// Content of a value.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ValueData {
    /// Text.
    String(String),
    /// 32-bit integer.
    Integer(i32),
    /// Double.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// Index into a list of option labels.
    Selection {
        /// Selected option.
        index: usize,
        /// Option labels.
        options: Vec<String>,
    },
    /// Seconds since the epoch; NaN when unset.
    Time(f64),
    /// Equatorial position in degrees.
    RaDec {
        /// Right ascension.
        ra: f64,
        /// Declination.
        dec: f64,
    },
    /// Array of a base type.
    Array(ArrayData),
    /// Statistical aggregate.
    Stat(Stat),
}

impl ValueData {
    /// Empty content for the type encoded in `flags`.
    pub fn empty(flags: u32) -> Result<Self> {
        let base = flags & VALUE_BASE_MASK;
        if flags & VALUE_STAT != 0 {
            return match base {
                0 | VALUE_DOUBLE => Ok(Self::Stat(Stat::from_samples(&[]))),
                _ => Err(Error::ValueFlags(flags)),
            };
        }
        if flags & VALUE_ARRAY != 0 {
            return match base {
                VALUE_STRING => Ok(Self::Array(ArrayData::String(Vec::new()))),
                VALUE_INTEGER => Ok(Self::Array(ArrayData::Integer(Vec::new()))),
                VALUE_DOUBLE => Ok(Self::Array(ArrayData::Double(Vec::new()))),
                VALUE_BOOL => Ok(Self::Array(ArrayData::Bool(Vec::new()))),
                VALUE_TIME => Ok(Self::Array(ArrayData::Time(Vec::new()))),
                _ => Err(Error::ValueFlags(flags)),
            };
        }
        match base {
            VALUE_STRING => Ok(Self::String(String::new())),
            VALUE_INTEGER => Ok(Self::Integer(0)),
            VALUE_TIME => Ok(Self::Time(f64::NAN)),
            VALUE_DOUBLE => Ok(Self::Double(f64::NAN)),
            VALUE_BOOL => Ok(Self::Bool(false)),
            VALUE_SELECTION => Ok(Self::Selection {
                index: 0,
                options: Vec::new(),
            }),
            VALUE_RADEC => Ok(Self::RaDec {
                ra: f64::NAN,
                dec: f64::NAN,
            }),
            _ => Err(Error::ValueFlags(flags)),
        }
    }

    /// Type bits announced in `E` lines.
    pub const fn type_flags(&self) -> u32 {
        match self {
            Self::String(_) => VALUE_STRING,
            Self::Integer(_) => VALUE_INTEGER,
            Self::Double(_) => VALUE_DOUBLE,
            Self::Bool(_) => VALUE_BOOL,
            Self::Selection { .. } => VALUE_SELECTION,
            Self::Time(_) => VALUE_TIME,
            Self::RaDec { .. } => VALUE_RADEC,
            Self::Array(a) => VALUE_ARRAY | a.base_flags(),
            Self::Stat(_) => VALUE_STAT | VALUE_DOUBLE,
        }
    }

    /// Human type name used in errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Double(_) => "double",
            Self::Bool(_) => "bool",
            Self::Selection { .. } => "selection",
            Self::Time(_) => "time",
            Self::RaDec { .. } => "ra/dec",
            Self::Array(_) => "array",
            Self::Stat(_) => "statistics",
        }
    }

    /// Wire text of the content.
    pub fn encode(&self) -> String {
        match self {
            Self::String(s) => quote(s),
            Self::Integer(i) => i.to_string(),
            Self::Double(d) | Self::Time(d) => d.to_string(),
            Self::Bool(b) => encode_bool(*b).to_owned(),
            Self::Selection { index, .. } => index.to_string(),
            Self::RaDec { ra, dec } => format!("{ra} {dec}"),
            Self::Array(a) => a.encode(),
            Self::Stat(s) => format!("{} {} {} {} {}", s.num, s.mean, s.min, s.max, s.stdev),
        }
    }
}

/// Wire form of a boolean.
const fn encode_bool(b: bool) -> &'static str {
    if b { "1" } else { "0" }
}

/// Reads a boolean: `1`/`0`, `true`/`false` or `on`/`off`.
fn parse_bool(p: &mut Params<'_>) -> std::result::Result<bool, ParamError> {
    let token = p.next_string()?;
    match token.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        _ => Err(ParamError::Invalid {
            expected: "bool",
            token: token.into_owned(),
        }),
    }
}

/// A named, typed, timestamped value.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    /// Unique name within its collection.
    name: String,
    /// Human description.
    description: String,
    /// Behaviour flags; type bits are derived from `data`.
    flags: u32,
    /// Current content.
    data: ValueData,
    /// Time of the last change, seconds since the epoch.
    changed: Option<f64>,
}

impl Value {
    /// Creates a read-only value.
    pub fn new(name: impl Into<String>, description: impl Into<String>, data: ValueData) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            flags: 0,
            data,
            changed: None,
        }
    }

    /// Creates an empty value from an `E` declaration.
    pub fn declare(
        name: impl Into<String>,
        description: impl Into<String>,
        flags: u32,
    ) -> Result<Self> {
        let data = ValueData::empty(flags)?;
        Ok(Self::new(name, description, data).with_flags(flags))
    }

    /// Adds behaviour flags. Type bits in `flags` are ignored.
    #[must_use]
    pub const fn with_flags(mut self, flags: u32) -> Self {
        self.flags |= flags & !VALUE_TYPE_MASK;
        self
    }

    /// Marks the value as writable by peers.
    #[must_use]
    pub const fn writable(self) -> Self {
        self.with_flags(VALUE_WRITABLE)
    }

    /// Value name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Full flag word: type bits and behaviour flags.
    pub const fn flags(&self) -> u32 {
        self.flags | self.data.type_flags()
    }

    /// Type bits only.
    pub const fn type_flags(&self) -> u32 {
        self.data.type_flags()
    }

    /// `true` when peers may change the value.
    pub const fn is_writable(&self) -> bool {
        self.flags & VALUE_WRITABLE != 0
    }

    /// Current content.
    pub const fn data(&self) -> &ValueData {
        &self.data
    }

    /// Time of the last change.
    pub const fn changed_at(&self) -> Option<f64> {
        self.changed
    }

    /// Replaces the content, which must keep the declared type.
    pub fn set(&mut self, data: ValueData) -> Result<()> {
        self.set_at(data, epoch_now())
    }

    /// Like [`set`](Self::set) with an explicit change time.
    pub fn set_at(&mut self, data: ValueData, when: f64) -> Result<()> {
        if data.type_flags() != self.data.type_flags() {
            return Err(self.type_error(data.type_name()));
        }
        if let ValueData::Selection { index, options } = &data {
            if !options.is_empty() && *index >= options.len() {
                return Err(Error::Selection {
                    name: self.name.clone(),
                    option: index.to_string(),
                });
            }
        }
        self.data = data;
        self.changed = Some(when);
        Ok(())
    }

    /// Parses `raw` and stores it.
    pub fn decode(&mut self, raw: &str) -> Result<()> {
        let data = self.parse(raw)?;
        self.set(data)
    }

    /// Parses `raw` as content of this value's type without storing it.
    pub fn parse(&self, raw: &str) -> Result<ValueData> {
        let mut p = Params::new(raw);
        let data = match &self.data {
            ValueData::String(_) if raw.trim_start().starts_with('"') => {
                ValueData::String(p.next_string()?.into_owned())
            }
            ValueData::String(_) => ValueData::String(p.next_whole_string()?.to_owned()),
            ValueData::Integer(_) => ValueData::Integer(p.next_integer()?),
            ValueData::Double(_) => ValueData::Double(p.next_double()?),
            ValueData::Bool(_) => ValueData::Bool(parse_bool(&mut p)?),
            ValueData::Selection { options, .. } => ValueData::Selection {
                index: self.parse_selection(&mut p, options)?,
                options: options.clone(),
            },
            ValueData::Time(_) => ValueData::Time(p.next_double_time()?),
            ValueData::RaDec { .. } => ValueData::RaDec {
                ra: p.next_hms()?,
                dec: p.next_dms()?,
            },
            ValueData::Array(items) => ValueData::Array(items.parse_items(&mut p)?),
            ValueData::Stat(_) => ValueData::Stat(Stat::new(
                p.next_size()?,
                p.next_double()?,
                p.next_double()?,
                p.next_double()?,
                p.next_double()?,
            )),
        };
        p.expect_end()?;
        Ok(data)
    }

    /// Computes the content a set-value request would produce.
    ///
    /// `+=` and `-=` work on integers, doubles, times and ra/dec pairs.
    pub fn apply(&self, op: ValueOp, raw: &str) -> Result<ValueData> {
        let sign = match op {
            ValueOp::Add => 1.0,
            ValueOp::Sub => -1.0,
            _ => return self.parse(raw),
        };
        let mut p = Params::new(raw);
        let data = match &self.data {
            ValueData::Integer(a) => {
                let b = p.next_integer()?;
                ValueData::Integer(if matches!(op, ValueOp::Add) {
                    a.saturating_add(b)
                } else {
                    a.saturating_sub(b)
                })
            }
            ValueData::Double(a) => ValueData::Double(a + sign * p.next_double()?),
            ValueData::Time(a) => ValueData::Time(a + sign * p.next_double()?),
            ValueData::RaDec { ra, dec } => ValueData::RaDec {
                ra: ra + sign * p.next_hms()?,
                dec: dec + sign * p.next_dms()?,
            },
            _ => return Err(self.type_error("numeric")),
        };
        p.expect_end()?;
        Ok(data)
    }

    /// Appends an option to a selection value.
    pub fn add_option(&mut self, option: impl Into<String>) -> Result<()> {
        match &mut self.data {
            ValueData::Selection { options, .. } => {
                options.push(option.into());
                Ok(())
            }
            _ => Err(self.type_error("selection")),
        }
    }

    /// Wire text of the content.
    pub fn encode(&self) -> String {
        self.data.encode()
    }

    /// `E` declaration line followed by one `F` line per selection option.
    pub fn meta_lines(&self) -> Vec<String> {
        let mut lines = vec![
            Line::MetaInfo {
                flags: self.flags(),
                name: &self.name,
                description: Cow::Borrowed(self.description.as_str()),
            }
            .to_string(),
        ];
        if let ValueData::Selection { options, .. } = &self.data {
            lines.extend(options.iter().map(|o| {
                Line::SelMetaInfo {
                    name: &self.name,
                    option: Cow::Borrowed(o.as_str()),
                }
                .to_string()
            }));
        }
        lines
    }

    /// `V` line carrying the current content.
    pub fn value_line(&self) -> String {
        Line::Value {
            name: &self.name,
            raw: &self.encode(),
        }
        .to_string()
    }

    /// Number of items: array length, one for scalars.
    pub fn value_size(&self) -> usize {
        match &self.data {
            ValueData::Array(a) => a.len(),
            _ => 1,
        }
    }

    /// Item `i` as a scalar; a scalar value only has item zero.
    pub fn value_at(&self, i: usize) -> Option<ValueData> {
        match &self.data {
            ValueData::Array(a) => a.at(i),
            other if i == 0 => Some(other.clone()),
            _ => None,
        }
    }

    /// Content as an integer.
    pub fn as_integer(&self) -> Result<i32> {
        match self.data {
            ValueData::Integer(i) => Ok(i),
            _ => Err(self.type_error("integer")),
        }
    }

    /// Content as a double.
    pub fn as_double(&self) -> Result<f64> {
        match self.data {
            ValueData::Double(d) => Ok(d),
            _ => Err(self.type_error("double")),
        }
    }

    /// Content as text.
    pub fn as_str(&self) -> Result<&str> {
        match &self.data {
            ValueData::String(s) => Ok(s),
            _ => Err(self.type_error("string")),
        }
    }

    /// Content as a boolean.
    pub fn as_bool(&self) -> Result<bool> {
        match self.data {
            ValueData::Bool(b) => Ok(b),
            _ => Err(self.type_error("bool")),
        }
    }

    /// Selected option index.
    pub fn as_selection(&self) -> Result<usize> {
        match self.data {
            ValueData::Selection { index, .. } => Ok(index),
            _ => Err(self.type_error("selection")),
        }
    }

    /// Selected option label.
    pub fn selection_label(&self) -> Result<&str> {
        match &self.data {
            ValueData::Selection { index, options } => {
                options.get(*index).map(String::as_str).ok_or_else(|| Error::Selection {
                    name: self.name.clone(),
                    option: index.to_string(),
                })
            }
            _ => Err(self.type_error("selection")),
        }
    }

    /// Content as a time.
    pub fn as_time(&self) -> Result<f64> {
        match self.data {
            ValueData::Time(t) => Ok(t),
            _ => Err(self.type_error("time")),
        }
    }

    /// Content as `(ra, dec)` degrees.
    pub fn as_radec(&self) -> Result<(f64, f64)> {
        match self.data {
            ValueData::RaDec { ra, dec } => Ok((ra, dec)),
            _ => Err(self.type_error("ra/dec")),
        }
    }

    /// Content as statistics.
    pub fn as_stat(&self) -> Result<&Stat> {
        match &self.data {
            ValueData::Stat(s) => Ok(s),
            _ => Err(self.type_error("statistics")),
        }
    }

    /// Content as an array.
    pub fn as_array(&self) -> Result<&ArrayData> {
        match &self.data {
            ValueData::Array(a) => Ok(a),
            _ => Err(self.type_error("array")),
        }
    }

    /// Builds the mismatch error for a request of type `expected`.
    fn type_error(&self, expected: &'static str) -> Error {
        Error::ValueType {
            name: self.name.clone(),
            expected,
            actual: self.data.type_name(),
        }
    }

    /// Reads an option index or label.
    fn parse_selection(&self, p: &mut Params<'_>, options: &[String]) -> Result<usize> {
        let token = p.next_string()?;
        let index = match token.parse::<usize>() {
            Ok(i) if options.is_empty() || i < options.len() => Some(i),
            Ok(_) => None,
            Err(_) => options.iter().position(|o| *o == token),
        };
        index.ok_or_else(|| Error::Selection {
            name: self.name.clone(),
            option: token.into_owned(),
        })
    }
}

/// Ordered collection of uniquely named values.
#[derive(Debug, Clone, Default)]
pub struct Values {
    /// Values in declaration order.
    items: Vec<Value>,
}

impl Values {
    /// Creates an empty collection.
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` without values.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Values in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    /// Registers a value; names are unique.
    pub fn add(&mut self, value: Value) -> Result<()> {
        if self.find(value.name()).is_some() {
            return Err(Error::DuplicateValue(value.name));
        }
        self.items.push(value);
        Ok(())
    }

    /// Looks a value up by name.
    pub fn find(&self, name: &str) -> Option<&Value> {
        self.items.iter().find(|v| v.name == name)
    }

    /// Looks a value up by name, failing with [`Error::UnknownValue`].
    pub fn get(&self, name: &str) -> Result<&Value> {
        self.find(name)
            .ok_or_else(|| Error::UnknownValue(name.to_owned()))
    }

    /// Mutable lookup by name.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Value> {
        self.items
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| Error::UnknownValue(name.to_owned()))
    }

    /// Removes a value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.items.iter().position(|v| v.name == name)?;
        Some(self.items.remove(pos))
    }

    /// Drops every value.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Type bits of a value.
    pub fn value_type(&self, name: &str) -> Result<u32> {
        self.get(name).map(Value::type_flags)
    }

    /// Integer content of a value.
    pub fn integer(&self, name: &str) -> Result<i32> {
        self.get(name)?.as_integer()
    }

    /// Double content of a value.
    pub fn double(&self, name: &str) -> Result<f64> {
        self.get(name)?.as_double()
    }

    /// Text content of a value.
    pub fn string(&self, name: &str) -> Result<&str> {
        self.get(name)?.as_str()
    }

    /// Selected index of a selection value.
    pub fn selection(&self, name: &str) -> Result<usize> {
        self.get(name)?.as_selection()
    }

    /// Time stamping the last info batch, if any arrived.
    pub fn info_time(&self) -> Option<f64> {
        self.find(INFO_TIME)
            .and_then(|v| v.as_time().ok())
            .filter(|t| !t.is_nan())
    }
}

impl<'a> IntoIterator for &'a Values {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn declare_from_flags() {
        let v = Value::declare("exposure", "exposure time", VALUE_DOUBLE | VALUE_WRITABLE).unwrap();
        assert_eq!(v.flags(), VALUE_DOUBLE | VALUE_WRITABLE);
        assert!(v.is_writable());
        assert!(v.as_double().unwrap().is_nan());

        let a = Value::declare("temps", "", VALUE_ARRAY | VALUE_DOUBLE).unwrap();
        assert_eq!(a.as_array().unwrap(), &ArrayData::Double(vec![]));
        assert!(matches!(
            Value::declare("bad", "", 0x0e),
            Err(Error::ValueFlags(0x0e))
        ));
    }

    #[test]
    fn wrong_type_is_an_error() {
        let v = Value::new("count", "", ValueData::Integer(3));
        assert_eq!(v.as_integer().unwrap(), 3);
        assert!(matches!(
            v.as_double(),
            Err(Error::ValueType {
                expected: "double",
                actual: "integer",
                ..
            })
        ));
        let mut w = v.clone();
        assert!(w.set(ValueData::Double(1.0)).is_err());
        assert_eq!(w, v);
    }

    #[test]
    fn decode_each_kind() {
        let mut s = Value::new("object", "", ValueData::String(String::new()));
        s.decode(r#""M 31 \"core\"""#).unwrap();
        assert_eq!(s.as_str().unwrap(), r#"M 31 "core""#);
        s.decode("plain words").unwrap();
        assert_eq!(s.as_str().unwrap(), "plain words");

        let mut b = Value::new("open", "", ValueData::Bool(false));
        b.decode("on").unwrap();
        assert!(b.as_bool().unwrap());
        assert!(b.decode("maybe").is_err());

        let mut pos = Value::new(
            "target",
            "",
            ValueData::RaDec {
                ra: 0.0,
                dec: 0.0,
            },
        );
        pos.decode("01:00:00 -20:30").unwrap();
        assert_eq!(pos.as_radec().unwrap(), (15.0, -20.5));

        let mut st = Value::new("fwhm", "", ValueData::Stat(Stat::from_samples(&[])));
        st.decode("3 2 1 3 0.5").unwrap();
        assert_eq!(st.as_stat().unwrap(), &Stat::new(3, 2.0, 1.0, 3.0, 0.5));

        let mut arr = Value::new("names", "", ValueData::Array(ArrayData::String(vec![])));
        arr.decode(r#""a b" c"#).unwrap();
        assert_eq!(
            arr.as_array().unwrap(),
            &ArrayData::String(vec!["a b".into(), "c".into()])
        );
        assert_eq!(arr.value_size(), 2);
        assert_eq!(arr.value_at(1), Some(ValueData::String("c".into())));
        assert!(arr.changed_at().is_some());
    }

    #[test]
    fn trailing_garbage_rejected() {
        let mut v = Value::new("count", "", ValueData::Integer(1));
        assert!(matches!(v.decode("5 6"), Err(Error::Param(_))));
        assert_eq!(v.as_integer().unwrap(), 1);
    }

    #[test]
    fn selection_by_index_or_label() {
        let mut f = Value::new(
            "filter",
            "",
            ValueData::Selection {
                index: 0,
                options: vec![],
            },
        );
        for o in ["U", "B", "V"] {
            f.add_option(o).unwrap();
        }
        f.decode("V").unwrap();
        assert_eq!(f.as_selection().unwrap(), 2);
        assert_eq!(f.selection_label().unwrap(), "V");
        f.decode("1").unwrap();
        assert_eq!(f.selection_label().unwrap(), "B");
        assert!(matches!(f.decode("7"), Err(Error::Selection { .. })));
        assert!(matches!(f.decode("R"), Err(Error::Selection { .. })));
    }

    #[test]
    fn apply_arithmetic() {
        let v = Value::new("focus", "", ValueData::Integer(100));
        assert_eq!(v.apply(ValueOp::Add, "5").unwrap(), ValueData::Integer(105));
        assert_eq!(v.apply(ValueOp::Sub, "5").unwrap(), ValueData::Integer(95));
        assert_eq!(v.apply(ValueOp::Set, "7").unwrap(), ValueData::Integer(7));

        let t = Value::new("until", "", ValueData::Time(1000.0));
        assert_eq!(t.apply(ValueOp::Add, "+30").unwrap(), ValueData::Time(1030.0));

        let s = Value::new("name", "", ValueData::String("x".into()));
        assert!(matches!(
            s.apply(ValueOp::Add, "1"),
            Err(Error::ValueType {
                expected: "numeric",
                ..
            })
        ));
    }

    #[test]
    fn meta_and_value_lines() {
        let mut f = Value::new(
            "filter",
            "filter \"wheel\"",
            ValueData::Selection {
                index: 1,
                options: vec!["R".into(), "I".into()],
            },
        )
        .writable();
        assert_eq!(
            f.meta_lines(),
            vec![
                format!("E {} filter \"filter \\\"wheel\\\"\"", VALUE_SELECTION | VALUE_WRITABLE),
                "F filter \"R\"".to_owned(),
                "F filter \"I\"".to_owned(),
            ]
        );
        assert_eq!(f.value_line(), "V filter 1");
        f.set(ValueData::Selection {
            index: 0,
            options: vec!["R".into(), "I".into()],
        })
        .unwrap();
        assert_eq!(f.value_line(), "V filter 0");
    }

    #[test]
    fn stat_from_samples() {
        let s = Stat::from_samples(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(s.num, 4);
        assert_eq!(s.mean, 2.5);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);
        assert!((s.stdev - 1.118_033_988_749_895).abs() < 1e-12);
    }

    #[test]
    fn collection_lookup() {
        let mut values = Values::new();
        values
            .add(Value::new("a", "", ValueData::Integer(1)))
            .unwrap();
        assert!(matches!(
            values.add(Value::new("a", "", ValueData::Integer(2))),
            Err(Error::DuplicateValue(_))
        ));
        assert_eq!(values.integer("a").unwrap(), 1);
        assert!(matches!(values.get("b"), Err(Error::UnknownValue(_))));
        assert_eq!(values.value_type("a").unwrap(), VALUE_INTEGER);
        assert_eq!(values.info_time(), None);
        values
            .add(Value::new(INFO_TIME, "", ValueData::Time(5.0)))
            .unwrap();
        assert_eq!(values.info_time(), Some(5.0));
    }
}
