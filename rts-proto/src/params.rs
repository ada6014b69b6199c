//! Typed parameter cursor over one protocol line.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

/// Errors returned by [`Params`] accessors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ParamError {
    /// The line ended before the parameter.
    #[error("missing parameter")]
    Missing,
    /// The parameter does not parse as the requested type.
    #[error("invalid {expected} parameter: {token:?}")]
    Invalid {
        /// Requested type.
        expected: &'static str,
        /// Offending token.
        token: String,
    },
}

/// Whitespace-delimited parameter cursor.
///
/// Each accessor consumes one parameter on success. On failure the cursor
/// does not move, so a caller may retry with another type.
#[derive(Debug, Clone)]
pub struct Params<'a> {
    /// Whole line.
    line: &'a str,
    /// Byte offset of the next unread character.
    pos: usize,
}

impl<'a> Params<'a> {
    /// Creates a cursor at the start of `line`.
    pub const fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }

    /// Unread remainder of the line, leading whitespace removed.
    pub fn remaining(&self) -> &'a str {
        self.line[self.pos..].trim_start()
    }

    /// `true` when only whitespace is left.
    pub fn end(&self) -> bool {
        self.remaining().is_empty()
    }

    /// Fails with [`ParamError::Invalid`] unless the line is fully consumed.
    pub fn expect_end(&self) -> Result<(), ParamError> {
        let rest = self.remaining();
        if rest.is_empty() {
            Ok(())
        } else {
            Err(ParamError::Invalid {
                expected: "end of line",
                token: rest.to_owned(),
            })
        }
    }

    /// Next string; a token starting with `"` extends to the closing quote.
    pub fn next_string(&mut self) -> Result<Cow<'a, str>, ParamError> {
        let start = self.skip_ws();
        let rest = &self.line[start..];
        if rest.is_empty() {
            return Err(ParamError::Missing);
        }
        if let Some(quoted) = rest.strip_prefix('"') {
            let (text, used) = unquote(quoted).ok_or_else(|| ParamError::Invalid {
                expected: "quoted string",
                token: rest.to_owned(),
            })?;
            self.pos = start + 1 + used;
            return Ok(text);
        }
        let (token, end) = self.peek_token().ok_or(ParamError::Missing)?;
        self.pos = end;
        Ok(Cow::Borrowed(token))
    }

    /// Everything left on the line, leading whitespace removed.
    pub fn next_whole_string(&mut self) -> Result<&'a str, ParamError> {
        let rest = self.remaining();
        if rest.is_empty() {
            return Err(ParamError::Missing);
        }
        self.pos = self.line.len();
        Ok(rest.trim_end())
    }

    /// Next parameter as `i32`.
    pub fn next_integer(&mut self) -> Result<i32, ParamError> {
        self.parse_next("integer", |t| t.parse().ok())
    }

    /// Next parameter as `i64`.
    pub fn next_long(&mut self) -> Result<i64, ParamError> {
        self.parse_next("long", |t| t.parse().ok())
    }

    /// Next parameter as `usize`.
    pub fn next_size(&mut self) -> Result<usize, ParamError> {
        self.parse_next("size", |t| t.parse().ok())
    }

    /// Next parameter as `u32`, decimal or `0x` hexadecimal.
    pub fn next_unsigned(&mut self) -> Result<u32, ParamError> {
        self.parse_next("unsigned", |t| match t.strip_prefix("0x") {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => t.parse().ok(),
        })
    }

    /// Next parameter as `f64`; `nan` and `inf` are accepted.
    pub fn next_double(&mut self) -> Result<f64, ParamError> {
        self.parse_next("double", |t| t.parse().ok())
    }

    /// Next parameter as `f32`.
    pub fn next_float(&mut self) -> Result<f32, ParamError> {
        self.parse_next("float", |t| t.parse().ok())
    }

    /// Next parameter as a time in seconds since the epoch.
    ///
    /// A leading `+` means seconds from now.
    pub fn next_double_time(&mut self) -> Result<f64, ParamError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.next_double_time_at(now)
    }

    /// Like [`next_double_time`](Self::next_double_time) with an explicit
    /// current time.
    pub fn next_double_time_at(&mut self, now: f64) -> Result<f64, ParamError> {
        self.parse_next("time", |t| match t.strip_prefix('+') {
            Some(offset) => offset.parse::<f64>().ok().map(|o| now + o),
            None => t.parse().ok(),
        })
    }

    /// Next parameter as sexagesimal hours (`hh:mm:ss.s`), returned in
    /// degrees. A plain decimal number is taken as degrees.
    pub fn next_hms(&mut self) -> Result<f64, ParamError> {
        self.parse_next("hms", |t| {
            if t.contains(':') {
                sexagesimal(t).map(|h| h * 15.0)
            } else {
                t.parse().ok()
            }
        })
    }

    /// Next parameter as sexagesimal degrees (`[+-]dd:mm:ss.s`) or decimal
    /// degrees.
    pub fn next_dms(&mut self) -> Result<f64, ParamError> {
        self.parse_next("dms", |t| {
            if t.contains(':') {
                sexagesimal(t)
            } else {
                t.parse().ok()
            }
        })
    }

    /// Next two integer parameters as `(seconds, microseconds)`.
    pub fn next_timeval(&mut self) -> Result<(i64, i64), ParamError> {
        let saved = self.pos;
        let sec = self.next_long()?;
        match self.parse_next("microseconds", |t| {
            t.parse::<i64>().ok().filter(|u| (0..1_000_000).contains(u))
        }) {
            Ok(usec) => Ok((sec, usec)),
            Err(e) => {
                self.pos = saved;
                Err(e)
            }
        }
    }

    /// Offset of the first non-whitespace byte at or after the cursor.
    fn skip_ws(&self) -> usize {
        let rest = &self.line[self.pos..];
        self.pos + (rest.len() - rest.trim_start().len())
    }

    /// Next unquoted token and the offset just past it.
    fn peek_token(&self) -> Option<(&'a str, usize)> {
        let start = self.skip_ws();
        let rest = &self.line[start..];
        if rest.is_empty() {
            return None;
        }
        let len = rest.find(char::is_whitespace).unwrap_or(rest.len());
        Some((&rest[..len], start + len))
    }

    /// Parses the next token with `f`, advancing only on success.
    fn parse_next<T>(
        &mut self,
        expected: &'static str,
        f: impl FnOnce(&str) -> Option<T>,
    ) -> Result<T, ParamError> {
        let (token, end) = self.peek_token().ok_or(ParamError::Missing)?;
        let value = f(token).ok_or_else(|| ParamError::Invalid {
            expected,
            token: token.to_owned(),
        })?;
        self.pos = end;
        Ok(value)
    }
}

/// Decodes the body of a quoted string (opening quote already stripped).
///
/// Returns the text and the number of bytes used, closing quote included.
fn unquote(s: &str) -> Option<(Cow<'_, str>, usize)> {
    let mut owned: Option<String> = None;
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => {
                let text = owned.map_or(Cow::Borrowed(&s[..i]), Cow::Owned);
                return Some((text, i + 1));
            }
            '\\' => {
                let escaped = match chars.next()?.1 {
                    'n' => '\n',
                    'r' => '\r',
                    other => other,
                };
                owned.get_or_insert_with(|| s[..i].to_owned()).push(escaped);
            }
            other => {
                if let Some(buf) = owned.as_mut() {
                    buf.push(other);
                }
            }
        }
    }
    None
}

/// Parses `[+-]a[:b[:c]]` into `a + b/60 + c/3600` with the sign applied.
fn sexagesimal(token: &str) -> Option<f64> {
    let (negative, body) = match token.as_bytes().first()? {
        b'-' => (true, &token[1..]),
        b'+' => (false, &token[1..]),
        _ => (false, token),
    };
    let mut value = 0.0;
    let mut scale = 1.0;
    let mut parts = 0;
    for part in body.split(':') {
        parts += 1;
        if parts > 3 {
            return None;
        }
        let v: f64 = part.parse().ok()?;
        if !v.is_finite() || v < 0.0 || (parts > 1 && v >= 60.0) {
            return None;
        }
        value += v / scale;
        scale *= 60.0;
    }
    Some(if negative { -value } else { value })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn typed_extraction_and_end() {
        let mut p = Params::new("expose 12 3.5 0x10 done");
        assert_eq!(p.next_string().unwrap(), "expose");
        assert_eq!(p.next_integer().unwrap(), 12);
        assert_eq!(p.next_double().unwrap(), 3.5);
        assert_eq!(p.next_unsigned().unwrap(), 16);
        assert!(!p.end());
        assert_eq!(p.next_string().unwrap(), "done");
        assert!(p.end());
        assert_eq!(p.next_integer(), Err(ParamError::Missing));
    }

    #[test]
    fn failed_parse_does_not_advance() {
        let mut p = Params::new("abc 5");
        assert!(matches!(
            p.next_integer(),
            Err(ParamError::Invalid { expected: "integer", .. })
        ));
        assert_eq!(p.next_string().unwrap(), "abc");
        assert_eq!(p.next_integer().unwrap(), 5);
    }

    #[test]
    fn quoted_strings_with_escapes() {
        let mut p = Params::new(r#"E 4 "a \"b\" c" tail"#);
        assert_eq!(p.next_string().unwrap(), "E");
        assert_eq!(p.next_integer().unwrap(), 4);
        assert_eq!(p.next_string().unwrap(), r#"a "b" c"#);
        assert_eq!(p.next_whole_string().unwrap(), "tail");
        assert!(p.end());
    }

    #[test]
    fn quoted_line_breaks_are_decoded() {
        let mut p = Params::new(r#""one\ntwo\r" "\\n""#);
        assert_eq!(p.next_string().unwrap(), "one\ntwo\r");
        assert_eq!(p.next_string().unwrap(), "\\n");
        assert!(p.end());
    }

    #[test]
    fn unterminated_quote_is_invalid() {
        let mut p = Params::new(r#""never closed"#);
        assert!(matches!(p.next_string(), Err(ParamError::Invalid { .. })));
    }

    #[test]
    fn relative_and_absolute_time() {
        let mut p = Params::new("+30 1000.5");
        assert_eq!(p.next_double_time_at(100.0).unwrap(), 130.0);
        assert_eq!(p.next_double_time_at(100.0).unwrap(), 1000.5);
    }

    #[test]
    fn sexagesimal_angles() {
        let mut p = Params::new("12:30:00 -10:30 45.25 1:61");
        assert_eq!(p.next_hms().unwrap(), 187.5);
        assert_eq!(p.next_dms().unwrap(), -10.5);
        assert_eq!(p.next_dms().unwrap(), 45.25);
        assert!(p.next_dms().is_err());
    }

    #[test]
    fn timeval_is_atomic() {
        let mut p = Params::new("1700000000 2000000");
        assert!(p.next_timeval().is_err());
        assert_eq!(p.next_long().unwrap(), 1_700_000_000);
    }

    #[test]
    fn expect_end_reports_leftovers() {
        let p = Params::new("  extra ");
        assert!(matches!(p.expect_end(), Err(ParamError::Invalid { .. })));
    }
}
