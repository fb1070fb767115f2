//! SQL literal rendering and parameter interpolation.
//!
//! The text protocol has no bind parameters, so values are rendered into
//! the statement as escaped literals. How strings are escaped depends on
//! the session's `NO_BACKSLASH_ESCAPES` mode, which the server reports in
//! every OK packet's status flags.
//!
//! Supported placeholders:
//! - `?` and `%s`, filled in order from [`Params::Positional`]
//! - `$1`, `$2`, ... by position from [`Params::Positional`]
//! - `%(name)s` from [`Params::Named`]
//!
//! `%%` renders a literal `%`. Placeholders inside quoted strings and
//! identifiers are left alone.

use std::collections::BTreeMap;
use std::fmt::Write;

use tidewire_core::error::TypeError;
use tidewire_core::{Error, Value};

use crate::types::{format_time, is_decimal_literal};

/// Statement parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    /// No substitution; the statement is sent as written
    #[default]
    None,
    Positional(Vec<Value>),
    Named(BTreeMap<String, Value>),
}

impl Params {
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Params::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Params::None)
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<BTreeMap<String, Value>> for Params {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Params::Named(map)
    }
}

/// Quote a string as a SQL literal.
///
/// With `no_backslash_escapes` the server treats backslash as an ordinary
/// character, so only the quote itself is doubled.
pub fn escape_string(s: &str, no_backslash_escapes: bool) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    if no_backslash_escapes {
        for ch in s.chars() {
            if ch == '\'' {
                out.push('\'');
            }
            out.push(ch);
        }
    } else {
        for ch in s.chars() {
            match ch {
                '\0' => out.push_str("\\0"),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\x1a' => out.push_str("\\Z"),
                '\'' => out.push_str("\\'"),
                '"' => out.push_str("\\\""),
                _ => out.push(ch),
            }
        }
    }
    out.push('\'');
    out
}

/// Hex literal, `X'...'`, safe under any escaping mode.
pub fn escape_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + 3);
    out.push_str("X'");
    for byte in data {
        let _ = write!(out, "{byte:02X}");
    }
    out.push('\'');
    out
}

/// Render a value as a SQL literal.
///
/// Lists render as `(a, b, ...)` for `IN` clauses. Non-finite floats,
/// malformed decimals and empty lists have no literal form and are
/// rejected.
pub fn escape_value(value: &Value, no_backslash_escapes: bool) -> Result<String, Error> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Double(f) => format_double(*f)?,
        Value::Decimal(s) => {
            if !is_decimal_literal(s) {
                return Err(literal_error("DECIMAL", s.clone()));
            }
            s.clone()
        }
        Value::Text(s) => escape_string(s, no_backslash_escapes),
        Value::Bytes(b) => escape_bytes(b),
        Value::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        Value::Time(t) => format!("'{}'", format_time(*t)),
        Value::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.f")),
        Value::Json(j) => escape_string(&j.to_string(), no_backslash_escapes),
        Value::List(items) => {
            if items.is_empty() {
                return Err(literal_error("non-empty list", "[]".to_string()));
            }
            let rendered = items
                .iter()
                .map(|v| escape_value(v, no_backslash_escapes))
                .collect::<Result<Vec<_>, _>>()?;
            format!("({})", rendered.join(","))
        }
    })
}

fn format_double(f: f64) -> Result<String, Error> {
    if !f.is_finite() {
        return Err(literal_error("finite number", f.to_string()));
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-5..1e16).contains(&abs) {
        Ok(format!("{f:e}"))
    } else {
        Ok(f.to_string())
    }
}

/// Substitute `params` into `sql`.
///
/// Every positional placeholder must have a value and every value must be
/// used, unless the statement only refers to values by `$N`.
pub fn interpolate(sql: &str, params: &Params, no_backslash_escapes: bool) -> Result<String, Error> {
    if params.is_none() {
        return Ok(sql.to_string());
    }

    let mut out = String::with_capacity(sql.len() + 16);
    let mut chars = sql.char_indices().peekable();
    let mut next_positional = 0usize;
    let mut indexed = false;

    while let Some((start, ch)) = chars.next() {
        match ch {
            '\'' | '"' | '`' => {
                out.push(ch);
                copy_quoted(&mut chars, &mut out, ch, no_backslash_escapes && ch != '`');
            }
            '?' => {
                out.push_str(&positional(params, &mut next_positional, no_backslash_escapes)?);
            }
            '%' => match chars.peek().map(|&(_, c)| c) {
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                Some('s') => {
                    chars.next();
                    out.push_str(&positional(params, &mut next_positional, no_backslash_escapes)?);
                }
                Some('(') => {
                    let rest = &sql[start + 2..];
                    let Some(close) = rest.find(")s") else {
                        out.push('%');
                        continue;
                    };
                    let name = &rest[..close];
                    out.push_str(&named(params, name, no_backslash_escapes)?);
                    // skip "(name)s"
                    for _ in 0..name.chars().count() + 3 {
                        chars.next();
                    }
                }
                _ => out.push('%'),
            },
            '$' => {
                let mut digits = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                if digits.is_empty() {
                    out.push('$');
                } else {
                    indexed = true;
                    out.push_str(&by_index(params, &digits, no_backslash_escapes)?);
                }
            }
            _ => out.push(ch),
        }
    }

    if let Params::Positional(values) = params {
        let unused = next_positional < values.len() && !(indexed && next_positional == 0);
        if unused {
            return Err(count_error(values.len(), next_positional));
        }
    }
    Ok(out)
}

/// Copy a quoted literal or identifier through unchanged, up to and
/// including its closing quote.
fn copy_quoted(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    out: &mut String,
    quote: char,
    literal_backslash: bool,
) {
    let backslash_escapes = quote != '`' && !literal_backslash;
    while let Some((_, c)) = chars.next() {
        out.push(c);
        if c == '\\' && backslash_escapes {
            if let Some((_, escaped)) = chars.next() {
                out.push(escaped);
            }
        } else if c == quote {
            // a doubled quote continues the literal
            if chars.peek().map(|&(_, n)| n) == Some(quote) {
                if let Some((_, n)) = chars.next() {
                    out.push(n);
                }
            } else {
                return;
            }
        }
    }
}

fn positional(params: &Params, next: &mut usize, no_backslash_escapes: bool) -> Result<String, Error> {
    let Params::Positional(values) = params else {
        return Err(literal_error("named placeholder", "positional placeholder".to_string()));
    };
    let value = values
        .get(*next)
        .ok_or_else(|| count_error(values.len(), *next + 1))?;
    *next += 1;
    escape_value(value, no_backslash_escapes)
}

fn by_index(params: &Params, digits: &str, no_backslash_escapes: bool) -> Result<String, Error> {
    let Params::Positional(values) = params else {
        return Err(literal_error("named placeholder", format!("${digits}")));
    };
    let value = digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| values.get(i))
        .ok_or_else(|| literal_error("parameter index in range", format!("${digits}")))?;
    escape_value(value, no_backslash_escapes)
}

fn named(params: &Params, name: &str, no_backslash_escapes: bool) -> Result<String, Error> {
    let Params::Named(map) = params else {
        return Err(literal_error("positional placeholder", format!("%({name})s")));
    };
    let value = map
        .get(name)
        .ok_or_else(|| literal_error("named parameter", name.to_string()))?;
    escape_value(value, no_backslash_escapes)
}

fn count_error(supplied: usize, wanted: usize) -> Error {
    Error::Type(TypeError {
        expected: "one parameter per placeholder",
        actual: format!("{supplied} parameters for {wanted} placeholders"),
        column: None,
    })
}

fn literal_error(expected: &'static str, actual: String) -> Error {
    Error::Type(TypeError {
        expected,
        actual,
        column: None,
    })
}
