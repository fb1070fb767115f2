//! Column metadata and text-protocol value decoding.
//!
//! Every column value in a text-protocol row arrives as a string. The
//! column definition that precedes the rows says how to read it: the wire
//! type picks a converter, the UNSIGNED flag widens integers, and the
//! character set picks the text decoding. The binary character set (63)
//! keeps string-typed columns as raw bytes.

use chrono::{NaiveDate, NaiveDateTime};
use tidewire_core::error::TypeError;
use tidewire_core::{Error, Value};

use crate::protocol::PacketReader;
use crate::protocol::charset::{self, Encoding};

/// MySQL field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    /// Internal to the server, never sent to clients in practice
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Map a wire type code; unknown codes are read as strings.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Double)
    }

    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, FieldType::Decimal | FieldType::NewDecimal)
    }

    /// Character types whose bytes depend on the column character set.
    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::VarString
                | FieldType::String
                | FieldType::Enum
                | FieldType::Set
                | FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    /// SQL type name, for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NUM: u16 = 32768;
}

/// One field descriptor (ColumnDefinition41) from a result set header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub catalog: String,
    pub schema: String,
    /// Table name or alias
    pub table: String,
    pub org_table: String,
    /// Column name or alias
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a column definition packet; `None` if it is truncated.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = PacketReader::new(payload);
        let catalog = reader.read_lenenc_string()?;
        let schema = reader.read_lenenc_string()?;
        let table = reader.read_lenenc_string()?;
        let org_table = reader.read_lenenc_string()?;
        let name = reader.read_lenenc_string()?;
        let org_name = reader.read_lenenc_string()?;
        // length of the fixed-size block that follows, always 0x0c
        reader.read_lenenc_int()?;
        Some(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset: reader.read_u16_le()?,
            column_length: reader.read_u32_le()?,
            column_type: FieldType::from_u8(reader.read_u8()?),
            flags: reader.read_u16_le()?,
            decimals: reader.read_u8()?,
        })
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// Whether the column holds bytes rather than text.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.charset == u16::from(charset::BINARY)
    }

    /// Name used in results: `table.column` when `table_prefix` is set and
    /// the column belongs to a table.
    pub fn display_name(&self, table_prefix: bool) -> String {
        if table_prefix && !self.table.is_empty() {
            format!("{}.{}", self.table, self.name)
        } else {
            self.name.clone()
        }
    }

    /// Decode one non-NULL text-protocol value of this column.
    pub fn decode(&self, data: &[u8]) -> Result<Value, Error> {
        decode_text_value(self, data)
    }
}

/// Decode a text-protocol column value according to its descriptor.
///
/// Conversion failures are `Error::Type` naming the column; temporal values
/// the calendar types cannot hold (zero dates) stay text.
pub fn decode_text_value(column: &ColumnDef, data: &[u8]) -> Result<Value, Error> {
    let field_type = column.column_type;
    match field_type {
        FieldType::Null => Ok(Value::Null),
        FieldType::Bit | FieldType::Geometry => Ok(Value::Bytes(data.to_vec())),
        t if t.is_string() && column.is_binary() => Ok(Value::Bytes(data.to_vec())),
        _ => {
            // numbers and temporals report the binary set but are ASCII
            let encoding = if column.is_binary() {
                Some(Encoding::Utf8)
            } else {
                Encoding::for_id(column.charset)
            };
            let encoding = encoding.ok_or_else(|| {
                type_error(
                    column,
                    "text in a supported character set",
                    format!("character set {}", column.charset),
                )
            })?;
            let text = encoding
                .decode(data)
                .ok_or_else(|| type_error(column, "UTF-8 text", lossy_preview(data)))?;
            decode_text(column, field_type, &text)
        }
    }
}

fn decode_text(column: &ColumnDef, field_type: FieldType, text: &str) -> Result<Value, Error> {
    match field_type {
        FieldType::LongLong if column.is_unsigned() => text
            .parse::<u64>()
            .map(Value::UInt)
            .map_err(|_| type_error(column, "BIGINT UNSIGNED", text)),
        t if t.is_integer() => text
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| type_error(column, t.name(), text)),
        t if t.is_float() => text
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|_| type_error(column, t.name(), text)),
        t if t.is_decimal() => {
            if is_decimal_literal(text) {
                Ok(Value::Decimal(text.to_string()))
            } else {
                Err(type_error(column, "DECIMAL", text))
            }
        }
        FieldType::Json => serde_json::from_str(text)
            .map(Value::Json)
            .map_err(|_| type_error(column, "JSON", text)),
        FieldType::Date | FieldType::NewDate => Ok(NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map_or_else(|_| Value::Text(text.to_string()), Value::Date)),
        FieldType::DateTime
        | FieldType::DateTime2
        | FieldType::Timestamp
        | FieldType::Timestamp2 => Ok(NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map_or_else(|_| Value::Text(text.to_string()), Value::DateTime)),
        FieldType::Time | FieldType::Time2 => parse_time(text)
            .map(Value::Time)
            .ok_or_else(|| type_error(column, "TIME", text)),
        _ => Ok(Value::Text(text.to_string())),
    }
}

/// `[-]H+:MM:SS[.ffffff]` to signed microseconds.
pub fn parse_time(text: &str) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (clock, fraction) = body.split_once('.').unwrap_or((body, ""));
    let mut parts = clock.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 {
        return None;
    }
    let micros = if fraction.is_empty() {
        0
    } else {
        if fraction.len() > 6 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        format!("{fraction:0<6}").parse::<i64>().ok()?
    };
    let total = ((hours * 60 + minutes) * 60 + seconds) * 1_000_000 + micros;
    Some(if negative { -total } else { total })
}

/// Render signed microseconds as a MySQL TIME literal body.
pub fn format_time(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    let seconds = abs / 1_000_000;
    let fraction = abs % 1_000_000;
    let body = format!(
        "{}{:02}:{:02}:{:02}",
        sign,
        seconds / 3600,
        seconds / 60 % 60,
        seconds % 60
    );
    if fraction == 0 {
        body
    } else {
        format!("{body}.{fraction:06}")
    }
}

/// Digits with an optional sign, decimal point and exponent.
pub(crate) fn is_decimal_literal(text: &str) -> bool {
    let body = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (mantissa, exponent) = match body.split_once(['e', 'E']) {
        Some((m, e)) => (m, Some(e)),
        None => (body, None),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let digits_ok = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    let mantissa_ok = !(int_part.is_empty() && frac_part.is_empty())
        && digits_ok(int_part)
        && digits_ok(frac_part);
    let exponent_ok = exponent.is_none_or(|e| {
        let e = e.strip_prefix(['-', '+']).unwrap_or(e);
        !e.is_empty() && digits_ok(e)
    });
    mantissa_ok && exponent_ok
}

fn type_error(column: &ColumnDef, expected: &'static str, actual: impl Into<String>) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.into(),
        column: Some(column.name.clone()),
    })
}

fn lossy_preview(data: &[u8]) -> String {
    let end = data.len().min(32);
    String::from_utf8_lossy(&data[..end]).into_owned()
}
