//! Cursor over one packet payload.
//!
//! Every read returns `None` once the payload is exhausted; callers turn
//! that into a protocol error naming the field they were after.

#![allow(clippy::cast_possible_truncation)]

use crate::auth;
use crate::protocol::capabilities::{CLIENT_PLUGIN_AUTH, CLIENT_SECURE_CONNECTION};
use crate::protocol::{EofPacket, ErrPacket, Greeting, OkPacket};

/// Marker byte for a NULL column value in a text-protocol row.
pub const NULL_MARKER: u8 = 0xFB;

#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Take exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.read_bytes(N)?.try_into().ok()
    }

    pub fn skip(&mut self, n: usize) -> bool {
        self.read_bytes(n).is_some()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_array::<1>().map(|[b]| b)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        self.read_array::<3>()
            .map(|[a, b, c]| u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: the value itself
    /// - 0xFC / 0xFD / 0xFE: 2, 3 or 8 byte value follows
    /// - 0xFB (NULL) and 0xFF are not integers and yield `None`
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        match self.read_u8()? {
            first @ 0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            _ => None,
        }
    }

    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read one text-protocol column value.
    ///
    /// The outer `None` means the row is truncated; `Some(None)` is SQL NULL.
    pub fn read_column_value(&mut self) -> Option<Option<&'a [u8]>> {
        if self.peek()? == NULL_MARKER {
            self.pos += 1;
            return Some(None);
        }
        self.read_lenenc_bytes().map(Some)
    }

    /// Read up to the next NUL (or the end of the payload) and skip the NUL.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    pub fn read_null_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_null_bytes()).into_owned()
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// OK packet: 0x00, affected rows, last insert id, status, warnings, info.
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        if self.peek() == Some(0x00) {
            self.skip(1);
        }
        Some(OkPacket {
            affected_rows: self.read_lenenc_int()?,
            last_insert_id: self.read_lenenc_int()?,
            status_flags: self.read_u16_le()?,
            warnings: self.read_u16_le()?,
            info: self.read_rest_string(),
        })
    }

    /// ERR packet: 0xFF, code, optional `#` + 5-byte SQLSTATE, message.
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }
        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            String::from_utf8_lossy(self.read_bytes(5)?).into_owned()
        } else {
            String::new()
        };
        Some(ErrPacket {
            error_code,
            sql_state,
            error_message: self.read_rest_string(),
        })
    }

    /// EOF packet: 0xFE, warnings, status.
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }
        Some(EofPacket {
            warnings: self.read_u16_le()?,
            status_flags: self.read_u16_le()?,
        })
    }

    /// Protocol-10 greeting.
    ///
    /// Fields after the lower capability word are optional on very old
    /// servers and default to zero.
    pub fn parse_greeting(&mut self) -> Option<Greeting> {
        let protocol_version = self.read_u8()?;
        let server_version = self.read_null_string();
        let connection_id = self.read_u32_le()?;
        let mut auth_data = self.read_bytes(8)?.to_vec();
        self.skip(1);
        let caps_lower = self.read_u16_le()?;

        let charset = self.read_u8().unwrap_or(0);
        let status_flags = self.read_u16_le().unwrap_or(0);
        let caps_upper = self.read_u16_le().unwrap_or(0);
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);
        let auth_data_len = usize::from(self.read_u8().unwrap_or(0));
        self.skip(10);

        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            // part 2 is at least 13 bytes including its NUL terminator
            let len = auth_data_len.saturating_sub(8).max(13);
            let part = self
                .read_bytes(len)
                .unwrap_or_else(|| self.read_rest());
            let part = part.strip_suffix(&[0]).unwrap_or(part);
            auth_data.extend_from_slice(part);
        }

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            self.read_null_string()
        } else {
            auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
        };

        Some(Greeting {
            protocol_version,
            server_version,
            connection_id,
            capabilities,
            charset,
            status_flags,
            auth_data,
            auth_plugin,
        })
    }
}
