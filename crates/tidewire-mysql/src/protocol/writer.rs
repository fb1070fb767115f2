//! Payload builders for client packets.
//!
//! These produce bare payloads; headers and sequence numbers are added by
//! [`PacketFramer::frame`](crate::protocol::PacketFramer::frame).

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::Command;
use crate::protocol::capabilities::{CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH};

#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(128)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer (1, 3, 4 or 9 bytes).
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x1_0000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

/// Fields of the HandshakeResponse41 packet.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
}

impl HandshakeResponse<'_> {
    /// Capability word, max packet size, charset, 23 zero bytes.
    ///
    /// This prefix alone is the SSLRequest packet.
    fn write_prefix(&self, writer: &mut PacketWriter) {
        writer.write_u32_le(self.capabilities);
        writer.write_u32_le(self.max_packet_size);
        writer.write_u8(self.charset);
        writer.write_zeros(23);
    }

    pub fn ssl_request(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(32);
        self.write_prefix(&mut writer);
        writer.into_bytes()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        self.write_prefix(&mut writer);
        writer.write_null_string(self.user);
        // scrambles are 20 (SHA1) or 32 (SHA256) bytes
        writer.write_u8(self.auth_response.len() as u8);
        writer.write_bytes(self.auth_response);
        if self.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or(""));
        }
        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }
        writer.into_bytes()
    }
}

/// Command byte followed by its argument.
pub fn command_payload(command: Command, argument: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(1 + argument.len());
    writer.write_u8(command as u8);
    writer.write_bytes(argument);
    writer.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketReader;
    use crate::protocol::capabilities::DEFAULT_CLIENT_FLAGS;

    #[test]
    fn test_lenenc_boundaries() {
        let cases: [(u64, &[u8]); 4] = [
            (250, &[250]),
            (251, &[0xFC, 251, 0]),
            (0x1_0000, &[0xFD, 0, 0, 1]),
            (0x100_0000, &[0xFE, 0, 0, 0, 1, 0, 0, 0, 0]),
        ];
        for (value, expected) in cases {
            let mut writer = PacketWriter::new();
            writer.write_lenenc_int(value);
            assert_eq!(writer.as_bytes(), expected, "value {value}");
            assert_eq!(PacketReader::new(expected).read_lenenc_int(), Some(value));
        }
    }

    #[test]
    fn test_handshake_response_layout() {
        let scramble = [7u8; 20];
        let response = HandshakeResponse {
            capabilities: DEFAULT_CLIENT_FLAGS | CLIENT_CONNECT_WITH_DB,
            max_packet_size: 1 << 24,
            charset: 45,
            user: "app",
            auth_response: &scramble,
            database: Some("shop"),
            auth_plugin: "mysql_native_password",
        };
        let payload = response.encode();

        let mut reader = PacketReader::new(&payload);
        assert_eq!(reader.read_u32_le(), Some(response.capabilities));
        assert_eq!(reader.read_u32_le(), Some(1 << 24));
        assert_eq!(reader.read_u8(), Some(45));
        assert_eq!(reader.read_bytes(23), Some(&[0u8; 23][..]));
        assert_eq!(reader.read_null_string(), "app");
        assert_eq!(reader.read_u8(), Some(20));
        assert_eq!(reader.read_bytes(20), Some(&scramble[..]));
        assert_eq!(reader.read_null_string(), "shop");
        assert_eq!(reader.read_null_string(), "mysql_native_password");
        assert!(reader.is_empty());

        assert_eq!(response.ssl_request(), payload[..32].to_vec());
    }

    #[test]
    fn test_empty_password_and_no_database() {
        let response = HandshakeResponse {
            capabilities: DEFAULT_CLIENT_FLAGS,
            max_packet_size: 1,
            charset: 45,
            user: "root",
            auth_response: &[],
            database: None,
            auth_plugin: "mysql_native_password",
        };
        let payload = response.encode();
        // prefix + "root\0" + zero-length scramble + plugin
        assert_eq!(&payload[32..38], b"root\0\0");
        assert_eq!(&payload[38..], b"mysql_native_password\0");
    }

    #[test]
    fn test_command_payload() {
        assert_eq!(
            command_payload(Command::Query, b"SELECT 1"),
            b"\x03SELECT 1".to_vec()
        );
        assert_eq!(command_payload(Command::Quit, b""), vec![0x01]);
    }
}
