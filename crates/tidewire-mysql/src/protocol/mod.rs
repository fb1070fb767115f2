//! MySQL client/server protocol: packet layout, constants and the
//! packets exchanged during the connection phase.
//!
//! Every packet has a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! The maximum payload of a single packet is 2^24 - 1 bytes. Longer
//! payloads continue in following packets; see [`framer`].

pub mod framer;
pub mod reader;
pub mod writer;

pub use framer::{Frame, Packet, PacketFramer};
pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size for a single MySQL packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flags exchanged in the greeting and handshake response.
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities this client asks for.
    ///
    /// Result sets are always terminated by EOF packets: the client never
    /// sets `CLIENT_DEPRECATE_EOF`.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// Command codes (COM_xxx) used by the text protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Close the session
    Quit = 0x01,
    /// Text protocol query
    Query = 0x03,
}

/// Server status flags carried by OK and EOF packets.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
}

/// Character set ids sent in the handshake and reported per column.
#[allow(dead_code)]
pub mod charset {
    use std::borrow::Cow;

    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    /// utf8mb4 with a collation every supported server version knows.
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_GENERAL_CI;

    /// How text in a character set maps to bytes on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Encoding {
        Utf8,
        /// One byte per character, U+0000 to U+00FF
        Latin1,
    }

    impl Encoding {
        /// Encoding of a collation id; `None` for sets this client cannot read.
        pub fn for_id(id: u16) -> Option<Self> {
            match id {
                // utf8mb3 and utf8mb4 collations, plus ascii (11, 65)
                11 | 33 | 45 | 46 | 65 | 76 | 83 | 192..=215 | 223..=247 | 255..=323 => {
                    Some(Self::Utf8)
                }
                5 | 8 | 15 | 31 | 47 | 48 | 49 | 94 => Some(Self::Latin1),
                _ => None,
            }
        }

        /// `None` if `data` is not valid in this encoding.
        pub fn decode(self, data: &[u8]) -> Option<Cow<'_, str>> {
            match self {
                Self::Utf8 => std::str::from_utf8(data).ok().map(Cow::Borrowed),
                Self::Latin1 => Some(Cow::Owned(data.iter().copied().map(char::from).collect())),
            }
        }

        pub fn can_encode(self, text: &str) -> bool {
            match self {
                Self::Utf8 => true,
                Self::Latin1 => text.chars().all(|c| u32::from(c) <= 0xFF),
            }
        }

        /// Characters the set cannot hold become `?`, as the server does.
        pub fn encode_lossy(self, text: &str) -> Cow<'_, [u8]> {
            match self {
                Self::Utf8 => Cow::Borrowed(text.as_bytes()),
                Self::Latin1 if text.is_ascii() => Cow::Borrowed(text.as_bytes()),
                Self::Latin1 => Cow::Owned(
                    text.chars()
                        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                        .collect(),
                ),
            }
        }
    }

    /// Collation id for a character set name as accepted in URLs.
    pub fn by_name(name: &str) -> Option<u8> {
        match name.to_ascii_lowercase().as_str() {
            "utf8mb4" => Some(UTF8MB4_GENERAL_CI),
            "utf8" | "utf8mb3" => Some(UTF8_GENERAL_CI),
            "latin1" => Some(LATIN1_SWEDISH_CI),
            _ => None,
        }
    }
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        let [a, b, c, _] = self.payload_length.to_le_bytes();
        [a, b, c, self.sequence_id]
    }
}

/// Classification of a server packet from its first byte and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// 0x00 with at least 7 bytes of payload
    Ok,
    /// 0xFF
    Error,
    /// 0xFE with fewer than 9 bytes of payload
    Eof,
    /// Anything else; meaning depends on the protocol state
    Data,
}

impl PacketKind {
    pub fn classify(payload: &[u8]) -> Self {
        match payload.first() {
            Some(0x00) if payload.len() >= 7 => PacketKind::Ok,
            Some(0xFF) => PacketKind::Error,
            Some(0xFE) if payload.len() < 9 => PacketKind::Eof,
            _ => PacketKind::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    /// Human readable info string (e.g. "Rows matched: 1  Changed: 1")
    pub info: String,
}

/// Parsed ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    /// SQLSTATE, empty when the server did not send one
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    /// ER_DUP_ENTRY
    pub fn is_duplicate_key(&self) -> bool {
        self.error_code == 1062
    }

    /// ER_ROW_IS_REFERENCED_2 / ER_NO_REFERENCED_ROW_2
    pub fn is_foreign_key_violation(&self) -> bool {
        self.error_code == 1451 || self.error_code == 1452
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

/// The server's initial handshake packet (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Scramble salt, both parts joined, without the trailing NUL
    pub auth_data: Vec<u8>,
    /// Default authentication plugin; empty for pre-plugin servers
    pub auth_plugin: String,
}

impl Greeting {
    pub fn autocommit(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn supports(&self, capability: u32) -> bool {
        self.capabilities & capability != 0
    }
}
