//! Packet reassembly and framing.
//!
//! The framer owns the connection's sequence counter: inbound packets must
//! carry the next expected number, outbound packets take the next one, and
//! every new command restarts the count at zero.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader, PacketKind};

/// One logical packet, continuation frames already joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number of the last frame that made up this packet
    pub sequence: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        PacketKind::classify(&self.payload)
    }
}

/// Result of asking the framer for the next packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Not enough bytes buffered yet
    Incomplete,
    Complete(Packet),
    /// The stream is out of sync; nothing after this can be trusted
    Error(String),
}

#[derive(Debug)]
pub struct PacketFramer {
    buffer: Vec<u8>,
    /// Next sequence number, in either direction
    sequence: u8,
    /// Payload of a packet split across maximum-size frames
    partial: Option<Vec<u8>>,
    failed: Option<String>,
    max_payload: usize,
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PACKET_SIZE)
    }

    /// Framer with a smaller frame limit; lets tests exercise continuation
    /// frames without 16MB payloads.
    pub(crate) fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buffer: Vec::new(),
            sequence: 0,
            partial: None,
            failed: None,
            max_payload,
        }
    }

    /// Append bytes received from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as packets.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Restart numbering for a new command.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Pull the next complete packet out of the buffer.
    pub fn next_frame(&mut self) -> Frame {
        if let Some(reason) = &self.failed {
            return Frame::Error(reason.clone());
        }
        loop {
            let Some(header) = self.buffer.first_chunk::<4>() else {
                return Frame::Incomplete;
            };
            let header = PacketHeader::from_bytes(*header);
            let len = header.payload_length as usize;
            if self.buffer.len() < PacketHeader::SIZE + len {
                return Frame::Incomplete;
            }
            if header.sequence_id != self.sequence {
                let reason = format!(
                    "Packet number out of sequence ({} != {})",
                    header.sequence_id, self.sequence
                );
                tracing::warn!(reason = %reason, "packet stream desynchronized");
                self.failed = Some(reason.clone());
                return Frame::Error(reason);
            }
            self.sequence = self.sequence.wrapping_add(1);

            let chunk: Vec<u8> = self.buffer.drain(..PacketHeader::SIZE + len).skip(4).collect();
            tracing::trace!(seq = header.sequence_id, len, "frame");
            if len == self.max_payload {
                self.partial.get_or_insert_with(Vec::new).extend_from_slice(&chunk);
                continue;
            }
            let payload = match self.partial.take() {
                Some(mut joined) => {
                    joined.extend_from_slice(&chunk);
                    joined
                }
                None => chunk,
            };
            return Frame::Complete(Packet {
                sequence: header.sequence_id,
                payload,
            });
        }
    }

    /// Frame an outbound payload, continuing the current sequence.
    ///
    /// Payloads of `max_payload` bytes or more are split; a payload that is
    /// an exact multiple of the limit ends with an empty frame.
    pub fn frame(&mut self, payload: &[u8]) -> Vec<u8> {
        let frames = payload.len() / self.max_payload + 1;
        let mut out = Vec::with_capacity(payload.len() + frames * PacketHeader::SIZE);
        let mut chunks = payload.chunks(self.max_payload);
        loop {
            let chunk = chunks.next().unwrap_or(&[]);
            let header = PacketHeader {
                payload_length: chunk.len() as u32,
                sequence_id: self.sequence,
            };
            self.sequence = self.sequence.wrapping_add(1);
            out.extend_from_slice(&header.to_bytes());
            out.extend_from_slice(chunk);
            if chunk.len() < self.max_payload {
                return out;
            }
        }
    }

    /// Frame a command: numbering restarts at zero.
    pub fn frame_command(&mut self, payload: &[u8]) -> Vec<u8> {
        self.reset_sequence();
        self.frame(payload)
    }
}
