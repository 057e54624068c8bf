//! Binary packet framing.
//!
//! # Wire format
//!
//! ```text
//! [1 byte : wire version]
//! [4 bytes BE: header_len]
//! [header_len bytes: JSON Message]
//! [remaining bytes: chunk data (file_chunk only)]
//! ```

use crate::ProtocolError;
use crate::constants::{MAX_HEADER_LEN, WIRE_VERSION};
use crate::messages::Message;

/// Length of the fixed prefix (version + header length).
const PREFIX_LEN: usize = 5;

/// A message plus its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub message: Message,
    /// Chunk bytes; empty for every message except `file_chunk`.
    pub data: Vec<u8>,
}

impl Packet {
    /// Creates a packet without payload.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            data: Vec::new(),
        }
    }

    /// Creates a packet carrying chunk bytes.
    pub fn with_data(message: Message, data: Vec<u8>) -> Self {
        Self { message, data }
    }

    /// Serializes the packet.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.check_payload()?;
        let header = serde_json::to_vec(&self.message)?;
        if header.len() > MAX_HEADER_LEN {
            return Err(ProtocolError::Malformed(format!(
                "header too long: {} bytes (max {MAX_HEADER_LEN})",
                header.len()
            )));
        }

        let mut buf = Vec::with_capacity(PREFIX_LEN + header.len() + self.data.len());
        buf.push(WIRE_VERSION);
        buf.extend_from_slice(&(header.len() as u32).to_be_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Parses a packet.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < PREFIX_LEN {
            return Err(ProtocolError::Malformed(format!(
                "packet too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != WIRE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(bytes[0]));
        }

        let header_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        if header_len > MAX_HEADER_LEN || header_len > bytes.len() - PREFIX_LEN {
            return Err(ProtocolError::Malformed(format!(
                "bad header length {header_len}"
            )));
        }

        let body = &bytes[PREFIX_LEN..];
        let message: Message = serde_json::from_slice(&body[..header_len])?;
        let packet = Packet {
            message,
            data: body[header_len..].to_vec(),
        };
        packet.check_payload()?;
        Ok(packet)
    }

    fn check_payload(&self) -> Result<(), ProtocolError> {
        match &self.message {
            Message::FileChunk(chunk) if chunk.len != self.data.len() as u64 => {
                Err(ProtocolError::Malformed(format!(
                    "chunk declares {} bytes, carries {}",
                    chunk.len,
                    self.data.len()
                )))
            }
            Message::FileChunk(_) => Ok(()),
            _ if !self.data.is_empty() => Err(ProtocolError::Malformed(format!(
                "{} must not carry data",
                self.message.name()
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DownloadComplete, FileChunk};
    use crate::types::TransferHandle;

    fn chunk_message(len: u64) -> Message {
        Message::FileChunk(FileChunk {
            request: TransferHandle(1),
            file_id: 0,
            sequence: 2,
            offset: 8,
            len,
        })
    }

    #[test]
    fn chunk_packet_carries_data() {
        let packet = Packet::with_data(chunk_message(4), b"DATA".to_vec());
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);

        let parsed = Packet::decode(&bytes).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn empty_payload_packet() {
        let packet = Packet::new(Message::DownloadComplete(DownloadComplete {
            request: TransferHandle(5),
            files: 0,
        }));
        let parsed = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert!(parsed.data.is_empty());
        assert_eq!(parsed.message.request(), TransferHandle(5));
    }

    #[test]
    fn chunk_length_mismatch_rejected() {
        let packet = Packet::with_data(chunk_message(10), b"short".to_vec());
        assert!(matches!(packet.encode(), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn data_on_control_message_rejected() {
        let packet = Packet::with_data(
            Message::DownloadComplete(DownloadComplete {
                request: TransferHandle(1),
                files: 1,
            }),
            vec![1, 2, 3],
        );
        assert!(packet.encode().is_err());
    }

    #[test]
    fn truncated_packet_rejected() {
        assert!(Packet::decode(&[WIRE_VERSION, 0, 0]).is_err());

        let bytes = Packet::new(chunk_message(0)).encode().unwrap();
        assert!(Packet::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn wrong_version_rejected() {
        let mut bytes = Packet::new(chunk_message(0)).encode().unwrap();
        bytes[0] = 9;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(ProtocolError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn oversized_header_length_rejected() {
        let mut bytes = vec![WIRE_VERSION];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(b"{}");
        assert!(matches!(
            Packet::decode(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
