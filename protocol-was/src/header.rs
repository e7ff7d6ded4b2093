//! WAS packet header encoding and decoding.

use crate::command::Command;
use crate::error::ParseError;

/// Packet header size in bytes.
pub const HEADER_LEN: usize = 4;

/// Maximum payload length of a single packet.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// A parsed packet header.
///
/// The command field is kept as the raw wire code: an unknown command is
/// not a framing error, because the length field still tells the receiver
/// how many payload bytes to skip. Use [`Command::from_u16`] to interpret
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw command code.
    pub command: u16,
    /// Payload length in bytes.
    pub length: u16,
}

impl PacketHeader {
    /// Create a header for a known command.
    pub fn new(command: Command, length: u16) -> Self {
        Self {
            command: command as u16,
            length,
        }
    }

    /// Parse a header from a byte buffer.
    ///
    /// Returns `ParseError::Incomplete` if fewer than [`HEADER_LEN`] bytes
    /// are available.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Incomplete);
        }

        Ok(Self {
            command: u16::from_le_bytes([data[0], data[1]]),
            length: u16::from_le_bytes([data[2], data[3]]),
        })
    }

    /// Encode the header into a byte buffer.
    ///
    /// Returns [`HEADER_LEN`].
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[..2].copy_from_slice(&self.command.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        HEADER_LEN
    }

    /// Interpret the raw command code.
    pub fn command(&self) -> Option<Command> {
        Command::from_u16(self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_parse() {
        let header = PacketHeader::new(Command::Uri, 11);

        let mut buf = [0u8; HEADER_LEN];
        assert_eq!(header.encode(&mut buf), HEADER_LEN);

        let parsed = PacketHeader::parse(&buf).unwrap();
        assert_eq!(header, parsed);
        assert_eq!(parsed.command(), Some(Command::Uri));
    }

    #[test]
    fn test_header_parse_incomplete() {
        assert!(matches!(
            PacketHeader::parse(&[1, 0]),
            Err(ParseError::Incomplete)
        ));
        assert!(matches!(
            PacketHeader::parse(&[]),
            Err(ParseError::Incomplete)
        ));
    }

    #[test]
    fn test_header_little_endian() {
        // URI = 3, length = 0x0102
        let data = [3, 0, 0x02, 0x01];
        let parsed = PacketHeader::parse(&data).unwrap();
        assert_eq!(parsed.command, 3);
        assert_eq!(parsed.length, 0x0102);
    }

    #[test]
    fn test_header_unknown_command() {
        let data = [0xFF, 0x00, 0, 0];
        let parsed = PacketHeader::parse(&data).unwrap();
        assert_eq!(parsed.command, 0xFF);
        assert_eq!(parsed.command(), None);
    }

    #[test]
    fn test_zero_length_payload() {
        let header = PacketHeader::new(Command::NoData, 0);
        let mut buf = [0u8; HEADER_LEN];
        header.encode(&mut buf);
        let parsed = PacketHeader::parse(&buf).unwrap();
        assert_eq!(parsed.length, 0);
        assert_eq!(parsed.command(), Some(Command::NoData));
    }
}
