//! Sans-IO implementation of the Web Application Socket (WAS) wire protocol.
//!
//! WAS is a local protocol between a web server and a worker process. The
//! two sides share three file descriptors: a bidirectional *control*
//! channel carrying framed command packets, and two unidirectional pipes
//! carrying raw request and response body bytes. This crate covers only
//! the control-channel encoding; it performs no I/O.
//!
//! # Framing
//!
//! Every control packet starts with a fixed 4-byte header, little-endian
//! (the protocol never crosses a machine boundary):
//!
//! ```text
//! +---------------+---------------+
//! | command (u16) | length (u16)  |
//! +---------------+---------------+
//! | payload[length] ...           |
//! +-------------------------------+
//! ```
//!
//! There are no checksums and no escaping. A zero-length payload is legal.
//!
//! # Example
//!
//! ```
//! use protocol_was::{Command, PacketHeader, HEADER_LEN};
//!
//! // Encode a URI packet
//! let payload = b"/index.html";
//! let header = PacketHeader::new(Command::Uri, payload.len() as u16);
//! let mut buf = [0u8; HEADER_LEN];
//! header.encode(&mut buf);
//!
//! // Parse it back
//! let parsed = PacketHeader::parse(&buf).unwrap();
//! assert_eq!(parsed.command, Command::Uri as u16);
//! assert_eq!(parsed.length, payload.len() as u16);
//! ```

mod codec;
mod command;
mod error;
mod header;
mod method;

pub use codec::{encode_metric, parse_u32, parse_u64, split_pair, MAX_METRIC_NAME};
pub use command::Command;
pub use error::ParseError;
pub use header::{PacketHeader, HEADER_LEN, MAX_PAYLOAD};
pub use method::Method;
