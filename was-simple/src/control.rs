//! The framed control channel.
//!
//! Wraps the bidirectional control descriptor: accumulates inbound bytes
//! until a complete packet is buffered, and serializes outbound packets
//! with partial writes retried. A failed send latches the channel into a
//! terminal error state; all subsequent sends short-circuit to `false`.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace};
use protocol_was::{encode_metric, Command, PacketHeader, HEADER_LEN, MAX_PAYLOAD};

use crate::poll;

/// Initial capacity of the receive buffer: one header plus a short
/// payload covers the vast majority of packets.
const RECV_BUF_SIZE: usize = 4096;

/// One inbound control packet.
///
/// The command is the raw wire code; dispatch interprets it. Unknown
/// codes keep correct framing (the length field is trusted), so they can
/// be skipped without desyncing the stream.
pub(crate) struct Packet {
    pub command: u16,
    pub payload: Bytes,
}

/// Outcome of a receive attempt.
pub(crate) enum Recv {
    Packet(Packet),
    /// No complete packet available within the timeout.
    WouldBlock,
    /// The peer closed the control channel.
    Eof,
}

pub(crate) struct Control {
    fd: OwnedFd,
    recv_buf: BytesMut,
    send_failed: bool,
}

impl Control {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            recv_buf: BytesMut::with_capacity(RECV_BUF_SIZE),
            send_failed: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// True if buffered bytes may already contain a packet.
    pub fn has_buffered(&self) -> bool {
        !self.recv_buf.is_empty()
    }

    fn parse_buffered(&mut self) -> Option<Packet> {
        let header = PacketHeader::parse(&self.recv_buf).ok()?;
        let total = HEADER_LEN + header.length as usize;
        if self.recv_buf.len() < total {
            return None;
        }
        self.recv_buf.advance(HEADER_LEN);
        let payload = self.recv_buf.split_to(header.length as usize).freeze();
        trace!("control recv: command={} len={}", header.command, payload.len());
        Some(Packet {
            command: header.command,
            payload,
        })
    }

    /// One read(2) into the receive buffer. Returns 0 on EOF.
    fn fill(&mut self) -> io::Result<usize> {
        let mut scratch = [0u8; RECV_BUF_SIZE];
        loop {
            let n = unsafe {
                libc::read(
                    self.fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            self.recv_buf.extend_from_slice(&scratch[..n as usize]);
            return Ok(n as usize);
        }
    }

    /// Receive one complete packet, waiting up to `timeout_ms` for bytes
    /// to arrive (-1 = forever, 0 = never).
    ///
    /// The control descriptor is in blocking mode, but it is always
    /// polled before the read, so a partial packet never wedges the
    /// caller past the timeout.
    pub fn recv(&mut self, timeout_ms: i32) -> io::Result<Recv> {
        loop {
            if let Some(packet) = self.parse_buffered() {
                return Ok(Recv::Packet(packet));
            }
            if !poll::wait_control(self.fd(), timeout_ms)? {
                return Ok(Recv::WouldBlock);
            }
            if self.fill()? == 0 {
                debug!("control channel closed by peer");
                return Ok(Recv::Eof);
            }
        }
    }

    /// Serialize and send one packet. Partial writes are retried; on a
    /// send error the channel latches and every later send fails.
    pub fn send(&mut self, command: Command, payload: &[u8]) -> bool {
        if self.send_failed {
            return false;
        }
        if payload.len() > MAX_PAYLOAD {
            debug!("control send: payload too large ({} bytes)", payload.len());
            return false;
        }

        trace!("control send: command={:?} len={}", command, payload.len());

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.resize(HEADER_LEN, 0);
        PacketHeader::new(command, payload.len() as u16).encode(&mut buf);
        buf.extend_from_slice(payload);

        if let Err(err) = self.write_all(&buf) {
            debug!("control send failed: {err}");
            self.send_failed = true;
            return false;
        }
        true
    }

    fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let n = unsafe {
                libc::write(
                    self.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => {
                        poll::wait_writable(self.fd())?;
                        continue;
                    }
                    _ => return Err(err),
                }
            }
            data = &data[n as usize..];
        }
        Ok(())
    }

    pub fn send_empty(&mut self, command: Command) -> bool {
        self.send(command, &[])
    }

    pub fn send_status(&mut self, status: u16) -> bool {
        self.send(Command::Status, &u32::from(status).to_le_bytes())
    }

    pub fn send_header(&mut self, name: &str, value: &str) -> bool {
        let mut payload = Vec::with_capacity(name.len() + 1 + value.len());
        payload.extend_from_slice(name.as_bytes());
        payload.push(b'=');
        payload.extend_from_slice(value.as_bytes());
        self.send(Command::Header, &payload)
    }

    pub fn send_length(&mut self, length: u64) -> bool {
        self.send(Command::Length, &length.to_le_bytes())
    }

    pub fn send_premature(&mut self, offset: u64) -> bool {
        self.send(Command::Premature, &offset.to_le_bytes())
    }

    pub fn send_metric(&mut self, name: &str, value: f32) -> bool {
        match encode_metric(name, value) {
            Some(payload) => self.send(Command::Metric, &payload),
            None => false,
        }
    }
}
