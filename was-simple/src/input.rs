//! The request-body input engine.
//!
//! Tracks the input sub-state machine and drives the input pipe. Every
//! wait includes the control descriptor, so LENGTH, PREMATURE, STOP and
//! METRIC packets are serviced while the application blocks on body
//! bytes.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use log::debug;
use protocol_was::Command;

use crate::error::{PollResult, ReadError};
use crate::poll::{self, Dir};
use crate::request::Accounting;
use crate::session::Session;

/// Lifecycle of the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum InputState {
    /// No body: NO_DATA received, or no DATA yet.
    #[default]
    NoBody,
    /// DATA received, no LENGTH yet.
    UnknownLength,
    /// Declared length known; `remaining` bytes left on the pipe.
    KnownLength { remaining: u64 },
    /// The body is exhausted.
    End,
    /// The application closed the input; draining until the peer
    /// acknowledges with PREMATURE or the declared length is reached.
    Closed,
    Error,
}

#[derive(Default)]
pub(crate) struct Input {
    pub state: InputState,
    /// A DATA packet announced a body (sticky across End).
    pub body: bool,
    /// Total bytes consumed off the pipe.
    pub received: u64,
    /// Declared total length, once known.
    pub announced: Option<u64>,
    /// Offset at which the peer truncated the body.
    pub premature: Option<u64>,
    pub accounting: Accounting,
}

impl Input {
    /// The total number of bytes the pipe will ultimately carry, if known.
    pub fn target(&self) -> Option<u64> {
        self.premature.or(self.announced)
    }

    pub fn on_data(&mut self, pending_length: Option<u64>) -> Result<(), &'static str> {
        if self.body {
            return Err("duplicate DATA");
        }
        self.body = true;
        self.announced = pending_length;
        self.state = match pending_length {
            Some(0) => InputState::End,
            Some(n) => InputState::KnownLength { remaining: n },
            None => InputState::UnknownLength,
        };
        Ok(())
    }

    pub fn on_length(&mut self, length: u64) -> Result<(), &'static str> {
        match self.state {
            InputState::UnknownLength => {
                if length < self.received {
                    self.state = InputState::Error;
                    return Err("declared length below bytes already read");
                }
                self.announced = Some(length);
                let remaining = length - self.received;
                self.state = if remaining == 0 {
                    InputState::End
                } else {
                    InputState::KnownLength { remaining }
                };
                Ok(())
            }
            InputState::Closed if self.announced.is_none() => {
                self.announced = Some(length);
                Ok(())
            }
            _ => {
                self.state = InputState::Error;
                Err("unexpected LENGTH")
            }
        }
    }

    pub fn on_premature(&mut self, offset: u64) -> Result<(), &'static str> {
        if !self.body {
            self.state = InputState::Error;
            return Err("PREMATURE without body");
        }
        if offset < self.received {
            self.state = InputState::Error;
            return Err("PREMATURE offset below bytes already read");
        }
        self.premature = Some(offset);
        if self.received >= offset {
            self.state = InputState::End;
        } else if !matches!(self.state, InputState::Closed) {
            self.state = InputState::KnownLength {
                remaining: offset - self.received,
            };
        }
        Ok(())
    }

    /// Account for `n` bytes consumed off the pipe.
    pub fn note_received(&mut self, n: u64) {
        self.received += n;
        match self.state {
            InputState::KnownLength { remaining } => {
                let remaining = remaining.saturating_sub(n);
                self.state = if remaining == 0 {
                    InputState::End
                } else {
                    InputState::KnownLength { remaining }
                };
            }
            InputState::Closed => {
                if let Some(target) = self.target() {
                    if self.received >= target {
                        self.state = InputState::End;
                    }
                }
            }
            _ => {}
        }
    }
}

impl Session {
    /// Is a request body present? (It may be empty.)
    ///
    /// Stays true once a DATA packet has arrived, even after the body is
    /// exhausted.
    pub fn has_body(&self) -> bool {
        self.request.as_ref().map_or(false, |r| r.input.body)
    }

    /// How much request body is left to read, if the total is known.
    pub fn input_remaining(&self) -> Option<u64> {
        let req = self.request.as_ref()?;
        match req.input.state {
            InputState::KnownLength { remaining } => Some(remaining),
            InputState::End => Some(0),
            InputState::UnknownLength | InputState::Closed => req
                .input
                .target()
                .map(|t| t.saturating_sub(req.input.received)),
            InputState::NoBody | InputState::Error => None,
        }
    }

    /// The input pipe descriptor, in non-blocking mode.
    ///
    /// After reading from it directly, call [`received`](Self::received).
    pub fn input_fd(&self) -> RawFd {
        self.input_pipe.as_raw_fd()
    }

    /// Wait for request body data, servicing control packets that arrive
    /// during the wait.
    ///
    /// `timeout_ms` follows poll(2): 0 does not block, -1 waits forever.
    pub fn input_poll(&mut self, timeout_ms: i32) -> PollResult {
        if self.dead {
            return PollResult::Error;
        }
        match self.request.as_ref().map(|r| r.input.state) {
            None => return PollResult::Error,
            Some(InputState::NoBody) | Some(InputState::End) => return PollResult::End,
            Some(InputState::Closed) | Some(InputState::Error) => return PollResult::Closed,
            Some(_) => {}
        }

        loop {
            // Packets may already sit in the receive buffer from an
            // earlier read; the descriptor will not signal those.
            if self.control.has_buffered() {
                self.service_control();
                if self.dead {
                    return PollResult::Error;
                }
                match self.request.as_ref().map(|r| r.input.state) {
                    None => return PollResult::Closed,
                    Some(InputState::End) => return PollResult::End,
                    Some(InputState::Closed) | Some(InputState::Error) => {
                        return PollResult::Closed
                    }
                    Some(_) => {}
                }
            }

            let ready = match poll::wait(
                self.control.fd(),
                Some((self.input_pipe.as_raw_fd(), Dir::Read)),
                timeout_ms,
            ) {
                Ok(Some(ready)) => ready,
                Ok(None) => return PollResult::Timeout,
                Err(err) => {
                    debug!("input poll failed: {err}");
                    return PollResult::Error;
                }
            };

            if ready.control {
                self.service_control();
                if self.dead {
                    return PollResult::Error;
                }
                match self.request.as_ref().map(|r| r.input.state) {
                    None => return PollResult::Closed,
                    Some(InputState::End) => return PollResult::End,
                    Some(InputState::Closed) | Some(InputState::Error) => {
                        return PollResult::Closed
                    }
                    Some(_) => {}
                }
            }
            if ready.pipe || ready.pipe_hup {
                return PollResult::Success;
            }
            if timeout_ms == 0 {
                return PollResult::Timeout;
            }
        }
    }

    /// Account for `n` bytes the caller read directly from
    /// [`input_fd`](Self::input_fd).
    ///
    /// Must not be called once [`read`](Self::read) has been used on this
    /// request.
    pub fn received(&mut self, n: u64) -> bool {
        let Some(req) = self.request.as_mut() else {
            return false;
        };
        if req.input.accounting == Accounting::Wrapped {
            return false;
        }
        req.input.accounting = Accounting::Raw;
        match req.input.state {
            InputState::KnownLength { remaining } => {
                if n > remaining {
                    req.input.state = InputState::Error;
                    return false;
                }
                req.input.note_received(n);
                true
            }
            InputState::UnknownLength => {
                req.input.note_received(n);
                true
            }
            _ => false,
        }
    }

    /// Read request body data, blocking until at least one byte is
    /// available, the body ends, or an error occurs.
    ///
    /// `Ok(0)` means the end of the body.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let fd = self.input_pipe.as_raw_fd();
        loop {
            let cap = {
                let Some(req) = self.request.as_mut() else {
                    return Err(ReadError::Protocol);
                };
                req.input.accounting = Accounting::Wrapped;
                match req.input.state {
                    InputState::NoBody | InputState::End | InputState::Closed => return Ok(0),
                    InputState::Error => return Err(ReadError::Protocol),
                    InputState::KnownLength { remaining } => {
                        buf.len().min(remaining.min(usize::MAX as u64) as usize)
                    }
                    InputState::UnknownLength => buf.len(),
                }
            };

            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, cap) };
            if n > 0 {
                if let Some(req) = self.request.as_mut() {
                    req.input.note_received(n as u64);
                }
                return Ok(n as usize);
            }
            if n == 0 {
                // pipe EOF before the declared end of the body
                self.fail_request();
                return Err(ReadError::Protocol);
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => match self.input_poll(-1) {
                    PollResult::Success => continue,
                    PollResult::End => return Ok(0),
                    PollResult::Timeout => continue,
                    PollResult::Closed | PollResult::Error => return Err(ReadError::Protocol),
                },
                _ => {
                    self.fail_request();
                    return Err(ReadError::Io(err));
                }
            }
        }
    }

    /// Tell the peer to stop sending the request body and discard
    /// whatever is still pending.
    ///
    /// Returns once the peer has acknowledged with PREMATURE or the
    /// declared length has been drained.
    pub fn input_close(&mut self) -> bool {
        let fd = self.input_pipe.as_raw_fd();
        {
            let Some(req) = self.request.as_mut() else {
                return false;
            };
            match req.input.state {
                InputState::NoBody | InputState::End => return true,
                InputState::Error => return false,
                InputState::Closed => {}
                InputState::UnknownLength | InputState::KnownLength { .. } => {
                    req.input.state = InputState::Closed;
                    if !self.control.send_empty(Command::Stop) {
                        self.fail_request();
                        return false;
                    }
                }
            }
        }

        let mut scratch = [0u8; 4096];
        loop {
            {
                let Some(req) = self.request.as_mut() else {
                    return false;
                };
                match req.input.state {
                    InputState::End => return true,
                    InputState::Error => return false,
                    _ => {}
                }
                if let Some(target) = req.input.target() {
                    if req.input.received >= target {
                        req.input.state = InputState::End;
                        return true;
                    }
                }
            }

            let n = unsafe {
                libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
            };
            if n > 0 {
                if let Some(req) = self.request.as_mut() {
                    req.input.note_received(n as u64);
                }
                continue;
            }
            if n == 0 {
                self.fail_request();
                return false;
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    if self.control.has_buffered() {
                        self.service_control();
                        if self.dead {
                            return false;
                        }
                        continue;
                    }
                    let ready = match poll::wait(
                        self.control.fd(),
                        Some((fd, Dir::Read)),
                        -1,
                    ) {
                        Ok(Some(ready)) => ready,
                        Ok(None) => continue,
                        Err(err) => {
                            debug!("input close poll failed: {err}");
                            self.fail_request();
                            return false;
                        }
                    };
                    if ready.control {
                        self.service_control();
                        if self.dead {
                            return false;
                        }
                    }
                }
                _ => {
                    debug!("input close read failed: {err}");
                    self.fail_request();
                    return false;
                }
            }
        }
    }
}
