//! The response output engine.
//!
//! Tracks the output sub-state machine, frames the response head onto the
//! control channel, and streams body bytes through the output pipe. As
//! with input, every wait includes the control descriptor.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

use log::{debug, warn};
use protocol_was::Command;

use crate::error::{PollResult, ReadError};
use crate::input::InputState;
use crate::poll::{self, Dir};
use crate::request::Accounting;
use crate::session::Session;

/// Hop-by-hop headers (RFC 2616 13.5.1) never travel to the peer.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// True for names that must not go through the header API.
/// Content-Length is declared via `set_length` only.
pub(crate) fn header_forbidden(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Lifecycle of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum OutputState {
    /// Nothing committed yet.
    #[default]
    None,
    /// Status sent, headers accumulating.
    Headers,
    /// Body streaming without a declared length.
    UnknownLength,
    /// Body streaming; `remaining` declared bytes left.
    KnownLength { remaining: u64 },
    End,
    Error,
}

#[derive(Default)]
pub(crate) struct Output {
    pub state: OutputState,
    /// Declared response length, once set.
    pub announced: Option<u64>,
    /// Total body bytes put on the pipe.
    pub sent: u64,
    pub accounting: Accounting,
}

impl Output {
    /// Account for `n` body bytes written to the pipe.
    pub fn note_sent(&mut self, n: u64) {
        self.sent += n;
        if let OutputState::KnownLength { remaining } = self.state {
            self.state = OutputState::KnownLength {
                remaining: remaining.saturating_sub(n),
            };
        }
    }
}

impl Session {
    /// Set the response status. Must happen before headers and body; the
    /// default is 200 once a body begins, 204 otherwise.
    pub fn status(&mut self, status: u16) -> bool {
        if !(100..=599).contains(&status) {
            return false;
        }
        {
            let Some(req) = self.request.as_ref() else {
                return false;
            };
            if !matches!(req.output.state, OutputState::None) {
                return false;
            }
        }
        if !self.control.send_status(status) {
            self.fail_request();
            return false;
        }
        if let Some(req) = self.request.as_mut() {
            req.output.state = OutputState::Headers;
        }
        true
    }

    /// Set a response header.
    ///
    /// Hop-by-hop names and Content-Length are rejected; declare the
    /// length via [`set_length`](Self::set_length) instead.
    pub fn set_header(&mut self, name: &str, value: &str) -> bool {
        if name.is_empty() || name.contains('=') || header_forbidden(name) {
            return false;
        }
        let state = match self.request.as_ref() {
            Some(req) => req.output.state,
            None => return false,
        };
        match state {
            OutputState::None => {
                if !self.status(200) {
                    return false;
                }
            }
            OutputState::Headers => {}
            _ => return false,
        }
        if !self.control.send_header(name, value) {
            self.fail_request();
            return false;
        }
        true
    }

    /// Copy all request headers to the response, skipping the forbidden
    /// names.
    pub fn copy_all_headers(&mut self) -> bool {
        let pairs: Vec<(String, String)> = match self.request.as_ref() {
            Some(req) => req
                .headers
                .iter()
                .filter(|(name, _)| !header_forbidden(name))
                .cloned()
                .collect(),
            None => return false,
        };
        for (name, value) in &pairs {
            if !self.set_header(name, value) {
                return false;
            }
        }
        true
    }

    /// Declare the response body length. Optional, but declaring early
    /// lets the peer cut overhead.
    pub fn set_length(&mut self, length: u64) -> bool {
        let Some(req) = self.request.as_mut() else {
            return false;
        };
        match req.output.state {
            OutputState::None | OutputState::Headers => {
                if req.output.announced.is_some() {
                    return false;
                }
                req.output.announced = Some(length);
            }
            OutputState::UnknownLength => {
                if length < req.output.sent {
                    req.output.state = OutputState::Error;
                    return false;
                }
                req.output.announced = Some(length);
                req.output.state = OutputState::KnownLength {
                    remaining: length - req.output.sent,
                };
            }
            _ => return false,
        }
        if !self.control.send_length(length) {
            self.fail_request();
            return false;
        }
        true
    }

    /// Finalize the response head and announce that a body follows
    /// (though it may turn out empty). Idempotent once a body state is
    /// reached.
    pub fn output_begin(&mut self) -> bool {
        let state = match self.request.as_ref() {
            Some(req) => req.output.state,
            None => return false,
        };
        match state {
            OutputState::None => {
                if !self.status(200) {
                    return false;
                }
            }
            OutputState::Headers => {}
            OutputState::UnknownLength | OutputState::KnownLength { .. } => return true,
            OutputState::End | OutputState::Error => return false,
        }
        if !self.control.send_empty(Command::Data) {
            self.fail_request();
            return false;
        }
        if let Some(req) = self.request.as_mut() {
            req.output.state = match req.output.announced {
                Some(n) => OutputState::KnownLength { remaining: n },
                None => OutputState::UnknownLength,
            };
        }
        true
    }

    /// The output pipe descriptor, in non-blocking mode.
    ///
    /// After writing to it directly, call [`sent`](Self::sent).
    pub fn output_fd(&self) -> RawFd {
        self.output_pipe.as_raw_fd()
    }

    /// Wait for the output pipe to become writable, servicing control
    /// packets that arrive during the wait.
    pub fn output_poll(&mut self, timeout_ms: i32) -> PollResult {
        if self.dead {
            return PollResult::Error;
        }
        match self.request.as_ref().map(|r| r.output.state) {
            None => return PollResult::Error,
            Some(OutputState::End) => return PollResult::End,
            Some(OutputState::Error) => return PollResult::Closed,
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
                match self.request.as_ref().map(|r| r.output.state) {
                    None => return PollResult::Closed,
                    Some(OutputState::End) => return PollResult::End,
                    Some(OutputState::Error) => return PollResult::Closed,
                    Some(_) => {}
                }
            }

            let ready = match poll::wait(
                self.control.fd(),
                Some((self.output_pipe.as_raw_fd(), Dir::Write)),
                timeout_ms,
            ) {
                Ok(Some(ready)) => ready,
                Ok(None) => return PollResult::Timeout,
                Err(err) => {
                    debug!("output poll failed: {err}");
                    return PollResult::Error;
                }
            };

            if ready.control {
                self.service_control();
                if self.dead {
                    return PollResult::Error;
                }
                match self.request.as_ref().map(|r| r.output.state) {
                    None => return PollResult::Closed,
                    Some(OutputState::End) => return PollResult::End,
                    Some(OutputState::Error) => return PollResult::Closed,
                    Some(_) => {}
                }
            }
            if ready.pipe_hup {
                if let Some(req) = self.request.as_mut() {
                    req.output.state = OutputState::Error;
                }
                return PollResult::Closed;
            }
            if ready.pipe {
                return PollResult::Success;
            }
            if timeout_ms == 0 {
                return PollResult::Timeout;
            }
        }
    }

    /// Account for `n` body bytes the caller wrote directly to
    /// [`output_fd`](Self::output_fd).
    ///
    /// Must not be called once [`write`](Self::write) has been used on
    /// this request.
    pub fn sent(&mut self, n: u64) -> bool {
        let Some(req) = self.request.as_mut() else {
            return false;
        };
        if req.output.accounting == Accounting::Wrapped {
            return false;
        }
        req.output.accounting = Accounting::Raw;
        match req.output.state {
            OutputState::KnownLength { remaining } => {
                if n > remaining {
                    req.output.state = OutputState::Error;
                    return false;
                }
                req.output.note_sent(n);
                true
            }
            OutputState::UnknownLength => {
                req.output.note_sent(n);
                true
            }
            _ => false,
        }
    }

    /// Write response body data, blocking until all of it is on the pipe.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if !self.output_begin() {
            return false;
        }
        {
            let Some(req) = self.request.as_mut() else {
                return false;
            };
            req.output.accounting = Accounting::Wrapped;
            if let OutputState::KnownLength { remaining } = req.output.state {
                if data.len() as u64 > remaining {
                    warn!("write beyond the declared response length");
                    req.output.state = OutputState::Error;
                    return false;
                }
            }
        }

        let fd = self.output_pipe.as_raw_fd();
        let mut off = 0;
        while off < data.len() {
            let n = unsafe {
                libc::write(
                    fd,
                    data[off..].as_ptr() as *const libc::c_void,
                    data.len() - off,
                )
            };
            if n > 0 {
                off += n as usize;
                if let Some(req) = self.request.as_mut() {
                    req.output.note_sent(n as u64);
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
                io::ErrorKind::WouldBlock => match self.output_poll(-1) {
                    PollResult::Success => continue,
                    PollResult::Timeout => continue,
                    _ => return false,
                },
                _ => {
                    debug!("output write failed: {err}");
                    self.fail_request();
                    return false;
                }
            }
        }
        true
    }

    /// Write a string.
    pub fn puts(&mut self, s: &str) -> bool {
        self.write(s.as_bytes())
    }

    /// Write formatted text, e.g. `session.write_fmt(format_args!(...))`.
    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> bool {
        self.puts(&args.to_string())
    }

    /// Copy up to `max_length` bytes from the request body to the
    /// response body. Blocks until at least one byte was copied; `Ok(0)`
    /// means the end of the request body.
    pub fn splice(&mut self, max_length: usize) -> Result<usize, ReadError> {
        if !self.output_begin() {
            return Err(ReadError::Protocol);
        }
        let mut scratch = [0u8; 8192];
        let cap = max_length.min(scratch.len());
        if cap == 0 {
            return Ok(0);
        }
        let n = self.read(&mut scratch[..cap])?;
        if n == 0 {
            return Ok(0);
        }
        if !self.write(&scratch[..n]) {
            return Err(ReadError::Protocol);
        }
        Ok(n)
    }

    /// Copy the whole request body to the response body.
    ///
    /// With `end`, the response length is declared first when the input
    /// length is known (letting the peer optimize), and the response is
    /// ended afterwards.
    pub fn splice_all(&mut self, end: bool) -> bool {
        if self.has_body() {
            if end {
                let announced = match self.request.as_ref() {
                    Some(req) => req.output.announced,
                    None => return false,
                };
                if announced.is_none() {
                    if let Some(remaining) = self.input_remaining() {
                        let sent = self.request.as_ref().map_or(0, |r| r.output.sent);
                        if !self.set_length(sent + remaining) {
                            return false;
                        }
                    }
                }
            }
            loop {
                match self.splice(usize::MAX) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
        }
        if end {
            self.end()
        } else {
            true
        }
    }

    /// Mark the end of the current request.
    ///
    /// With no status set, "204 No Content" is used; with no body
    /// announced, NO_DATA is sent. Residual request body is drained.
    /// Also performed implicitly by the next accept.
    pub fn end(&mut self) -> bool {
        let state = match self.request.as_ref() {
            Some(req) => req.output.state,
            None => return false,
        };
        let mut ok = true;
        match state {
            OutputState::End => return true,
            OutputState::Error => ok = false,
            OutputState::None => {
                ok = self.control.send_status(204) && self.control.send_empty(Command::NoData);
                self.set_output_state(if ok {
                    OutputState::End
                } else {
                    OutputState::Error
                });
            }
            OutputState::Headers => {
                ok = self.control.send_empty(Command::NoData);
                self.set_output_state(if ok {
                    OutputState::End
                } else {
                    OutputState::Error
                });
            }
            OutputState::UnknownLength => {
                // An undeclared-length body is terminated by declaring
                // the final length.
                let sent = self.request.as_ref().map_or(0, |r| r.output.sent);
                ok = self.control.send_length(sent);
                self.set_output_state(if ok {
                    OutputState::End
                } else {
                    OutputState::Error
                });
            }
            OutputState::KnownLength { remaining } => {
                if remaining == 0 {
                    self.set_output_state(OutputState::End);
                } else {
                    warn!("response ended {remaining} bytes short of the declared length");
                    let sent = self.request.as_ref().map_or(0, |r| r.output.sent);
                    self.control.send_premature(sent);
                    self.set_output_state(OutputState::Error);
                    ok = false;
                }
            }
        }

        if !self.drain_input() {
            ok = false;
        }
        ok
    }

    /// Abort the current request, reporting to the peer how much of the
    /// response body was actually sent. Useful when an error is found
    /// after the status went out.
    pub fn abort(&mut self) -> bool {
        let state = match self.request.as_ref() {
            Some(req) => req.output.state,
            None => return false,
        };
        let ok = match state {
            OutputState::End => return false,
            OutputState::Error => true,
            OutputState::None => {
                self.control.send_status(500) && self.control.send_empty(Command::NoData)
            }
            OutputState::Headers => self.control.send_empty(Command::NoData),
            OutputState::UnknownLength | OutputState::KnownLength { .. } => {
                let sent = self.request.as_ref().map_or(0, |r| r.output.sent);
                self.control.send_premature(sent)
            }
        };
        self.drain_input();
        self.set_output_state(OutputState::Error);
        ok
    }

    fn set_output_state(&mut self, state: OutputState) {
        if let Some(req) = self.request.as_mut() {
            req.output.state = state;
        }
    }

    /// Discard whatever is left of the request body.
    fn drain_input(&mut self) -> bool {
        let active = self.request.as_ref().map_or(false, |req| {
            matches!(
                req.input.state,
                InputState::UnknownLength | InputState::KnownLength { .. } | InputState::Closed
            )
        });
        if active {
            self.input_close()
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_headers() {
        assert!(header_forbidden("Content-Length"));
        assert!(header_forbidden("content-length"));
        assert!(header_forbidden("Connection"));
        assert!(header_forbidden("Keep-Alive"));
        assert!(header_forbidden("Proxy-Authenticate"));
        assert!(header_forbidden("Proxy-Authorization"));
        assert!(header_forbidden("TE"));
        assert!(header_forbidden("Trailer"));
        assert!(header_forbidden("Transfer-Encoding"));
        assert!(header_forbidden("Upgrade"));

        assert!(!header_forbidden("Content-Type"));
        assert!(!header_forbidden("X-Custom"));
    }

    #[test]
    fn test_note_sent_known_length() {
        let mut output = Output {
            state: OutputState::KnownLength { remaining: 10 },
            announced: Some(10),
            ..Default::default()
        };
        output.note_sent(4);
        assert_eq!(output.state, OutputState::KnownLength { remaining: 6 });
        output.note_sent(6);
        assert_eq!(output.state, OutputState::KnownLength { remaining: 0 });
        assert_eq!(output.sent, 10);
    }

    #[test]
    fn test_note_sent_unknown_length() {
        let mut output = Output {
            state: OutputState::UnknownLength,
            ..Default::default()
        };
        output.note_sent(7);
        assert_eq!(output.state, OutputState::UnknownLength);
        assert_eq!(output.sent, 7);
    }
}
