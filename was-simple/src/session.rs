//! The Session: one descriptor triple, one request at a time.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::{debug, trace, warn};
use protocol_was::{parse_u32, parse_u64, split_pair, Command, Method};

use crate::control::{Control, Packet, Recv};
use crate::input::InputState;
use crate::output::OutputState;
use crate::request::{PairIter, RequestState};

/// Well-known descriptor slots inherited from the peer.
pub const CONTROL_FILENO: RawFd = 3;
pub const INPUT_FILENO: RawFd = 0;
pub const OUTPUT_FILENO: RawFd = 1;

/// Outcome of [`Session::accept_non_block`].
#[derive(Debug)]
pub enum Accept<'a> {
    /// A request is ready; the value is its URI.
    Request(&'a str),
    /// The connection is idle and no request is being received. Poll
    /// [`control_fd`](Session::control_fd) and call again.
    WouldBlock,
    /// No more requests; the process shall terminate.
    Stop,
}

pub(crate) enum Dispatch {
    Continue,
    RequestReady,
    Shutdown,
}

/// The worker side of one WAS connection.
///
/// Owns the control channel and the two body pipes, and hands out one
/// request at a time through [`accept`](Self::accept). The whole API is
/// synchronous; every blocking call keeps servicing the control channel
/// so out-of-band packets are never missed.
///
/// A Session is not safe for concurrent use from multiple threads;
/// separate Sessions on disjoint descriptor triples are independent.
pub struct Session {
    pub(crate) control: Control,
    pub(crate) input_pipe: OwnedFd,
    pub(crate) output_pipe: OwnedFd,
    pub(crate) request: Option<RequestState>,
    pub(crate) stopping: bool,
    pub(crate) dead: bool,
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Session {
    /// Create the default Session for this process from the descriptors
    /// inherited from the peer (control = 3, input = 0, output = 1).
    ///
    /// Call once per process; the Session owns the descriptors and
    /// closes them on drop.
    pub fn new() -> io::Result<Self> {
        Self::with_fds(CONTROL_FILENO, INPUT_FILENO, OUTPUT_FILENO)
    }

    /// Create a Session on the given descriptors.
    ///
    /// Takes ownership: the descriptors must not be used or closed
    /// elsewhere afterwards. The body pipes are switched to non-blocking
    /// mode.
    pub fn with_fds(control: RawFd, input: RawFd, output: RawFd) -> io::Result<Self> {
        let control = unsafe { OwnedFd::from_raw_fd(control) };
        let input_pipe = unsafe { OwnedFd::from_raw_fd(input) };
        let output_pipe = unsafe { OwnedFd::from_raw_fd(output) };

        set_nonblocking(input_pipe.as_raw_fd())?;
        set_nonblocking(output_pipe.as_raw_fd())?;

        Ok(Self {
            control: Control::new(control),
            input_pipe,
            output_pipe,
            request: None,
            stopping: false,
            dead: false,
        })
    }

    /// The control channel descriptor, for external polling after
    /// [`accept_non_block`](Self::accept_non_block).
    pub fn control_fd(&self) -> RawFd {
        self.control.fd()
    }

    /// Wait for a request to arrive. A pending older request is cleaned
    /// up first.
    ///
    /// Returns the request URI, or `None` if this process shall
    /// terminate. The URI stays valid until the next accept.
    pub fn accept(&mut self) -> Option<&str> {
        self.finish_request();
        if self.dead || self.stopping {
            return None;
        }

        loop {
            match self.control.recv(-1) {
                Err(err) => {
                    warn!("control receive failed: {err}");
                    self.dead = true;
                    return None;
                }
                Ok(Recv::WouldBlock) => continue,
                Ok(Recv::Eof) => {
                    self.stopping = true;
                    return None;
                }
                Ok(Recv::Packet(packet)) => match self.dispatch(packet) {
                    Dispatch::RequestReady => break,
                    Dispatch::Shutdown => return None,
                    Dispatch::Continue => {}
                },
            }
        }

        let uri = self.request.as_ref().map(|r| r.uri.as_str());
        debug!("accepted request: {}", uri.unwrap_or(""));
        uri
    }

    /// Like [`accept`](Self::accept), but does not block while the
    /// connection is idle.
    pub fn accept_non_block(&mut self) -> Accept<'_> {
        self.finish_request();
        if self.dead || self.stopping {
            return Accept::Stop;
        }

        loop {
            // Only an idle connection may report would-block; once bytes
            // of a request have arrived, parse it to completion.
            let timeout = if self.request.is_none() && !self.control.has_buffered() {
                0
            } else {
                -1
            };
            match self.control.recv(timeout) {
                Err(err) => {
                    warn!("control receive failed: {err}");
                    self.dead = true;
                    return Accept::Stop;
                }
                Ok(Recv::WouldBlock) => return Accept::WouldBlock,
                Ok(Recv::Eof) => {
                    self.stopping = true;
                    return Accept::Stop;
                }
                Ok(Recv::Packet(packet)) => match self.dispatch(packet) {
                    Dispatch::RequestReady => break,
                    Dispatch::Shutdown => return Accept::Stop,
                    Dispatch::Continue => {}
                },
            }
        }

        match self.request.as_ref() {
            Some(req) => Accept::Request(req.uri.as_str()),
            None => Accept::Stop,
        }
    }

    /// Finalize the previous request: implicit end, then drop its state.
    fn finish_request(&mut self) {
        if let Some(req) = self.request.as_ref() {
            if !matches!(req.output.state, OutputState::End | OutputState::Error) {
                let _ = self.end();
            } else if matches!(
                req.input.state,
                InputState::UnknownLength | InputState::KnownLength { .. } | InputState::Closed
            ) {
                let _ = self.input_close();
            }
            self.request = None;
        }
    }

    /// Drain and dispatch whatever control packets are pending, without
    /// blocking. Called from every poll when the control descriptor
    /// reports readable.
    pub(crate) fn service_control(&mut self) {
        loop {
            match self.control.recv(0) {
                Err(err) => {
                    warn!("control receive failed: {err}");
                    self.dead = true;
                    self.fail_active();
                    return;
                }
                Ok(Recv::WouldBlock) => return,
                Ok(Recv::Eof) => {
                    self.stopping = true;
                    self.fail_active();
                    return;
                }
                Ok(Recv::Packet(packet)) => {
                    if let Dispatch::Shutdown = self.dispatch(packet) {
                        return;
                    }
                }
            }
        }
    }

    /// Apply one control packet to the session state.
    pub(crate) fn dispatch(&mut self, packet: Packet) -> Dispatch {
        let Some(command) = Command::from_u16(packet.command) else {
            warn!("unknown control command {}", packet.command);
            self.fail_request();
            return Dispatch::Continue;
        };
        trace!("dispatch {command:?}");

        match command {
            Command::Nop => Dispatch::Continue,

            Command::Request => match self.request.as_ref() {
                Some(req) if req.complete => {
                    // The peer may not pipeline requests.
                    warn!("REQUEST while a request is active; terminating");
                    self.fail_request();
                    self.dead = true;
                    Dispatch::Shutdown
                }
                Some(_) => {
                    debug!("REQUEST while assembling one; discarding the old");
                    self.request = Some(RequestState::default());
                    Dispatch::Continue
                }
                None => {
                    self.request = Some(RequestState::default());
                    Dispatch::Continue
                }
            },

            Command::Method => {
                let method = parse_u32(&packet.payload)
                    .and_then(Method::from_u32)
                    .ok();
                match (self.nascent(), method) {
                    (Some(req), Some(method)) => {
                        req.method = method;
                        Dispatch::Continue
                    }
                    _ => {
                        self.fail_request();
                        Dispatch::Continue
                    }
                }
            }

            Command::Uri => match self.nascent() {
                Some(req) => {
                    req.uri = String::from_utf8_lossy(&packet.payload).into_owned();
                    Dispatch::Continue
                }
                None => {
                    self.fail_request();
                    Dispatch::Continue
                }
            },

            Command::ScriptName
            | Command::PathInfo
            | Command::QueryString
            | Command::RemoteHost => match self.nascent() {
                Some(req) => {
                    let value = if packet.payload.is_empty() {
                        None
                    } else {
                        Some(String::from_utf8_lossy(&packet.payload).into_owned())
                    };
                    match command {
                        Command::ScriptName => req.script_name = value,
                        Command::PathInfo => req.path_info = value,
                        Command::QueryString => req.query_string = value,
                        _ => req.remote_host = value,
                    }
                    Dispatch::Continue
                }
                None => {
                    self.fail_request();
                    Dispatch::Continue
                }
            },

            Command::Header | Command::Parameter => {
                let pair = split_pair(&packet.payload).ok().map(|(name, value)| {
                    (
                        String::from_utf8_lossy(name).into_owned(),
                        String::from_utf8_lossy(value).into_owned(),
                    )
                });
                match (self.nascent(), pair) {
                    (Some(req), Some((name, value))) => {
                        if command == Command::Header {
                            req.headers.push((name, value));
                        } else {
                            req.parameters.insert(name, value);
                        }
                        Dispatch::Continue
                    }
                    _ => {
                        self.fail_request();
                        Dispatch::Continue
                    }
                }
            }

            Command::Length => {
                let Ok(length) = parse_u64(&packet.payload) else {
                    self.fail_request();
                    return Dispatch::Continue;
                };
                match self.request.as_mut() {
                    Some(req) if !req.complete && !req.input.body => {
                        if req.pending_length.replace(length).is_some() {
                            self.fail_request();
                        }
                        Dispatch::Continue
                    }
                    Some(req) if req.input.body => {
                        if let Err(reason) = req.input.on_length(length) {
                            warn!("LENGTH rejected: {reason}");
                            self.fail_request();
                        }
                        Dispatch::Continue
                    }
                    _ => {
                        self.fail_request();
                        Dispatch::Continue
                    }
                }
            }

            Command::Data => match self.request.as_mut() {
                Some(req) if !req.complete => {
                    let pending = req.pending_length.take();
                    if req.input.on_data(pending).is_err() {
                        self.fail_request();
                        Dispatch::Continue
                    } else {
                        req.complete = true;
                        Dispatch::RequestReady
                    }
                }
                _ => {
                    self.fail_request();
                    Dispatch::Continue
                }
            },

            Command::NoData => match self.request.as_mut() {
                Some(req)
                    if !req.complete && !req.input.body && req.pending_length.is_none() =>
                {
                    req.complete = true;
                    Dispatch::RequestReady
                }
                _ => {
                    self.fail_request();
                    Dispatch::Continue
                }
            },

            Command::Stop => match self.request.as_mut() {
                None => {
                    debug!("peer requested shutdown");
                    self.stopping = true;
                    Dispatch::Shutdown
                }
                Some(req) if !req.complete => {
                    debug!("request cancelled while assembling");
                    self.request = None;
                    Dispatch::Continue
                }
                Some(req) => {
                    debug!("request cancelled by peer");
                    req.input.state = InputState::Error;
                    req.output.state = OutputState::Error;
                    Dispatch::Continue
                }
            },

            Command::Premature => {
                let Ok(offset) = parse_u64(&packet.payload) else {
                    self.fail_request();
                    return Dispatch::Continue;
                };
                match self.request.as_mut() {
                    Some(req) => {
                        if let Err(reason) = req.input.on_premature(offset) {
                            warn!("PREMATURE rejected: {reason}");
                            self.fail_request();
                        } else {
                            debug!("request body truncated at offset {offset}");
                        }
                        Dispatch::Continue
                    }
                    None => {
                        self.fail_request();
                        Dispatch::Continue
                    }
                }
            }

            Command::Metric => {
                if let Some(req) = self.request.as_mut() {
                    req.want_metrics = true;
                } else {
                    trace!("METRIC with no request; ignored");
                }
                Dispatch::Continue
            }

            Command::Status => {
                // Response-direction command; the peer must not send it.
                self.fail_request();
                Dispatch::Continue
            }
        }
    }

    /// The current request, while it is still being assembled.
    fn nascent(&mut self) -> Option<&mut RequestState> {
        self.request.as_mut().filter(|req| !req.complete)
    }

    /// Handle a protocol violation: a partial request is discarded and
    /// the next REQUEST awaited; an active one is failed so the
    /// application sees errors.
    pub(crate) fn fail_request(&mut self) {
        match self.request.as_mut() {
            Some(req) if !req.complete => {
                warn!("protocol violation; discarding partial request");
                self.request = None;
            }
            Some(req) => {
                warn!("protocol violation; failing current request");
                req.input.state = InputState::Error;
                req.output.state = OutputState::Error;
            }
            None => {
                warn!("protocol violation outside a request");
            }
        }
    }

    /// Fail the active request without touching a partial one, used when
    /// the transport itself is gone.
    fn fail_active(&mut self) {
        if let Some(req) = self.request.as_mut() {
            req.input.state = InputState::Error;
            req.output.state = OutputState::Error;
        }
    }

    // -- Request inspection --

    /// The method of the current request.
    pub fn method(&self) -> Option<Method> {
        self.request.as_ref().map(|r| r.method)
    }

    /// The URI of the current request.
    pub fn uri(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.uri.as_str())
    }

    /// The SCRIPT_NAME attribute.
    pub fn script_name(&self) -> Option<&str> {
        self.request.as_ref()?.script_name.as_deref()
    }

    /// The PATH_INFO attribute.
    pub fn path_info(&self) -> Option<&str> {
        self.request.as_ref()?.path_info.as_deref()
    }

    /// The query string.
    pub fn query_string(&self) -> Option<&str> {
        self.request.as_ref()?.query_string.as_deref()
    }

    /// The REMOTE_HOST attribute.
    pub fn remote_host(&self) -> Option<&str> {
        self.request.as_ref()?.remote_host.as_deref()
    }

    /// The value of a request header, any one of them if repeated.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.request.as_ref()?.get_header(name)
    }

    /// All values of a repeated request header, in arrival order.
    pub fn get_multi_header(&self, name: &str) -> PairIter {
        match self.request.as_ref() {
            Some(req) => PairIter::new(
                req.headers
                    .iter()
                    .filter(|(k, _)| k.eq_ignore_ascii_case(name))
                    .cloned()
                    .collect(),
            ),
            None => PairIter::empty(),
        }
    }

    /// All request headers, in arrival order.
    pub fn get_header_iterator(&self) -> PairIter {
        match self.request.as_ref() {
            Some(req) => PairIter::new(req.headers.clone()),
            None => PairIter::empty(),
        }
    }

    /// The value of a WAS parameter.
    pub fn get_parameter(&self, name: &str) -> Option<&str> {
        self.request.as_ref()?.parameters.get(name).map(|v| v.as_str())
    }

    /// All WAS parameters.
    pub fn get_parameter_iterator(&self) -> PairIter {
        match self.request.as_ref() {
            Some(req) => PairIter::new(
                req.parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            None => PairIter::empty(),
        }
    }

    // -- Metrics --

    /// Did the peer ask for metrics for the current request?
    pub fn want_metrics(&self) -> bool {
        self.request.as_ref().map_or(false, |r| r.want_metrics)
    }

    /// Send one metric sample. A no-op unless the peer asked for
    /// metrics.
    pub fn metric(&mut self, name: &str, value: f32) -> bool {
        let Some(req) = self.request.as_ref() else {
            return false;
        };
        if !req.want_metrics {
            return true;
        }
        if !self.control.send_metric(name, value) {
            self.fail_request();
            return false;
        }
        true
    }
}
