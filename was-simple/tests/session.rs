//! End-to-end tests driving a Session over a real descriptor triple,
//! with the test acting as the web server peer.
//!
//! The peer side queues its control packets and body bytes up front;
//! socket and pipe buffers are far larger than anything exchanged here,
//! so the single-threaded lockstep never blocks.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;

use protocol_was::{Command, Method};
use was_simple::{Accept, PollResult, ReadError, Session};

struct Peer {
    control: UnixStream,
    input: File,
    output: File,
}

impl Peer {
    fn send(&mut self, command: Command, payload: &[u8]) {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(command as u16).to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        self.control.write_all(&frame).unwrap();
    }

    fn send_empty(&mut self, command: Command) {
        self.send(command, &[]);
    }

    fn send_method(&mut self, method: Method) {
        self.send(Command::Method, &(method as u32).to_le_bytes());
    }

    fn send_str(&mut self, command: Command, value: &str) {
        self.send(command, value.as_bytes());
    }

    fn send_u64(&mut self, command: Command, value: u64) {
        self.send(command, &value.to_le_bytes());
    }

    /// Queue a minimal body-less request.
    fn send_simple_request(&mut self, uri: &str) {
        self.send_empty(Command::Request);
        self.send_method(Method::Get);
        self.send_str(Command::Uri, uri);
        self.send_empty(Command::NoData);
    }

    fn recv(&mut self) -> (u16, Vec<u8>) {
        let mut header = [0u8; 4];
        self.control.read_exact(&mut header).unwrap();
        let command = u16::from_le_bytes([header[0], header[1]]);
        let length = u16::from_le_bytes([header[2], header[3]]);
        let mut payload = vec![0u8; length as usize];
        self.control.read_exact(&mut payload).unwrap();
        (command, payload)
    }

    fn expect(&mut self, command: Command) -> Vec<u8> {
        let (code, payload) = self.recv();
        assert_eq!(code, command as u16, "unexpected control packet");
        payload
    }

    fn expect_status(&mut self, status: u32) {
        let payload = self.expect(Command::Status);
        assert_eq!(payload, status.to_le_bytes());
    }

    fn read_body(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.output.read_exact(&mut buf).unwrap();
        buf
    }
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn setup() -> (Session, Peer) {
    let (peer_control, worker_control) = UnixStream::pair().unwrap();
    let (input_read, input_write) = pipe();
    let (output_read, output_write) = pipe();

    let session = Session::with_fds(worker_control.into_raw_fd(), input_read, output_write)
        .unwrap();
    let peer = Peer {
        control: peer_control,
        input: unsafe { File::from_raw_fd(input_write) },
        output: unsafe { File::from_raw_fd(output_read) },
    };
    (session, peer)
}

#[test]
fn get_no_body_responds_204() {
    let (mut session, mut peer) = setup();

    peer.send_simple_request("/");

    assert_eq!(session.accept(), Some("/"));
    assert_eq!(session.method(), Some(Method::Get));
    assert!(!session.has_body());

    assert!(session.end());

    peer.expect_status(204);
    assert!(peer.expect(Command::NoData).is_empty());
}

#[test]
fn post_known_length_echo() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Post);
    peer.send_str(Command::Uri, "/echo");
    peer.send_str(Command::Header, "Content-Type=text/plain");
    peer.send_u64(Command::Length, 5);
    peer.send_empty(Command::Data);
    peer.input.write_all(b"hello").unwrap();

    assert_eq!(session.accept(), Some("/echo"));
    assert_eq!(session.method(), Some(Method::Post));
    assert_eq!(session.get_header("content-type"), Some("text/plain"));
    assert!(session.has_body());
    assert_eq!(session.input_remaining(), Some(5));

    let mut body = Vec::new();
    let mut buf = [0u8; 16];
    loop {
        match session.read(&mut buf).unwrap() {
            0 => break,
            n => body.extend_from_slice(&buf[..n]),
        }
    }
    assert_eq!(body, b"hello");
    assert_eq!(session.input_remaining(), Some(0));

    assert!(session.status(200));
    assert!(session.set_length(5));
    assert!(session.write(b"hello"));
    assert!(session.end());

    peer.expect_status(200);
    assert_eq!(peer.expect(Command::Length), 5u64.to_le_bytes());
    peer.expect(Command::Data);
    assert_eq!(peer.read_body(5), b"hello");
}

#[test]
fn input_close_mid_stream_sends_stop_and_drains() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Post);
    peer.send_str(Command::Uri, "/upload");
    peer.send_u64(Command::Length, 1_000_000);
    peer.send_empty(Command::Data);
    peer.input.write_all(&[0xAB; 100]).unwrap();

    assert_eq!(session.accept(), Some("/upload"));

    let mut buf = [0u8; 50];
    assert_eq!(session.read(&mut buf).unwrap(), 50);

    // The peer answers the worker's STOP with the truncation offset.
    peer.send_u64(Command::Premature, 100);

    assert!(session.input_close());
    assert_eq!(session.read(&mut buf).unwrap(), 0);
    assert_eq!(session.input_remaining(), Some(0));

    peer.expect(Command::Stop);
}

#[test]
fn abort_after_partial_response_sends_premature() {
    let (mut session, mut peer) = setup();

    peer.send_simple_request("/fail");
    assert_eq!(session.accept(), Some("/fail"));

    assert!(session.status(200));
    assert!(session.write(&[0x42; 10]));
    assert!(session.abort());

    peer.expect_status(200);
    peer.expect(Command::Data);
    assert_eq!(peer.read_body(10), [0x42; 10]);
    assert_eq!(peer.expect(Command::Premature), 10u64.to_le_bytes());
}

#[test]
fn metric_roundtrip() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Get);
    peer.send_str(Command::Uri, "/");
    peer.send_empty(Command::Metric);
    peer.send_empty(Command::NoData);

    assert_eq!(session.accept(), Some("/"));
    assert!(session.want_metrics());
    assert!(session.metric("latency_ms", 12.5));
    assert!(session.end());

    let payload = peer.expect(Command::Metric);
    assert_eq!(f32::from_le_bytes(payload[..4].try_into().unwrap()), 12.5);
    assert_eq!(&payload[4..], b"latency_ms");
    peer.expect_status(204);
    peer.expect(Command::NoData);
}

#[test]
fn metric_is_noop_without_peer_request() {
    let (mut session, mut peer) = setup();

    peer.send_simple_request("/");
    assert_eq!(session.accept(), Some("/"));

    assert!(!session.want_metrics());
    assert!(session.metric("latency_ms", 1.0));
    assert!(session.end());

    // Straight to the response; no METRIC packet was sent.
    peer.expect_status(204);
    peer.expect(Command::NoData);
}

#[test]
fn shutdown_on_control_eof() {
    let (mut session, peer) = setup();

    drop(peer);

    assert_eq!(session.accept(), None);
    assert_eq!(session.accept(), None);
}

#[test]
fn shutdown_on_idle_stop() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Stop);

    assert_eq!(session.accept(), None);
    assert_eq!(session.accept(), None);
}

#[test]
fn request_isolation_across_accepts() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Post);
    peer.send_str(Command::Uri, "/first");
    peer.send_str(Command::Header, "X-One=1");
    peer.send_str(Command::Parameter, "role=admin");
    peer.send_str(Command::ScriptName, "/app");
    peer.send_empty(Command::NoData);

    assert_eq!(session.accept(), Some("/first"));
    assert_eq!(session.get_header("x-one"), Some("1"));
    assert_eq!(session.get_parameter("role"), Some("admin"));
    assert_eq!(session.script_name(), Some("/app"));
    assert!(session.end());

    peer.send_simple_request("/second");

    assert_eq!(session.accept(), Some("/second"));
    assert_eq!(session.method(), Some(Method::Get));
    assert_eq!(session.get_header("x-one"), None);
    assert_eq!(session.get_parameter("role"), None);
    assert_eq!(session.script_name(), None);

    peer.expect_status(204);
    peer.expect(Command::NoData);
}

#[test]
fn status_is_exclusive() {
    let (mut session, mut peer) = setup();

    peer.send_simple_request("/");
    assert_eq!(session.accept(), Some("/"));

    assert!(session.status(200));
    assert!(!session.status(404));

    assert!(session.set_header("X-Late", "1"));
    assert!(!session.status(500));
}

#[test]
fn status_rejected_after_headers() {
    let (mut session, mut peer) = setup();

    peer.send_simple_request("/");
    assert_eq!(session.accept(), Some("/"));

    // set_header on a fresh response commits the default 200 first.
    assert!(session.set_header("Content-Type", "text/html"));
    assert!(!session.status(404));

    peer.expect_status(200);
    let payload = peer.expect(Command::Header);
    assert_eq!(payload, b"Content-Type=text/html");
}

#[test]
fn forbidden_headers_are_rejected() {
    let (mut session, mut peer) = setup();

    peer.send_simple_request("/");
    assert_eq!(session.accept(), Some("/"));

    assert!(!session.set_header("Content-Length", "5"));
    for name in [
        "Connection",
        "Keep-Alive",
        "Proxy-Authenticate",
        "Proxy-Authorization",
        "TE",
        "Trailer",
        "Transfer-Encoding",
        "Upgrade",
    ] {
        assert!(!session.set_header(name, "x"), "{name} must be rejected");
    }

    // The rejections committed nothing.
    assert!(session.status(404));
    peer.expect_status(404);
}

#[test]
fn copy_all_headers_skips_forbidden() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Get);
    peer.send_str(Command::Uri, "/");
    peer.send_str(Command::Header, "Content-Type=text/css");
    peer.send_str(Command::Header, "Connection=keep-alive");
    peer.send_str(Command::Header, "X-Trace=abc");
    peer.send_empty(Command::NoData);

    assert_eq!(session.accept(), Some("/"));
    assert!(session.copy_all_headers());
    assert!(session.end());

    peer.expect_status(200);
    assert_eq!(peer.expect(Command::Header), b"Content-Type=text/css");
    assert_eq!(peer.expect(Command::Header), b"X-Trace=abc");
    peer.expect(Command::NoData);
}

#[test]
fn default_status_is_200_once_body_begins() {
    let (mut session, mut peer) = setup();

    peer.send_simple_request("/");
    assert_eq!(session.accept(), Some("/"));

    assert!(session.puts("hi"));
    assert!(session.end());

    peer.expect_status(200);
    peer.expect(Command::Data);
    assert_eq!(peer.read_body(2), b"hi");
    // Undeclared length is closed out by the final LENGTH.
    assert_eq!(peer.expect(Command::Length), 2u64.to_le_bytes());
}

#[test]
fn metric_packet_during_input_poll_is_serviced() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Post);
    peer.send_str(Command::Uri, "/");
    peer.send_empty(Command::Data);

    assert_eq!(session.accept(), Some("/"));
    assert!(!session.want_metrics());

    peer.send_empty(Command::Metric);
    peer.input.write_all(b"x").unwrap();

    assert_eq!(session.input_poll(-1), PollResult::Success);
    assert!(session.want_metrics());
}

#[test]
fn stop_cancels_active_request() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Post);
    peer.send_str(Command::Uri, "/");
    peer.send_u64(Command::Length, 100);
    peer.send_empty(Command::Data);

    assert_eq!(session.accept(), Some("/"));

    peer.send_empty(Command::Stop);

    assert_eq!(session.input_poll(-1), PollResult::Closed);
    let mut buf = [0u8; 8];
    assert!(matches!(session.read(&mut buf), Err(ReadError::Protocol)));
    assert!(!session.status(200));
    assert!(!session.write(b"x"));

    // The session itself survives and can accept again.
    peer.send_simple_request("/next");
    assert_eq!(session.accept(), Some("/next"));
}

#[test]
fn unknown_length_body_ends_on_late_length() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Post);
    peer.send_str(Command::Uri, "/");
    peer.send_empty(Command::Data);
    peer.input.write_all(b"abc").unwrap();

    assert_eq!(session.accept(), Some("/"));
    assert_eq!(session.input_remaining(), None);

    let mut buf = [0u8; 16];
    assert_eq!(session.read(&mut buf).unwrap(), 3);

    peer.send_u64(Command::Length, 3);
    assert_eq!(session.read(&mut buf).unwrap(), 0);
    assert_eq!(session.input_remaining(), Some(0));
}

#[test]
fn end_drains_unread_body() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Post);
    peer.send_str(Command::Uri, "/");
    peer.send_u64(Command::Length, 10);
    peer.send_empty(Command::Data);
    peer.input.write_all(&[1; 10]).unwrap();

    assert_eq!(session.accept(), Some("/"));
    assert!(session.end());

    peer.expect_status(204);
    peer.expect(Command::NoData);
    peer.expect(Command::Stop);
}

#[test]
fn splice_all_echoes_and_declares_length() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Post);
    peer.send_str(Command::Uri, "/echo");
    peer.send_u64(Command::Length, 5);
    peer.send_empty(Command::Data);
    peer.input.write_all(b"hello").unwrap();

    assert_eq!(session.accept(), Some("/echo"));
    assert!(session.splice_all(true));

    assert_eq!(peer.expect(Command::Length), 5u64.to_le_bytes());
    peer.expect_status(200);
    peer.expect(Command::Data);
    assert_eq!(peer.read_body(5), b"hello");
}

#[test]
fn write_beyond_declared_length_fails() {
    let (mut session, mut peer) = setup();

    peer.send_simple_request("/");
    assert_eq!(session.accept(), Some("/"));

    assert!(session.status(200));
    assert!(session.set_length(3));
    assert!(session.write(b"abc"));
    assert!(!session.write(b"d"));
    assert!(!session.end());
}

#[test]
fn incomplete_declared_response_fails_end() {
    let (mut session, mut peer) = setup();

    peer.send_simple_request("/");
    assert_eq!(session.accept(), Some("/"));

    assert!(session.status(200));
    assert!(session.set_length(10));
    assert!(session.output_begin());
    assert!(session.write(b"abc"));
    assert!(!session.end());

    peer.expect_status(200);
    assert_eq!(peer.expect(Command::Length), 10u64.to_le_bytes());
    peer.expect(Command::Data);
    assert_eq!(peer.read_body(3), b"abc");
    assert_eq!(peer.expect(Command::Premature), 3u64.to_le_bytes());
}

#[test]
fn received_is_rejected_after_read() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Post);
    peer.send_str(Command::Uri, "/");
    peer.send_u64(Command::Length, 4);
    peer.send_empty(Command::Data);
    peer.input.write_all(b"abcd").unwrap();

    assert_eq!(session.accept(), Some("/"));

    let mut buf = [0u8; 2];
    assert_eq!(session.read(&mut buf).unwrap(), 2);
    assert!(!session.received(1));
}

#[test]
fn raw_fd_accounting_path() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Post);
    peer.send_str(Command::Uri, "/");
    peer.send_u64(Command::Length, 4);
    peer.send_empty(Command::Data);
    peer.input.write_all(b"abcd").unwrap();

    assert_eq!(session.accept(), Some("/"));
    assert_eq!(session.input_poll(-1), PollResult::Success);

    let mut buf = [0u8; 4];
    let n = unsafe {
        libc::read(
            session.input_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    assert_eq!(n, 4);
    assert!(session.received(4));
    assert_eq!(session.input_remaining(), Some(0));
    assert!(!session.received(1));
}

#[test]
fn accept_non_block_on_idle_connection() {
    let (mut session, mut peer) = setup();

    assert!(matches!(session.accept_non_block(), Accept::WouldBlock));

    peer.send_simple_request("/later");
    match session.accept_non_block() {
        Accept::Request(uri) => assert_eq!(uri, "/later"),
        other => panic!("expected request, got {other:?}"),
    }
}

#[test]
fn multi_header_iterators_are_independent_snapshots() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Get);
    peer.send_str(Command::Uri, "/");
    peer.send_str(Command::Header, "Cookie=a=1");
    peer.send_str(Command::Header, "Cookie=b=2");
    peer.send_str(Command::Header, "Host=example.com");
    peer.send_empty(Command::NoData);

    assert_eq!(session.accept(), Some("/"));

    let mut one = session.get_multi_header("cookie");
    let two = session.get_multi_header("cookie");
    drop(two);

    assert_eq!(one.next(), Some(("Cookie".into(), "a=1".into())));
    assert_eq!(one.next(), Some(("Cookie".into(), "b=2".into())));
    assert_eq!(one.next(), None);

    let all: Vec<_> = session.get_header_iterator().collect();
    assert_eq!(all.len(), 3);
}

#[test]
fn implicit_end_on_next_accept() {
    let (mut session, mut peer) = setup();

    peer.send_simple_request("/one");
    assert_eq!(session.accept(), Some("/one"));

    // No explicit end; the next accept finalizes the response.
    peer.send_simple_request("/two");
    assert_eq!(session.accept(), Some("/two"));

    peer.expect_status(204);
    peer.expect(Command::NoData);
}

#[test]
fn zero_length_attribute_clears_it() {
    let (mut session, mut peer) = setup();

    peer.send_empty(Command::Request);
    peer.send_method(Method::Get);
    peer.send_str(Command::Uri, "/");
    peer.send_str(Command::QueryString, "a=1");
    peer.send_str(Command::QueryString, "");
    peer.send_empty(Command::NoData);

    assert_eq!(session.accept(), Some("/"));
    assert_eq!(session.query_string(), None);
}
