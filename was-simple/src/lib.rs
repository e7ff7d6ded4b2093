//! Synchronous worker-side implementation of the Web Application Socket
//! (WAS) protocol.
//!
//! A WAS worker inherits three descriptors from the web server: a framed
//! bidirectional control channel, a pipe carrying the request body, and a
//! pipe carrying the response body. The worker accepts one request at a
//! time, reads its body, writes a response, and loops until the peer
//! closes the control channel.
//!
//! # Architecture
//!
//! [`Session`] is the single runtime object. It owns the descriptor
//! triple and at most one request's state. The control channel, the
//! input engine and the output engine are independent kernel objects
//! whose events interleave arbitrarily; the API hides that behind
//! blocking calls by funnelling every wait through one poll(2) set that
//! always contains the control descriptor. STOP, PREMATURE, LENGTH and
//! METRIC packets are therefore serviced no matter which pipe the
//! application is blocked on.
//!
//! The wire encoding lives in the sans-IO `protocol-was` crate.
//!
//! # Example
//!
//! ```rust,no_run
//! use was_simple::Session;
//!
//! fn main() -> std::io::Result<()> {
//!     let mut session = Session::new()?;
//!     while let Some(uri) = session.accept() {
//!         let uri = uri.to_owned();
//!         session.status(200);
//!         session.set_header("Content-Type", "text/plain");
//!         session.puts(&format!("hello from {uri}\n"));
//!         session.end();
//!     }
//!     Ok(())
//! }
//! ```

mod control;
mod error;
mod input;
mod output;
mod poll;
mod request;
mod session;

pub use error::{PollResult, ReadError};
pub use request::PairIter;
pub use session::{Accept, Session, CONTROL_FILENO, INPUT_FILENO, OUTPUT_FILENO};

// The method enum appears in the public API.
pub use protocol_was::Method;
