//! Error and result types of the synchronous API.

use std::io;

/// Outcome of [`input_poll`](crate::Session::input_poll) and
/// [`output_poll`](crate::Session::output_poll).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// The pipe is ready for I/O.
    Success,
    /// An error has occurred, and this request shall be aborted.
    Error,
    /// The timeout has expired before the pipe became ready.
    Timeout,
    /// At the end of the entity. The caller must not attempt further I/O
    /// on the pipe.
    End,
    /// The entity has been closed, but the application may continue to
    /// handle the request.
    Closed,
}

/// Errors returned by [`read`](crate::Session::read) and
/// [`splice`](crate::Session::splice).
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// A read or write syscall failed on one of the descriptors.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The peer violated the protocol, the request was cancelled, or the
    /// call is illegal in the current request state.
    #[error("protocol error")]
    Protocol,
}
