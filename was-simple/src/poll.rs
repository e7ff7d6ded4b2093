//! poll(2) waits over the session's descriptors.
//!
//! Every blocking entry point of the API funnels through [`wait`], which
//! always includes the control descriptor in the wait set so that
//! out-of-band packets (STOP, PREMATURE, METRIC, shutdown) are serviced
//! while the application is blocked on a body pipe.

use std::io;
use std::os::fd::RawFd;

/// Which pipe readiness the caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

/// Readiness reported by [`wait`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Ready {
    /// The control descriptor has data (or EOF) pending.
    pub control: bool,
    /// The pipe descriptor is ready for the requested direction.
    pub pipe: bool,
    /// The pipe reported hangup or error with no data pending.
    pub pipe_hup: bool,
}

/// Wait for readiness on the control descriptor and optionally one pipe.
///
/// `timeout_ms` follows poll(2): 0 does not block, -1 waits forever.
/// Returns `None` on timeout. EINTR restarts the wait.
pub(crate) fn wait(
    control: RawFd,
    pipe: Option<(RawFd, Dir)>,
    timeout_ms: i32,
) -> io::Result<Option<Ready>> {
    let mut fds = [
        libc::pollfd {
            fd: control,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: -1,
            events: 0,
            revents: 0,
        },
    ];

    let mut nfds: libc::nfds_t = 1;
    if let Some((fd, dir)) = pipe {
        fds[1].fd = fd;
        fds[1].events = match dir {
            Dir::Read => libc::POLLIN,
            Dir::Write => libc::POLLOUT,
        };
        nfds = 2;
    }

    loop {
        let n = unsafe { libc::poll(fds.as_mut_ptr(), nfds, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(None);
        }

        let mut ready = Ready::default();
        // POLLHUP on the control channel means EOF; the subsequent read
        // reports it, so it counts as readable.
        if fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            ready.control = true;
        }
        if nfds == 2 {
            if fds[1].revents & fds[1].events != 0 {
                ready.pipe = true;
            } else if fds[1].revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                ready.pipe_hup = true;
            }
        }
        return Ok(Some(ready));
    }
}

/// Wait for the control descriptor alone. Returns false on timeout.
pub(crate) fn wait_control(control: RawFd, timeout_ms: i32) -> io::Result<bool> {
    Ok(wait(control, None, timeout_ms)?.is_some())
}

/// Wait until `fd` accepts writes again.
pub(crate) fn wait_writable(fd: RawFd) -> io::Result<()> {
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    }];
    loop {
        let n = unsafe { libc::poll(fds.as_mut_ptr(), 1, -1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(());
    }
}
