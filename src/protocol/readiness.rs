//! Wait for a socket to become readable or writable, with a timeout.
use std::{io, os::fd::AsRawFd, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Blocks until `source` is ready for `interest` or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout (or a signal interruption). Hang-ups and
/// socket errors count as ready so the following I/O call surfaces them.
pub fn wait<S: AsRawFd>(source: &S, interest: Interest, timeout: Duration) -> io::Result<bool> {
    let events = match interest {
        Interest::Readable => libc::POLLIN,
        Interest::Writable => libc::POLLOUT,
    };
    let mut pollfd = libc::pollfd {
        fd: source.as_raw_fd(),
        events,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

    // SAFETY: `pollfd` is a valid, exclusively borrowed array of length 1 for
    // the duration of the call.
    let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    if ready == 0 {
        return Ok(false);
    }
    if pollfd.revents & libc::POLLNVAL != 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "descriptor is not open",
        ));
    }
    Ok(pollfd.revents & (events | libc::POLLHUP | libc::POLLERR) != 0)
}
