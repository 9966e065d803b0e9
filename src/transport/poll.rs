//! The one poll(2) call behind the blocking facade and the server loop

#![allow(unsafe_code)]

use crate::connection::Events;
use std::io;
use std::os::unix::io::RawFd;

/// Wait for events on `fds`; returns the received events per entry.
/// An interrupted wait reports no events.
pub fn poll(fds: &[(RawFd, Events)], timeout_ms: i32) -> io::Result<Vec<Events>> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&(fd, events)| libc::pollfd {
            fd,
            events: events.bits(),
            revents: 0,
        })
        .collect();
    // SAFETY: pfds is a live, exclusively borrowed array of pfds.len() entries.
    let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![Events::empty(); fds.len()]);
        }
        return Err(err);
    }
    Ok(pfds
        .iter()
        .map(|p| Events::from_bits_truncate(p.revents))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_poll_readable() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();
        assert_eq!(poll(&[(fd, Events::READ)], 0).unwrap(), vec![Events::empty()]);
        a.write_all(b"x").unwrap();
        let rev = poll(&[(fd, Events::READ)], 1000).unwrap();
        assert!(rev[0].contains(Events::READ));
    }
}
