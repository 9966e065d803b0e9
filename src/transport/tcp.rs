//! TCP address resolution and non-blocking connect

use crate::error::{Error, Result};
use crate::protocol::smb2_constants::DEFAULT_PORT;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

/// Split `host`, `host:port`, `[v6]` or `[v6]:port` into host and port.
/// A bare IPv6 literal is taken as a host.
pub fn split_host_port(server: &str) -> Result<(&str, u16)> {
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| Error::InvalidParameter(format!("invalid port in {}", server)))
    };
    if let Some(rest) = server.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::InvalidParameter(format!("unterminated [ in {}", server)))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, parse_port(port)?)),
            None if tail.is_empty() => Ok((host, DEFAULT_PORT)),
            None => Err(Error::InvalidParameter(format!("garbage after ] in {}", server))),
        };
    }
    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host, parse_port(port)?)),
        _ => Ok((server, DEFAULT_PORT)),
    }
}

/// Resolve a server name to candidate addresses, alternating address
/// families starting with the resolver's first choice.
pub fn resolve(server: &str) -> Result<Vec<SocketAddr>> {
    let (host, port) = split_host_port(server)?;
    if host.is_empty() {
        return Err(Error::InvalidParameter("empty server name".into()));
    }
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let Some(first_v6) = addrs.first().map(|a| a.is_ipv6()) else {
        return Err(Error::InvalidParameter(format!("{} did not resolve", host)));
    };
    let total = addrs.len();
    let (mut primary, mut secondary): (Vec<_>, Vec<_>) =
        addrs.into_iter().partition(|a| a.is_ipv6() == first_v6);
    primary.reverse();
    secondary.reverse();

    let mut out = Vec::with_capacity(total);
    loop {
        match (primary.pop(), secondary.pop()) {
            (None, None) => break,
            (a, b) => out.extend(a.into_iter().chain(b)),
        }
    }
    Ok(out)
}

/// Open a non-blocking socket and start connecting it.
pub fn start_connect(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(socket),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(socket),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(socket),
        Err(e) => Err(e),
    }
}

/// Listening socket for the server role, with address reuse.
pub fn bind_and_listen(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("server").unwrap(), ("server", 445));
        assert_eq!(split_host_port("server:1445").unwrap(), ("server", 1445));
        assert_eq!(split_host_port("[::1]:8445").unwrap(), ("::1", 8445));
        assert_eq!(split_host_port("[fe80::1]").unwrap(), ("fe80::1", 445));
        assert_eq!(split_host_port("fe80::1").unwrap(), ("fe80::1", 445));
        assert!(split_host_port("server:port").is_err());
        assert!(split_host_port("[::1").is_err());
    }

    #[test]
    fn test_resolve_literal() {
        let addrs = resolve("127.0.0.1:9000").unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:9000".parse().unwrap()]);
        assert!(resolve(":445").is_err());
    }

    #[test]
    fn test_listen_and_connect() {
        let listener = bind_and_listen("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = start_connect(addr).unwrap();
        let (_stream, peer) = listener.accept().unwrap();
        assert_eq!(peer, socket.local_addr().unwrap().as_socket().unwrap());
    }
}
