//! Listen socket reconciler (C8): matches newly configured listen sockets
//! against inherited ones, reusing descriptors where addresses match.
//! Grounded on `nxt_runtime_listen_sockets_create`/`_enable`.

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrIn, SockaddrIn6,
};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use tracing::{error, info};

use crate::address::SocketAddress;
use crate::socket_inheritance::{ListenSocket, LISTEN_BACKLOG};

/// Reconciles `configured` against `inherited`, reusing a descriptor for
/// every address that already exists in `inherited`, and binding a fresh
/// socket for every address that doesn't. A failure to create any single
/// socket fails the whole operation, per §4.7.
pub fn reconcile(
    configured: &[SocketAddress],
    inherited: &[ListenSocket],
) -> eyre::Result<Vec<ListenSocket>> {
    let mut result = Vec::with_capacity(configured.len());

    for addr in configured {
        if let Some(reused) = inherited.iter().find(|ls| ls.sockaddr.matches(addr)) {
            info!(address = %addr.text(), fd = reused.socket_fd, "reusing inherited listen socket");
            result.push(ListenSocket {
                sockaddr: addr.clone(),
                socket_fd: reused.socket_fd,
                backlog: LISTEN_BACKLOG,
                non_blocking: reused.non_blocking,
                stream: reused.stream,
            });
            continue;
        }

        result.push(create_listen_socket(addr)?);
    }

    Ok(result)
}

fn create_listen_socket(addr: &SocketAddress) -> eyre::Result<ListenSocket> {
    let fd = match addr {
        SocketAddress::Inet(SocketAddr::V4(v4)) => {
            let fd = socket(
                AddressFamily::Inet,
                SockType::Stream,
                SockFlag::SOCK_NONBLOCK,
                None,
            )?;
            setsockopt(&fd, sockopt::ReuseAddr, &true)?;
            let sockaddr: SockaddrIn = (*v4).into();
            bind(fd.as_raw_fd(), &sockaddr)?;
            fd
        }
        SocketAddress::Inet(SocketAddr::V6(v6)) => {
            let fd = socket(
                AddressFamily::Inet6,
                SockType::Stream,
                SockFlag::SOCK_NONBLOCK,
                None,
            )?;
            setsockopt(&fd, sockopt::ReuseAddr, &true)?;
            let sockaddr: SockaddrIn6 = (*v6).into();
            bind(fd.as_raw_fd(), &sockaddr)?;
            fd
        }
        SocketAddress::Unix { .. } => bind_unix_socket(addr)?,
    };

    listen(&fd, Backlog::new(LISTEN_BACKLOG)?)?;
    clear_cloexec(&fd)?;

    let socket_fd = fd.as_raw_fd();
    std::mem::forget(fd); // ownership now lives in the listen-sockets table

    Ok(ListenSocket {
        sockaddr: addr.clone(),
        socket_fd,
        backlog: LISTEN_BACKLOG,
        non_blocking: true,
        stream: true,
    })
}

fn bind_unix_socket(addr: &SocketAddress) -> eyre::Result<OwnedFd> {
    use nix::sys::socket::UnixAddr;

    let path = match addr {
        SocketAddress::Unix {
            path,
            abstract_name,
            ..
        } => {
            if *abstract_name {
                // First byte is already NUL; UnixAddr::new treats the bytes
                // as abstract when they start with NUL on Linux.
                return bind_unix_fd(path);
            }
            path
        }
        _ => unreachable!("bind_unix_socket called with non-unix address"),
    };

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )?;
    let unix_path = std::path::Path::new(std::str::from_utf8(path)?);
    let _ = std::fs::remove_file(unix_path);
    let sockaddr = UnixAddr::new(unix_path)?;
    bind(fd.as_raw_fd(), &sockaddr)?;
    Ok(fd)
}

#[cfg(target_os = "linux")]
fn bind_unix_fd(abstract_path: &[u8]) -> eyre::Result<OwnedFd> {
    use nix::sys::socket::UnixAddr;

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )?;
    let sockaddr = UnixAddr::new_abstract(&abstract_path[1..])?;
    bind(fd.as_raw_fd(), &sockaddr)?;
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
fn bind_unix_fd(_abstract_path: &[u8]) -> eyre::Result<OwnedFd> {
    error!("abstract unix sockets are Linux-only");
    Err(eyre::eyre!("abstract unix sockets are not supported on this platform"))
}

fn clear_cloexec(fd: &OwnedFd) -> eyre::Result<()> {
    let borrowed: BorrowedFd = fd.as_fd();
    let mut flags = FdFlag::from_bits_truncate(fcntl(borrowed, FcntlArg::F_GETFD)?);
    flags.remove(FdFlag::FD_CLOEXEC);
    fcntl(borrowed, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

/// Marks every non-blocking listen socket with the event engine so it
/// begins accepting connections. The actual registration is delegated to
/// the injected `on_enable` callback, keeping this module free of a
/// concrete event-engine dependency (§6: the engine is a collaborator).
pub fn enable(sockets: &[ListenSocket], mut on_enable: impl FnMut(&ListenSocket)) {
    for ls in sockets {
        if ls.non_blocking {
            on_enable(ls);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_matching_inherited_socket() {
        let addr = SocketAddress::parse("127.0.0.1:18080").unwrap();
        let inherited = vec![ListenSocket {
            sockaddr: addr.clone(),
            socket_fd: 99,
            backlog: LISTEN_BACKLOG,
            non_blocking: true,
            stream: true,
        }];

        let result = reconcile(&[addr], &inherited).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].socket_fd, 99);
    }

    #[test]
    fn creates_fresh_socket_when_no_match() {
        let addr = SocketAddress::parse("127.0.0.1:0").unwrap();
        let result = reconcile(&[addr], &[]).unwrap();
        assert_eq!(result.len(), 1);
        assert!(result[0].socket_fd >= 0);
        unsafe {
            libc::close(result[0].socket_fd);
        }
    }
}
