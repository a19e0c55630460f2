//! Socket inheritance: recovers listening sockets passed in via the
//! environment, under either of two schemes. Grounded on
//! `nxt_runtime_inherited_listen_sockets` /
//! `nxt_runtime_systemd_listen_sockets`.

use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use nix::sys::socket::{getsockname, getsockopt, sockopt, SockaddrStorage, UnixAddr};
use tracing::{error, info};

use crate::address::SocketAddress;

/// A listening socket, either inherited or freshly created by the
/// reconciler (C8).
#[derive(Debug, Clone)]
pub struct ListenSocket {
    pub sockaddr: SocketAddress,
    pub socket_fd: RawFd,
    pub backlog: i32,
    /// True when the socket is non-blocking and should be registered with
    /// the event engine once enabled.
    pub non_blocking: bool,
    /// True for `SOCK_STREAM`. Scheme A reads this from `SO_TYPE`; scheme B
    /// assumes it unconditionally, per §4.2.
    pub stream: bool,
}

/// Default listen backlog, matching `NXT_LISTEN_BACKLOG` in the original.
pub const LISTEN_BACKLOG: i32 = 511;

/// Environment variable names read by the two inheritance schemes. Only
/// ever read, never written by this crate (per §6).
const ENV_NGINX: &str = "NGINX";
const ENV_LISTEN_FDS: &str = "LISTEN_FDS";
const ENV_LISTEN_PID: &str = "LISTEN_PID";

/// Attempts both inheritance schemes in order, returning the sockets
/// recovered or `None` if neither scheme yields anything (a fresh start).
pub fn recover_inherited_sockets(pid: i32) -> Option<Vec<ListenSocket>> {
    if let Ok(value) = std::env::var(ENV_NGINX) {
        return recover_legacy(&value);
    }

    recover_systemd(pid)
}

/// Scheme A (legacy): `NGINX=fd;fd;fd;` semicolon-separated descriptors.
/// A malformed token aborts parsing of the remainder but keeps whatever was
/// already recovered, per §4.2 and §7.
fn recover_legacy(value: &str) -> Option<Vec<ListenSocket>> {
    info!(value, "using inherited listen sockets");

    let mut sockets = Vec::new();

    for token in value.split(';') {
        if token.is_empty() {
            continue;
        }

        let fd: RawFd = match token.parse() {
            Ok(fd) => fd,
            Err(_) => {
                error!(
                    value,
                    token, "invalid socket number in NGINX environment variable, ignoring the rest of the variable"
                );
                break;
            }
        };

        match recover_one(fd, true) {
            Some(ls) => sockets.push(ls),
            None => break,
        }
    }

    Some(sockets)
}

/// Scheme B (systemd): `LISTEN_FDS`/`LISTEN_PID`. A mismatch, a
/// non-integer count, or missing variables are all "no inherited sockets",
/// not an error. Uses the corrected `[3, 3+n)` range (§9 Open Question #1 —
/// the literal C source iterates `3..n`, which is treated here as a bug and
/// not reproduced).
fn recover_systemd(pid: i32) -> Option<Vec<ListenSocket>> {
    let nfds = std::env::var(ENV_LISTEN_FDS).ok()?;
    let listen_pid = std::env::var(ENV_LISTEN_PID).ok()?;

    let n: i32 = nfds.parse().ok()?;
    let listen_pid: i32 = listen_pid.parse().ok()?;

    if listen_pid != pid {
        return None;
    }

    info!(count = n, "using systemd listen sockets");

    const SD_LISTEN_FDS_START: RawFd = 3;
    let mut sockets = Vec::with_capacity(n.max(0) as usize);

    for fd in SD_LISTEN_FDS_START..(SD_LISTEN_FDS_START + n) {
        // Scheme B assumes STREAM regardless of SO_TYPE, unlike scheme A.
        match recover_one(fd, false) {
            Some(ls) => sockets.push(ls),
            None => return None,
        }
    }

    Some(sockets)
}

/// Recovers a single socket's address via `getsockname`. When
/// `query_type` is set, the type is read from `getsockopt(SO_TYPE)`
/// (scheme A); otherwise it is assumed `SOCK_STREAM` (scheme B).
fn recover_one(fd: RawFd, query_type: bool) -> Option<ListenSocket> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

    let storage: SockaddrStorage = match getsockname(fd) {
        Ok(addr) => addr,
        Err(e) => {
            error!(fd, error = %e, "getsockname failed for inherited socket");
            return None;
        }
    };

    let sockaddr = match storage_to_address(&storage) {
        Some(addr) => addr,
        None => {
            error!(fd, "inherited socket has an unsupported address family");
            return None;
        }
    };

    let stream = if query_type {
        match getsockopt(&borrowed, sockopt::SockType) {
            Ok(ty) => ty == nix::sys::socket::SockType::Stream,
            Err(e) => {
                error!(fd, error = %e, "getsockopt(SO_TYPE) failed for inherited socket");
                return None;
            }
        }
    } else {
        true
    };

    Some(ListenSocket {
        sockaddr,
        socket_fd: fd,
        backlog: LISTEN_BACKLOG,
        non_blocking: true,
        stream,
    })
}

/// Recovers a `SocketAddress` from whatever family `getsockname` reported,
/// so inherited Unix-domain listeners round-trip the same way inherited
/// Inet ones do.
fn storage_to_address(storage: &SockaddrStorage) -> Option<SocketAddress> {
    if let Some(v4) = storage.as_sockaddr_in() {
        let addr = SocketAddr::V4(std::net::SocketAddrV4::new(v4.ip(), v4.port()));
        return Some(SocketAddress::Inet(addr));
    }
    if let Some(v6) = storage.as_sockaddr_in6() {
        let addr = SocketAddr::V6(std::net::SocketAddrV6::new(v6.ip(), v6.port(), 0, 0));
        return Some(SocketAddress::Inet(addr));
    }
    if let Some(unix) = storage.as_unix_addr() {
        return unix_addr_to_socket_address(unix);
    }
    None
}

/// Builds a `SocketAddress::Unix` from a `nix` `UnixAddr`, mirroring the
/// framing `SocketAddress::parse` applies to `unix:` literals so inherited
/// and freshly-parsed Unix sockets compare equal.
fn unix_addr_to_socket_address(unix: &UnixAddr) -> Option<SocketAddress> {
    if let Some(path) = unix.path() {
        let path_bytes = path.as_os_str().as_bytes().to_vec();
        let socklen = path_bytes.len() + 1;
        let text = format!("unix:{}", path.display());
        return Some(SocketAddress::Unix {
            path: path_bytes,
            abstract_name: false,
            socklen,
            text,
        });
    }

    if let Some(name) = unix.as_abstract() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(name);
        let socklen = bytes.len();
        let text = format!("unix:@{}", String::from_utf8_lossy(name));
        return Some(SocketAddress::Unix {
            path: bytes,
            abstract_name: true,
            socklen,
            text,
        });
    }

    // Unnamed (unbound) unix socket; not a valid listening address.
    None
}
