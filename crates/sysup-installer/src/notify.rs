// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Service manager notifications over `$NOTIFY_SOCKET`

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixDatagram;

const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";

/// Send a raw state string. Returns `Ok(false)` when not running under a
/// service manager.
pub fn notify(state: &str) -> io::Result<bool> {
    let Some(socket) = std::env::var_os(NOTIFY_SOCKET).filter(|s| !s.is_empty()) else {
        return Ok(false);
    };
    send(&socket, state)?;
    Ok(true)
}

pub fn notify_ready() -> io::Result<bool> {
    notify("READY=1")
}

pub fn notify_status(status: &str) -> io::Result<bool> {
    notify(&format!("STATUS={status}"))
}

pub fn notify_stopping() -> io::Result<bool> {
    notify("STOPPING=1")
}

fn send(socket: &OsStr, state: &str) -> io::Result<()> {
    let datagram = UnixDatagram::unbound()?;

    if let Some(name) = socket.as_bytes().strip_prefix(b"@") {
        return send_abstract(&datagram, name, state);
    }

    datagram.send_to(state.as_bytes(), socket)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn send_abstract(datagram: &UnixDatagram, name: &[u8], state: &str) -> io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    datagram.send_to_addr(state.as_bytes(), &addr)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_datagram: &UnixDatagram, _name: &[u8], _state: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract notify sockets are Linux only",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_send_to_path_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        send(path.as_os_str(), "READY=1").unwrap();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
    }

    #[test]
    fn test_send_to_missing_socket_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.sock");
        assert!(send(path.as_os_str(), "READY=1").is_err());
    }
}
