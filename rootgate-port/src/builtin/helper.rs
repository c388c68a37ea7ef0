//! Dial helper running inside the child's namespaces
//!
//! The helper accepts one [`DialRequest`] per connection on `builtin.sock`,
//! connects to the requested address from inside the namespace and passes
//! the connected socket back. It lives as long as its connection to the
//! parent's readiness socket stays open.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

use rootgate_core::{Protocol, Result};

use super::dialer::{DialRequest, unspecified};
use super::scm::{STATUS_ERR, send_fd};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve dial requests until the parent goes away
///
/// # Errors
/// Returns error if the listener fails
pub fn serve(listener: UnixListener, parent: UnixStream) -> Result<()> {
    std::thread::spawn(move || {
        let mut parent = parent;
        let mut buf = [0u8; 1];
        // Anything but a blocked read means the parent is gone
        let _ = parent.read(&mut buf);
        tracing::debug!("Parent closed the readiness socket, helper exiting");
        std::process::exit(0);
    });

    for conn in listener.incoming() {
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Helper accept failed");
                continue;
            }
        };
        std::thread::spawn(move || {
            if let Err(e) = handle(conn) {
                tracing::debug!(error = %e, "Dial request failed");
            }
        });
    }
    Ok(())
}

fn handle(mut conn: UnixStream) -> Result<()> {
    let mut line = String::new();
    BufReader::new(&conn).read_line(&mut line)?;
    let req: DialRequest = serde_json::from_str(line.trim_end())?;

    match dial(req) {
        Ok(fd) => send_fd(conn.as_raw_fd(), fd.as_raw_fd())?,
        Err(e) => {
            conn.write_all(&[STATUS_ERR])?;
            conn.write_all(e.to_string().as_bytes())?;
        }
    }
    Ok(())
}

/// Open a socket connected to the request's address
pub fn dial(req: DialRequest) -> std::io::Result<OwnedFd> {
    match req.proto {
        Protocol::Tcp => {
            let stream = TcpStream::connect_timeout(&req.addr, DIAL_TIMEOUT)?;
            Ok(OwnedFd::from(stream))
        }
        Protocol::Udp => {
            let socket = UdpSocket::bind(unspecified(req.addr))?;
            socket.connect(req.addr)?;
            Ok(OwnedFd::from(socket))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::dialer::{Dialer, HelperDialer};
    use std::net::{SocketAddr, TcpListener};
    use std::path::{Path, PathBuf};

    // Request handling only; `serve` would exit the test process
    fn start_helper(dir: &Path) -> PathBuf {
        let socket = dir.join("builtin.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        std::thread::spawn(move || {
            for conn in listener.incoming() {
                let _ = handle(conn.unwrap());
            }
        });
        socket
    }

    #[tokio::test]
    async fn test_helper_dials_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let socket = start_helper(dir.path());

        let target = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = target.local_addr().unwrap();

        let stream = HelperDialer::new(socket).dial_tcp(addr).await.unwrap();
        let (_accepted, peer) = target.accept().unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_helper_dials_udp() {
        let dir = tempfile::tempdir().unwrap();
        let socket = start_helper(dir.path());

        let target = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr: SocketAddr = target.local_addr().unwrap();

        let socket = HelperDialer::new(socket).dial_udp(addr).await.unwrap();
        socket.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = target.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_helper_reports_refused() {
        let dir = tempfile::tempdir().unwrap();
        let socket = start_helper(dir.path());

        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let err = HelperDialer::new(socket).dial_tcp(addr).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("helper cannot dial"), "{message}");
    }
}
