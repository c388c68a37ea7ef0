//! Reaching the namespace-facing side of a mapping

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;

use tokio::net::{TcpStream, UdpSocket};

use rootgate_core::{Error, Protocol, Result};

use super::scm::{STATUS_OK, recv_fd};

/// One request to the in-namespace helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialRequest {
    /// Protocol of the socket to open
    pub proto: Protocol,
    /// Namespace-side address to connect it to
    pub addr: SocketAddr,
}

/// Opens connections to addresses inside the child's network namespace
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect a TCP stream to `addr`
    ///
    /// # Errors
    /// Returns error if the target is unreachable
    async fn dial_tcp(&self, addr: SocketAddr) -> Result<TcpStream>;

    /// Open a UDP socket connected to `addr`
    ///
    /// # Errors
    /// Returns error if no socket can be opened
    async fn dial_udp(&self, addr: SocketAddr) -> Result<UdpSocket>;
}

/// Dials through the helper process listening on `builtin.sock`
#[derive(Debug, Clone)]
pub struct HelperDialer {
    socket: PathBuf,
}

impl HelperDialer {
    /// Dialer talking to the helper at `socket`
    #[must_use]
    pub const fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    async fn request(&self, req: DialRequest) -> Result<OwnedFd> {
        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || -> Result<OwnedFd> {
            let mut conn = StdUnixStream::connect(&socket)?;
            let mut line = serde_json::to_vec(&req)?;
            line.push(b'\n');
            conn.write_all(&line)?;

            match recv_fd(conn.as_raw_fd())? {
                (STATUS_OK, Some(fd)) => Ok(fd),
                _ => {
                    let mut reason = String::new();
                    let _ = conn.read_to_string(&mut reason);
                    Err(Error::Port {
                        driver: "builtin",
                        message: format!("helper cannot dial {} {}: {reason}", req.proto, req.addr),
                    })
                }
            }
        })
        .await?
    }
}

#[async_trait]
impl Dialer for HelperDialer {
    async fn dial_tcp(&self, addr: SocketAddr) -> Result<TcpStream> {
        let fd = self
            .request(DialRequest {
                proto: Protocol::Tcp,
                addr,
            })
            .await?;
        let stream = std::net::TcpStream::from(fd);
        stream.set_nonblocking(true)?;
        Ok(TcpStream::from_std(stream)?)
    }

    async fn dial_udp(&self, addr: SocketAddr) -> Result<UdpSocket> {
        let fd = self
            .request(DialRequest {
                proto: Protocol::Udp,
                addr,
            })
            .await?;
        let socket = std::net::UdpSocket::from(fd);
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket)?)
    }
}

/// Dials from the current network namespace
///
/// For tests, and for sessions whose target shares the host network.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial_tcp(&self, addr: SocketAddr) -> Result<TcpStream> {
        Ok(TcpStream::connect(addr).await?)
    }

    async fn dial_udp(&self, addr: SocketAddr) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(unspecified(addr)).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }
}

/// Wildcard address of the same family as `addr`, port 0
pub(crate) fn unspecified(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = DialRequest {
            proto: Protocol::Udp,
            addr: "127.0.0.1:53".parse().unwrap(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"proto":"udp","addr":"127.0.0.1:53"}"#);
    }

    #[tokio::test]
    async fn test_direct_dialer_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(DirectDialer.dial_tcp(addr), listener.accept());
        assert_eq!(
            dialed.unwrap().local_addr().unwrap(),
            accepted.unwrap().1
        );
    }

    #[tokio::test]
    async fn test_helper_dialer_without_helper() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = HelperDialer::new(dir.path().join("builtin.sock"));
        let err = dialer
            .dial_tcp("127.0.0.1:80".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
