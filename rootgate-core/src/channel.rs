//! Parent/child control channel
//!
//! The channel is an `AF_UNIX` stream socketpair created by the coordinator
//! before the child is launched. Frames are single-line JSON documents
//! terminated by `\n`. The parent side is async (tokio), the child side is
//! blocking because the child role never runs an executor.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::message::ControlMessage;
use crate::{Error, Result};

/// Environment variable carrying the child's end of the channel
pub const CONTROL_FD_ENV: &str = "_ROOTGATE_CONTROL_FD";

/// Descriptor number the child end is installed at
pub const CONTROL_FD: RawFd = 3;

fn encode(msg: &ControlMessage) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(msg)?;
    frame.push(b'\n');
    Ok(frame)
}

fn decode(line: &str) -> Result<ControlMessage> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| Error::handshake(format!("malformed control frame: {e}")))
}

/// Create the channel; returns the parent end and the descriptor for the child
///
/// # Errors
/// Returns error if the socketpair cannot be created
pub fn pair() -> Result<(ParentChannel, OwnedFd)> {
    let (parent, child) = StdUnixStream::pair()?;
    parent.set_nonblocking(true)?;
    let parent = UnixStream::from_std(parent)?;
    Ok((ParentChannel::new(parent), OwnedFd::from(child)))
}

/// Parent end of the control channel
#[derive(Debug)]
pub struct ParentChannel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl ParentChannel {
    /// Wrap a connected stream
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: ChannelReader {
                inner: AsyncBufReader::new(read),
                line: String::new(),
            },
            writer: ChannelWriter { inner: write },
        }
    }

    /// Receive the next frame; `None` once the child closed its end
    ///
    /// # Errors
    /// Returns error on I/O failure or a malformed frame
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>> {
        self.reader.recv().await
    }

    /// Send one frame
    ///
    /// # Errors
    /// Returns a desync error if the child end is gone
    pub async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        self.writer.send(msg).await
    }

    /// Split into independently owned halves
    #[must_use]
    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of [`ParentChannel`]
#[derive(Debug)]
pub struct ChannelReader {
    inner: AsyncBufReader<OwnedReadHalf>,
    line: String,
}

impl ChannelReader {
    /// Receive the next frame; `None` once the child closed its end
    ///
    /// # Errors
    /// Returns error on I/O failure or a malformed frame
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            if self.line.trim().is_empty() {
                continue;
            }
            let msg = decode(&self.line)?;
            tracing::debug!(message = msg.name(), "Received control frame");
            return Ok(Some(msg));
        }
    }
}

/// Sending half of [`ParentChannel`]
#[derive(Debug)]
pub struct ChannelWriter {
    inner: OwnedWriteHalf,
}

impl ChannelWriter {
    /// Send one frame
    ///
    /// # Errors
    /// Returns a desync error if the child end is gone
    pub async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        let frame = encode(msg)?;
        tracing::debug!(message = msg.name(), "Sending control frame");
        self.inner.write_all(&frame).await.map_err(|e| {
            Error::desync(format!("cannot send {} to child: {e}", msg.name()))
        })?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Child end of the control channel
#[derive(Debug)]
pub struct ChildChannel {
    reader: BufReader<StdUnixStream>,
    writer: StdUnixStream,
}

impl ChildChannel {
    /// Adopt the inherited descriptor
    ///
    /// The descriptor is marked close-on-exec so exec'ing the target closes
    /// the channel and the parent observes EOF.
    ///
    /// # Safety
    /// `fd` must be owned by nothing else in this process.
    ///
    /// # Errors
    /// Returns a handshake error if `fd` is not an open socket, in which case
    /// it is left alone. Other errors if it cannot be duplicated or flagged.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        check_socket(fd)?;
        // SAFETY: ownership is transferred by the caller
        let stream = unsafe { StdUnixStream::from_raw_fd(fd) };
        set_cloexec(fd)?;
        Self::from_stream(stream)
    }

    /// Wrap a connected stream
    ///
    /// # Errors
    /// Returns error if the stream cannot be duplicated
    pub fn from_stream(stream: StdUnixStream) -> Result<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
        })
    }

    /// Block until the next frame arrives
    ///
    /// # Errors
    /// Returns a desync error if the parent closed its end
    pub fn recv(&mut self, expecting: &str) -> Result<ControlMessage> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(Error::desync(format!(
                    "parent closed the control channel while child waited for {expecting}"
                )));
            }
            if !line.trim().is_empty() {
                return decode(&line);
            }
        }
    }

    /// Send one frame
    ///
    /// # Errors
    /// Returns a desync error if the parent end is gone
    pub fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        let frame = encode(msg)?;
        self.writer
            .write_all(&frame)
            .map_err(|e| Error::desync(format!("cannot send {} to parent: {e}", msg.name())))
    }
}

/// Refuse descriptors that are closed or not sockets before taking them over
fn check_socket(fd: RawFd) -> Result<()> {
    // SAFETY: F_GETFD only inspects the descriptor table
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(Error::handshake(format!(
            "control descriptor {fd} is not open: {}",
            std::io::Error::last_os_error()
        )));
    }
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat fills `stat` when it succeeds
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: initialized by the successful fstat above
    let mode = unsafe { stat.assume_init() }.st_mode;
    if mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(Error::handshake(format!(
            "control descriptor {fd} is not a socket"
        )));
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: plain fcntl on a descriptor we own
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
