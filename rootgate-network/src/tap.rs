//! TAP devices inside the child's network namespace
//!
//! Uses the standard `/dev/net/tun` interface and the `TUNSETIFF` ioctl.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use rootgate_core::{Error, Result};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct Ifreq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

/// An open TAP device
#[derive(Debug)]
pub struct Tap {
    fd: OwnedFd,
    name: String,
}

impl Tap {
    /// Create (or attach to) the TAP device `name`
    ///
    /// # Errors
    /// Returns error if `/dev/net/tun` cannot be opened or the ioctl fails
    #[allow(clippy::cast_possible_wrap)]
    pub fn open(name: &str) -> Result<Self> {
        let failed = |what: &str| Error::Network {
            driver: "tap",
            message: format!("{what} for {name}: {}", io::Error::last_os_error()),
        };

        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(Error::Network {
                driver: "tap",
                message: format!("invalid interface name {name:?}"),
            });
        }

        // SAFETY: plain open(2) with a static path
        let raw = unsafe { libc::open(c"/dev/net/tun".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if raw < 0 {
            return Err(failed("cannot open /dev/net/tun"));
        }
        // SAFETY: raw is a freshly opened descriptor we own
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr = Ifreq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _padding: [0; 22],
        };
        for (dst, &src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = src as libc::c_char;
        }

        // SAFETY: ifr is a properly sized ifreq for TUNSETIFF
        if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &raw mut ifr) } < 0 {
            return Err(failed("TUNSETIFF failed"));
        }

        tracing::debug!(dev = name, "TAP device opened");
        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    /// Interface name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Turn into a file for frame-sized reads and writes
    #[must_use]
    pub fn into_file(self) -> File {
        File::from(self.fd)
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
