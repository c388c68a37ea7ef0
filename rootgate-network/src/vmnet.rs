//! vpnkit vmnet protocol
//!
//! Connection setup is a fixed-size version exchange followed by an
//! `ethernet` command naming the interface by UUID. vpnkit answers with the
//! interface's MTU and MAC. Afterwards the stream carries ethernet frames,
//! each prefixed by its length as a little-endian `u16`.

use std::io::{self, Read, Write};
use std::net::Ipv4Addr;

use rootgate_core::{Error, Result};
use uuid::Uuid;

const MAGIC: &[u8; 5] = b"VMN3T";
const VERSION: u32 = 22;
const COMMIT: &[u8; 40] = b"0123456789012345678901234567890123456789";
const INIT_LEN: usize = 5 + 4 + 40;

const CMD_ETHERNET: u8 = 1;
const RESPONSE_VIF: u8 = 1;
const RESPONSE_DISCONNECT: u8 = 2;

/// Interface parameters returned by vpnkit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vif {
    /// MTU of the interface
    pub mtu: u16,
    /// Largest frame vpnkit accepts
    pub max_packet_size: u16,
    /// MAC address assigned to the interface
    pub mac: [u8; 6],
}

fn init_message() -> [u8; INIT_LEN] {
    let mut msg = [0u8; INIT_LEN];
    msg[..5].copy_from_slice(MAGIC);
    msg[5..9].copy_from_slice(&VERSION.to_le_bytes());
    msg[9..].copy_from_slice(COMMIT);
    msg
}

/// Negotiate an ethernet interface
///
/// # Errors
/// Returns a handshake error if vpnkit speaks another protocol or refuses
pub fn handshake<S: Read + Write>(stream: &mut S, uuid: &Uuid, ip: Ipv4Addr) -> Result<Vif> {
    stream.write_all(&init_message())?;

    let mut reply = [0u8; INIT_LEN];
    stream.read_exact(&mut reply)?;
    if &reply[..5] != MAGIC {
        return Err(Error::handshake("vpnkit: bad vmnet magic"));
    }
    let version = u32::from_le_bytes([reply[5], reply[6], reply[7], reply[8]]);
    tracing::trace!(version, "vmnet version");

    let mut command = Vec::with_capacity(1 + 36 + 4);
    command.push(CMD_ETHERNET);
    command.extend_from_slice(uuid.hyphenated().to_string().as_bytes());
    command.extend_from_slice(&ip.octets());
    stream.write_all(&command)?;

    let mut kind = [0u8; 1];
    stream.read_exact(&mut kind)?;
    match kind[0] {
        RESPONSE_VIF => {
            let mut vif = [0u8; 10];
            stream.read_exact(&mut vif)?;
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&vif[4..]);
            Ok(Vif {
                mtu: u16::from_le_bytes([vif[0], vif[1]]),
                max_packet_size: u16::from_le_bytes([vif[2], vif[3]]),
                mac,
            })
        }
        RESPONSE_DISCONNECT => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut reason = vec![0u8; usize::from(len[0])];
            stream.read_exact(&mut reason)?;
            Err(Error::handshake(format!(
                "vpnkit refused the interface: {}",
                String::from_utf8_lossy(&reason)
            )))
        }
        other => Err(Error::handshake(format!(
            "vpnkit: unexpected response type {other}"
        ))),
    }
}

/// Write one frame
///
/// # Errors
/// Returns error if the frame is larger than `u16::MAX` or the write fails
pub fn write_frame<W: Write>(w: &mut W, frame: &[u8]) -> io::Result<()> {
    let len = u16::try_from(frame.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    let mut buf = Vec::with_capacity(2 + frame.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(frame);
    w.write_all(&buf)
}

/// Read one frame into `buf`
///
/// # Errors
/// Returns error on EOF or a failed read
pub fn read_frame<R: Read>(r: &mut R, buf: &mut Vec<u8>) -> io::Result<()> {
    let mut len = [0u8; 2];
    r.read_exact(&mut len)?;
    buf.resize(usize::from(u16::from_le_bytes(len)), 0);
    r.read_exact(buf)
}

/// Format a MAC as `aa:bb:cc:dd:ee:ff`
#[must_use]
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse `aa:bb:cc:dd:ee:ff`
///
/// # Errors
/// Returns a handshake error for anything else
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let invalid = || Error::handshake(format!("invalid MAC address: {s}"));
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut mac {
        let part = parts.next().ok_or_else(invalid)?;
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn fake_vpnkit(mut peer: UnixStream, response: Vec<u8>) -> std::thread::JoinHandle<Vec<u8>> {
        std::thread::spawn(move || {
            let mut init = [0u8; INIT_LEN];
            peer.read_exact(&mut init).unwrap();
            peer.write_all(&init_message()).unwrap();
            let mut command = vec![0u8; 41];
            peer.read_exact(&mut command).unwrap();
            peer.write_all(&response).unwrap();
            command
        })
    }

    #[test]
    fn test_handshake_returns_vif() {
        let (mut ours, theirs) = UnixStream::pair().unwrap();
        let mut response = vec![RESPONSE_VIF];
        response.extend_from_slice(&1500u16.to_le_bytes());
        response.extend_from_slice(&1518u16.to_le_bytes());
        response.extend_from_slice(&[0x02, 0x50, 0x00, 0x00, 0x00, 0x01]);
        let server = fake_vpnkit(theirs, response);

        let uuid = Uuid::new_v4();
        let vif = handshake(&mut ours, &uuid, Ipv4Addr::new(192, 168, 65, 3)).unwrap();
        assert_eq!(vif.mtu, 1500);
        assert_eq!(vif.max_packet_size, 1518);
        assert_eq!(format_mac(&vif.mac), "02:50:00:00:00:01");

        let command = server.join().unwrap();
        assert_eq!(command[0], CMD_ETHERNET);
        assert_eq!(&command[1..37], uuid.hyphenated().to_string().as_bytes());
        assert_eq!(&command[37..], &[192, 168, 65, 3]);
    }

    #[test]
    fn test_handshake_disconnect() {
        let (mut ours, theirs) = UnixStream::pair().unwrap();
        let mut response = vec![RESPONSE_DISCONNECT, 4];
        response.extend_from_slice(b"busy");
        let _server = fake_vpnkit(theirs, response);

        let err = handshake(&mut ours, &Uuid::new_v4(), Ipv4Addr::LOCALHOST).unwrap_err();
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn test_bad_magic() {
        let (mut ours, mut theirs) = UnixStream::pair().unwrap();
        std::thread::spawn(move || {
            let mut init = [0u8; INIT_LEN];
            theirs.read_exact(&mut init).unwrap();
            theirs.write_all(&[b'X'; INIT_LEN]).unwrap();
        });
        let err = handshake(&mut ours, &Uuid::new_v4(), Ipv4Addr::LOCALHOST).unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[test]
    fn test_frames() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"abc").unwrap();
        assert_eq!(wire, vec![3, 0, b'a', b'b', b'c']);

        let mut buf = Vec::new();
        read_frame(&mut wire.as_slice(), &mut buf).unwrap();
        assert_eq!(buf, b"abc");

        assert!(write_frame(&mut Vec::new(), &vec![0u8; 70_000]).is_err());
    }

    #[test]
    fn test_mac_parsing() {
        assert_eq!(
            parse_mac("02:50:00:00:00:01").unwrap(),
            [0x02, 0x50, 0, 0, 0, 1]
        );
        assert!(parse_mac("02:50:00:00:00").is_err());
        assert!(parse_mac("02:50:00:00:00:01:ff").is_err());
        assert!(parse_mac("zz:50:00:00:00:01").is_err());
    }
}
