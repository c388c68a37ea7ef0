//! Initializer: the child role
//!
//! Runs straight from `main` with a single thread. No executor is started
//! in this role; `unshare(CLONE_NEWUSER)` refuses multithreaded callers and
//! the target replaces the process image anyway.

use std::fs;
use std::path::Path;

use nix::mount::{MsFlags, mount};
use tracing::{debug, info};

use rootgate_core::channel::CONTROL_FD_ENV;
use rootgate_core::state::{HOSTS, RESOLV_CONF};
use rootgate_core::{ChildChannel, ControlMessage, Error, NetworkMessage, Result};
use rootgate_namespace::copyup::check_state_dir;
use rootgate_namespace::{NamespaceManager, exec_target};
use rootgate_network::configure;

use crate::options::ChildOptions;

/// Child-side session runner
#[derive(Debug, Clone, Copy)]
pub struct Initializer;

impl Initializer {
    /// Adopt the control channel, set the namespaces up and exec the target
    ///
    /// Only returns on failure, which has already been reported to the
    /// coordinator when the channel allowed it. [`Error::exit_code`] gives
    /// the code to exit with.
    #[must_use]
    pub fn run(options: &ChildOptions) -> Error {
        // The target and anything it spawns must come up in the parent role.
        // SAFETY: this role is single-threaded, nothing reads the
        // environment concurrently
        unsafe { std::env::remove_var(CONTROL_FD_ENV) };

        // SAFETY: the coordinator installed this descriptor for us alone
        match unsafe { ChildChannel::from_raw_fd(options.control_fd) } {
            Ok(mut channel) => Self::run_with(options, &mut channel),
            Err(e) => e,
        }
    }

    /// [`Initializer::run`] over an adopted channel
    #[must_use]
    pub fn run_with(options: &ChildOptions, channel: &mut ChildChannel) -> Error {
        if let Err(e) = Self::prepare(options, channel) {
            let report = ControlMessage::Failure {
                message: e.to_string(),
            };
            if let Err(send) = channel.send(&report) {
                debug!(error = %send, "Cannot report failure to parent");
            }
            return e;
        }

        let failure = exec_target(&options.session.command);
        let report = ControlMessage::ExecFailed {
            message: failure.message.clone(),
            code: failure.code,
        };
        if let Err(send) = channel.send(&report) {
            debug!(error = %send, "Cannot report exec failure to parent");
        }
        Error::ExecFailed {
            message: failure.message,
            code: failure.code,
        }
    }

    fn prepare(options: &ChildOptions, channel: &mut ChildChannel) -> Result<()> {
        let session = &options.session;

        let mut namespaces = NamespaceManager::new(session.namespaces());
        namespaces.create()?;
        channel.send(&ControlMessage::NamespacesReady)?;

        let (network, port, state_dir) = match channel.recv("configure")? {
            ControlMessage::Configure {
                network,
                port,
                state_dir,
            } => (network, port, state_dir),
            other => {
                return Err(Error::desync(format!(
                    "expected configure, got {}",
                    other.name()
                )));
            }
        };
        namespaces.make_mounts_slave()?;

        if let Some(driver) = rootgate_network::child_driver(session.network.mode) {
            let msg = network
                .as_ref()
                .ok_or_else(|| Error::handshake("configure carries no network attachment"))?;
            driver.configure(msg)?;
            info!(
                dev = %msg.dev,
                ip = %msg.ip,
                prefix = msg.prefix,
                disable_host_loopback = msg.disable_host_loopback,
                "Network configured"
            );
        }

        if !session.copy_up.is_empty() {
            check_state_dir(&session.copy_up, &state_dir)?;
            let copied = session.copy_up_mode.driver().copy_up(&session.copy_up)?;
            debug!(paths = ?copied, mode = %session.copy_up_mode, "Copied up");
        }

        if let Some(msg) = &network {
            write_name_resolution(msg, session.copies_up_etc(), &state_dir)?;
        }

        if let Some(driver) = session.port_driver.child_driver() {
            driver.setup(&port)?;
        }
        Ok(())
    }
}

/// Point `resolv.conf` and `hosts` at the namespace's network
///
/// With `/etc` copied up the files are replaced in place. Otherwise they are
/// written to the state directory and bind-mounted over the originals,
/// which only affects this mount namespace.
fn write_name_resolution(msg: &NetworkMessage, etc_copied: bool, state_dir: &Path) -> Result<()> {
    let files = [
        (RESOLV_CONF, configure::resolv_conf(msg.dns)),
        (HOSTS, configure::hosts()),
    ];
    for (name, content) in files {
        let target = Path::new("/etc").join(name);
        if etc_copied {
            // The copied-up entry is a symlink into the original tree
            let _ = fs::remove_file(&target);
            fs::write(&target, content)?;
        } else {
            let source = state_dir.join(name);
            fs::write(&source, content)?;
            mount(
                Some(source.as_path()),
                target.as_path(),
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| Error::Namespace {
                message: format!(
                    "cannot bind-mount {} over {}: {e}",
                    source.display(),
                    target.display()
                ),
            })?;
        }
        debug!(file = %target.display(), "Name resolution written");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SessionOptions;
    use rootgate_core::PortMessage;
    use rootgate_port::PortDriverKind;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn options(session: SessionOptions) -> ChildOptions {
        ChildOptions {
            session,
            control_fd: 3,
        }
    }

    /// Plays the parent: answers namespaces_ready with `reply`, returns
    /// every frame the child sent
    fn parent(stream: UnixStream, reply: Option<ControlMessage>) -> thread::JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut frames = Vec::new();
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            frames.push(line.trim_end().to_string());
            if let Some(reply) = reply {
                let mut frame = serde_json::to_vec(&reply).unwrap();
                frame.push(b'\n');
                writer.write_all(&frame).unwrap();
            } else {
                writer.shutdown(std::net::Shutdown::Write).unwrap();
            }
            loop {
                line.clear();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                frames.push(line.trim_end().to_string());
            }
            frames
        })
    }

    fn configure() -> ControlMessage {
        ControlMessage::Configure {
            network: None,
            port: PortMessage::default(),
            state_dir: std::env::temp_dir(),
        }
    }

    #[test]
    fn test_host_session_prepares_without_namespaces() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let peer = parent(theirs, Some(configure()));

        let mut channel = ChildChannel::from_stream(ours).unwrap();
        let options = options(SessionOptions::new(vec!["true".into()]));
        Initializer::prepare(&options, &mut channel).unwrap();
        drop(channel);

        let frames = peer.join().unwrap();
        assert_eq!(frames, vec![r#"{"type":"namespaces_ready"}"#]);
    }

    #[test]
    fn test_parent_gone_is_desync() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let peer = parent(theirs, None);

        let mut channel = ChildChannel::from_stream(ours).unwrap();
        let options = options(SessionOptions::new(vec!["true".into()]));
        let err = Initializer::prepare(&options, &mut channel).unwrap_err();
        assert!(matches!(err, Error::Desync { .. }));
        drop(channel);
        peer.join().unwrap();
    }

    #[test]
    fn test_unexpected_frame_is_desync() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let peer = parent(theirs, Some(ControlMessage::NamespacesReady));

        let mut channel = ChildChannel::from_stream(ours).unwrap();
        let options = options(SessionOptions::new(vec!["true".into()]));
        let err = Initializer::prepare(&options, &mut channel).unwrap_err();
        assert!(err.to_string().contains("expected configure"));
        drop(channel);
        peer.join().unwrap();
    }

    #[test]
    fn test_setup_failure_is_reported() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let peer = parent(theirs, Some(configure()));

        // builtin without its opaque data cannot start the helper
        let session =
            SessionOptions::new(vec!["true".into()]).with_port_driver(PortDriverKind::Builtin);
        let mut channel = ChildChannel::from_stream(ours).unwrap();
        let err = Initializer::run_with(&options(session), &mut channel);
        assert!(matches!(err, Error::Handshake { .. }));
        assert_eq!(err.exit_code(), 125);
        drop(channel);

        let frames = peer.join().unwrap();
        assert_eq!(frames.len(), 2);
        let failure: ControlMessage = serde_json::from_str(&frames[1]).unwrap();
        match failure {
            ControlMessage::Failure { message } => assert!(message.contains("builtin.socket")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
