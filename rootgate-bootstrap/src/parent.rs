//! Coordinator: the parent role
//!
//! Launches the child, drives the handshake, owns the network and port
//! drivers for the lifetime of the session and propagates the target's
//! exit code. Every wait during setup is raced against the child exiting,
//! cancellation and incoming signals, which are forwarded to the child.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::sys::signal::{Signal as NixSignal, kill};
use tokio::process::{Child, Command};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rootgate_core::channel::{self, CONTROL_FD, CONTROL_FD_ENV, ChannelReader, ChannelWriter};
use rootgate_core::process::{exit_code, kill_with_parent, pass_fd_as};
use rootgate_core::state::{API_SOCKET, STATE_DIR_ENV};
use rootgate_core::{
    ControlMessage, Error, PortMessage, ProcessId, Result, SessionEvent, StateDir,
};
use rootgate_namespace::{NamespaceManager, idmap};
use rootgate_network::{NetworkParentDriver, ParentContext};
use rootgate_port::{ApiServer, PortContext, PortDriverKind, PortParentDriver};

use crate::options::ParentOptions;

/// How long frames still buffered after the child exited are awaited
const LATE_FRAME_WAIT: Duration = Duration::from_secs(1);

/// How far the handshake got
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    #[default]
    Launched,
    NamespacesReady,
    Configured,
    Running,
}

/// Backends owned by the session, torn down in reverse start order
#[derive(Default)]
struct Drivers {
    network: Option<Box<dyn NetworkParentDriver>>,
    port: Option<Arc<dyn PortParentDriver>>,
    api: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Drivers {
    async fn teardown(&mut self) {
        if let Some((cancel, task)) = self.api.take() {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "Port control socket task failed");
            }
        }
        if let Some(port) = self.port.take() {
            if let Err(e) = port.stop().await {
                warn!(driver = port.name(), error = %e, "Cannot stop port driver");
            }
        }
        if let Some(mut network) = self.network.take() {
            if let Err(e) = network.stop().await {
                warn!(driver = network.name(), error = %e, "Cannot stop network driver");
            }
        }
    }
}

/// SIGINT and SIGTERM, forwarded to the child
struct Signals {
    interrupt: Signal,
    terminate: Signal,
}

impl Signals {
    fn new() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> NixSignal {
        tokio::select! {
            Some(()) = self.interrupt.recv() => NixSignal::SIGINT,
            Some(()) = self.terminate.recv() => NixSignal::SIGTERM,
            else => std::future::pending().await,
        }
    }
}

fn forward(pid: ProcessId, signal: NixSignal) {
    info!(child_pid = %pid, signal = %signal, "Forwarding signal to child");
    if let Err(e) = kill(pid.as_nix_pid(), signal) {
        debug!(child_pid = %pid, error = %e, "Cannot forward signal");
    }
}

enum SetupEnd {
    Done(Result<()>),
    ChildExited(ExitStatus),
}

/// Parent-side session runner
#[derive(Debug, Clone, Copy)]
pub struct Coordinator;

impl Coordinator {
    /// Run a whole session and return the exit code to report
    ///
    /// Options are validated and backend binaries resolved before anything
    /// is launched. Whatever was started is stopped again before this
    /// returns, on success and on failure alike.
    ///
    /// # Errors
    /// Returns error if the session cannot be set up, the child reports a
    /// setup failure, or `cancel` fires
    pub async fn run(options: ParentOptions, cancel: CancellationToken) -> Result<i32> {
        let session = &options.session;
        session.validate()?;
        if session.port_driver == PortDriverKind::Builtin {
            warn!("port driver builtin is experimental");
        }

        let mut drivers = Drivers {
            network: session.network_options().parent_driver()?,
            port: session.port_driver.parent_driver()?,
            api: None,
        };

        let mut state = StateDir::open(options.state_dir.as_deref())?;
        state.lock()?;

        let result = Self::session(&options, &state, &mut drivers, &cancel).await;

        drivers.teardown().await;
        if let Err(e) = &result {
            SessionEvent::Error {
                message: e.to_string(),
                timestamp: SystemTime::now(),
            }
            .emit_trace();
        }
        if let Err(e) = state.cleanup() {
            warn!(error = %e, "Cannot clean up state directory");
        }
        result
    }

    async fn session(
        options: &ParentOptions,
        state: &StateDir,
        drivers: &mut Drivers,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let mut signals = Signals::new()?;
        let (channel, child_end) = channel::pair()?;
        let mut child = Self::spawn(options, state, &child_end)?;
        drop(child_end);

        let Some(raw_pid) = child.id() else {
            return Err(Error::desync("child exited before it could be tracked"));
        };
        #[allow(clippy::cast_possible_wrap)]
        let pid = ProcessId::from_raw(raw_pid as i32);
        state.write_child_pid(pid)?;
        info!(child_pid = %pid, state_dir = %state.path().display(), "Child started");
        SessionEvent::ChildStarted {
            pid,
            timestamp: SystemTime::now(),
        }
        .emit_trace();

        let (mut reader, mut writer) = channel.into_split();
        let mut phase = Phase::Launched;

        let end = {
            let setup = Setup {
                options,
                state,
                pid,
                cancel,
            };
            let setup = setup.run(&mut reader, &mut writer, drivers, &mut phase);
            tokio::pin!(setup);
            loop {
                tokio::select! {
                    result = &mut setup => break SetupEnd::Done(result),
                    status = child.wait() => break SetupEnd::ChildExited(status?),
                    signal = signals.recv() => forward(pid, signal),
                    () = cancel.cancelled() => break SetupEnd::Done(Err(Error::Cancelled)),
                }
            }
        };

        match end {
            SetupEnd::Done(Ok(())) => {}
            SetupEnd::Done(Err(e)) => {
                Self::kill(&mut child, pid).await;
                return Err(e);
            }
            SetupEnd::ChildExited(status) => {
                let failure = Self::late_failure(&mut reader).await;
                return Self::conclude(pid, status, failure, phase);
            }
        }

        info!(child_pid = %pid, "Session running");
        let mut failure = None;
        let mut open = true;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                frame = reader.recv(), if open => match frame {
                    Ok(Some(msg @ (ControlMessage::Failure { .. } | ControlMessage::ExecFailed { .. }))) => {
                        failure = Some(msg);
                    }
                    Ok(Some(other)) => warn!(message = other.name(), "Unexpected control frame"),
                    Ok(None) => {
                        debug!("Control channel closed by child");
                        open = false;
                    }
                    Err(e) => {
                        warn!(error = %e, "Control channel failed");
                        open = false;
                    }
                },
                signal = signals.recv() => forward(pid, signal),
                () = cancel.cancelled() => {
                    Self::kill(&mut child, pid).await;
                    return Err(Error::Cancelled);
                }
            }
        };

        if open && failure.is_none() {
            failure = Self::late_failure(&mut reader).await;
        }
        Self::conclude(pid, status, failure, phase)
    }

    fn spawn(options: &ParentOptions, state: &StateDir, child_end: &OwnedFd) -> Result<Child> {
        let launch = &options.child;
        debug!(program = %launch.program.display(), args = ?launch.args, "Launching child");

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .env(CONTROL_FD_ENV, CONTROL_FD.to_string())
            .env(STATE_DIR_ENV, state.path())
            .kill_on_drop(true);
        pass_fd_as(&mut cmd, child_end.as_raw_fd(), CONTROL_FD);
        kill_with_parent(&mut cmd);

        cmd.spawn().map_err(|e| Error::Namespace {
            message: format!("cannot launch {}: {e}", launch.program.display()),
        })
    }

    async fn kill(child: &mut Child, pid: ProcessId) {
        debug!(child_pid = %pid, "Killing child");
        if let Err(e) = child.kill().await {
            debug!(child_pid = %pid, error = %e, "Child already gone");
        }
    }

    /// A failure report the child sent right before exiting
    async fn late_failure(reader: &mut ChannelReader) -> Option<ControlMessage> {
        let drain = async {
            loop {
                match reader.recv().await {
                    Ok(Some(
                        msg @ (ControlMessage::Failure { .. } | ControlMessage::ExecFailed { .. }),
                    )) => return Some(msg),
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => return None,
                }
            }
        };
        tokio::time::timeout(LATE_FRAME_WAIT, drain)
            .await
            .ok()
            .flatten()
    }

    fn conclude(
        pid: ProcessId,
        status: ExitStatus,
        failure: Option<ControlMessage>,
        phase: Phase,
    ) -> Result<i32> {
        let code = exit_code(status);
        info!(child_pid = %pid, exit_code = code, "Child exited");
        SessionEvent::ChildExited {
            pid,
            exit_code: code,
            timestamp: SystemTime::now(),
        }
        .emit_trace();

        match failure {
            Some(ControlMessage::Failure { message }) => Err(Error::ChildSetupFailed { message }),
            Some(ControlMessage::ExecFailed { message, code }) => {
                // Already reported by the child on its own stderr
                debug!(message = %message, code, "Target could not be executed");
                Ok(code)
            }
            _ if phase < Phase::Configured => Err(Error::desync(format!(
                "child exited with code {code} during the handshake"
            ))),
            _ => Ok(code),
        }
    }
}

/// The handshake up to a running target
struct Setup<'a> {
    options: &'a ParentOptions,
    state: &'a StateDir,
    pid: ProcessId,
    cancel: &'a CancellationToken,
}

impl Setup<'_> {
    async fn run(
        &self,
        reader: &mut ChannelReader,
        writer: &mut ChannelWriter,
        drivers: &mut Drivers,
        phase: &mut Phase,
    ) -> Result<()> {
        match reader.recv().await? {
            Some(ControlMessage::NamespacesReady) => {}
            Some(ControlMessage::Failure { message }) => {
                return Err(Error::ChildSetupFailed { message });
            }
            Some(other) => {
                return Err(Error::desync(format!(
                    "expected namespaces_ready, got {}",
                    other.name()
                )));
            }
            None => {
                return Err(Error::desync(
                    "child closed the control channel before namespaces_ready",
                ));
            }
        }
        *phase = Phase::NamespacesReady;
        SessionEvent::NamespacesReady {
            pid: self.pid,
            timestamp: SystemTime::now(),
        }
        .emit_trace();
        if tracing::enabled!(tracing::Level::DEBUG) {
            match unshared_namespaces(self.pid) {
                Ok(unshared) => debug!(child_pid = %self.pid, ?unshared, "Child namespaces"),
                Err(e) => debug!(child_pid = %self.pid, error = %e, "Cannot inspect child namespaces"),
            }
        }

        let session = &self.options.session;
        if session.namespaces().needs_user() {
            idmap::install(self.pid, session.id_map).await?;
        }

        let state_dir = self.state.path().to_path_buf();
        let network = match drivers.network.as_mut() {
            Some(driver) => {
                let ctx = ParentContext {
                    child_pid: self.pid,
                    state_dir: state_dir.clone(),
                    cancel: self.cancel.clone(),
                };
                let msg = driver.start(&ctx).await?;
                info!(
                    driver = driver.name(),
                    dev = %msg.dev,
                    ip = %msg.ip,
                    mtu = msg.mtu,
                    "Network attached"
                );
                SessionEvent::NetworkAttached {
                    driver: driver.name().to_string(),
                    dev: msg.dev.clone(),
                    timestamp: SystemTime::now(),
                }
                .emit_trace();
                Some(msg)
            }
            None => None,
        };

        let port_ctx = PortContext {
            child_pid: self.pid,
            state_dir: state_dir.clone(),
            network: network.clone(),
            cancel: self.cancel.clone(),
        };
        let port = drivers.port.clone();
        let port_msg = match &port {
            Some(driver) => driver.opaque_for_child(&port_ctx)?,
            None => PortMessage::default(),
        };

        writer
            .send(&ControlMessage::Configure {
                network,
                port: port_msg,
                state_dir,
            })
            .await?;
        *phase = Phase::Configured;

        if let Some(driver) = port {
            driver.start(&port_ctx).await?;
            for spec in &session.publish {
                let status = driver.add_port(*spec).await?;
                SessionEvent::PortAdded {
                    id: status.id,
                    spec: status.spec,
                    timestamp: SystemTime::now(),
                }
                .emit_trace();
            }

            let server = ApiServer::bind(self.state.join(API_SOCKET))?;
            info!(
                driver = driver.name(),
                socket = %server.path().display(),
                "Port driver ready"
            );
            let api_cancel = self.cancel.child_token();
            let task = tokio::spawn(server.serve(driver, api_cancel.clone()));
            drivers.api = Some((api_cancel, task));
        }

        *phase = Phase::Running;
        Ok(())
    }
}

/// Namespaces `pid` no longer shares with this process
fn unshared_namespaces(pid: ProcessId) -> Result<Vec<&'static str>> {
    let own = NamespaceManager::current_namespaces()?;
    let child = NamespaceManager::namespaces_for_pid(pid)?;
    Ok(child.differing(&own))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_namespaces_are_shared() {
        assert!(unshared_namespaces(ProcessId::current()).unwrap().is_empty());
        assert!(unshared_namespaces(ProcessId::from_raw(i32::MAX)).is_err());
    }
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_exit_code_passes_through() {
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(
            Coordinator::conclude(ProcessId::from_raw(1), status, None, Phase::Running).unwrap(),
            3
        );
    }

    #[test]
    fn test_exit_during_handshake_is_desync() {
        let status = ExitStatus::from_raw(0);
        let err = Coordinator::conclude(
            ProcessId::from_raw(1),
            status,
            None,
            Phase::NamespacesReady,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Desync { .. }));
    }

    #[test]
    fn test_reported_failures_win() {
        let status = ExitStatus::from_raw(125 << 8);
        let failure = ControlMessage::Failure {
            message: "cannot configure tap0".into(),
        };
        let err = Coordinator::conclude(
            ProcessId::from_raw(1),
            status,
            Some(failure),
            Phase::Configured,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tap0"));

        let exec = ControlMessage::ExecFailed {
            message: "cannot execute nope".into(),
            code: 127,
        };
        let status = ExitStatus::from_raw(127 << 8);
        assert_eq!(
            Coordinator::conclude(ProcessId::from_raw(1), status, Some(exec), Phase::Running)
                .unwrap(),
            127
        );
    }

    #[test]
    fn test_phase_order() {
        assert!(Phase::Launched < Phase::NamespacesReady);
        assert!(Phase::Configured < Phase::Running);
    }
}
