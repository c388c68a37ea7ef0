//! Host-side relays of the builtin driver

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rootgate_core::PortId;

use super::dialer::Dialer;

/// Time the second direction of a TCP relay gets once the first has closed
pub const HALF_CLOSE_GRACE: Duration = Duration::from_secs(10);

/// Inactivity after which a UDP flow is dropped
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_DATAGRAM: usize = 65535;

/// Shared by every relay of one driver
#[derive(Clone)]
pub struct RelayContext {
    /// Mapping the relay belongs to, for logs
    pub id: PortId,
    /// Namespace-side address
    pub target: SocketAddr,
    /// How to reach `target`
    pub dialer: Arc<dyn Dialer>,
    /// Cancelled when the driver stops; force-closes every relay
    pub session: CancellationToken,
    /// Tracks relays so the driver can wait for them
    pub tracker: TaskTracker,
}

/// Accept connections until `cancel` fires, relaying each one
///
/// Relays spawned here outlive the listener: they end on their own or when
/// the session token fires.
pub async fn accept_tcp(listener: TcpListener, ctx: RelayContext, cancel: CancellationToken) {
    loop {
        let (client, peer) = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(id = %ctx.id, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            },
        };

        let ctx = ctx.clone();
        ctx.tracker.clone().spawn(async move {
            let upstream = tokio::select! {
                dialed = ctx.dialer.dial_tcp(ctx.target) => match dialed {
                    Ok(upstream) => upstream,
                    Err(e) => {
                        tracing::debug!(id = %ctx.id, %peer, error = %e, "Cannot reach namespace side");
                        return;
                    }
                },
                () = ctx.session.cancelled() => return,
            };
            tracing::trace!(id = %ctx.id, %peer, target = %ctx.target, "Relaying connection");
            relay_tcp(client, upstream, &ctx.session).await;
            tracing::trace!(id = %ctx.id, %peer, "Connection closed");
        });
    }
    tracing::debug!(id = %ctx.id, "Listener closed");
}

/// Move bytes both ways until both directions are done
///
/// When one direction reaches EOF the other side's write half is shut
/// down, and the remaining direction has [`HALF_CLOSE_GRACE`] to finish.
pub async fn relay_tcp(client: TcpStream, upstream: TcpStream, session: &CancellationToken) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let to_child = async {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    };
    let to_host = async {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    };
    tokio::pin!(to_child, to_host);

    let relay = async {
        tokio::select! {
            copied = &mut to_child => {
                log_direction("to child", &copied);
                let _ = tokio::time::timeout(HALF_CLOSE_GRACE, &mut to_host).await;
            }
            copied = &mut to_host => {
                log_direction("to host", &copied);
                let _ = tokio::time::timeout(HALF_CLOSE_GRACE, &mut to_child).await;
            }
        }
    };

    tokio::select! {
        () = relay => {}
        () = session.cancelled() => {}
    }
}

fn log_direction(direction: &str, copied: &std::io::Result<u64>) {
    match copied {
        Ok(bytes) => tracing::trace!(direction, bytes, "Direction finished"),
        Err(e) => tracing::debug!(direction, error = %e, "Relay error"),
    }
}

/// Datagrams held per client while its namespace-side socket is opened
const MAX_PENDING: usize = 64;

enum Flow {
    Dialing(Vec<Vec<u8>>),
    Open {
        upstream: Arc<UdpSocket>,
        last_seen: Arc<Mutex<Instant>>,
    },
}

type Flows = Arc<Mutex<HashMap<SocketAddr, Flow>>>;

/// Relay datagrams until `cancel` fires
///
/// Each client address gets its own namespace-side socket so replies find
/// their way back. New flows are opened off the receive loop; datagrams
/// arriving meanwhile are queued. Flows end with the listener.
pub async fn serve_udp(socket: UdpSocket, ctx: RelayContext, cancel: CancellationToken) {
    let socket = Arc::new(socket);
    let flows: Flows = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, client) = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!(id = %ctx.id, error = %e, "Receive failed");
                    continue;
                }
            },
        };

        let upstream = {
            let mut table = lock(&flows);
            match table.get_mut(&client) {
                Some(Flow::Open {
                    upstream,
                    last_seen,
                }) => {
                    *lock(last_seen) = Instant::now();
                    Some(Arc::clone(upstream))
                }
                Some(Flow::Dialing(pending)) => {
                    if pending.len() < MAX_PENDING {
                        pending.push(buf[..n].to_vec());
                    }
                    None
                }
                None => {
                    table.insert(client, Flow::Dialing(vec![buf[..n].to_vec()]));
                    ctx.tracker.spawn(open_flow(
                        Arc::clone(&socket),
                        ctx.clone(),
                        client,
                        Arc::clone(&flows),
                        cancel.clone(),
                    ));
                    None
                }
            }
        };

        if let Some(upstream) = upstream
            && let Err(e) = upstream.send(&buf[..n]).await
        {
            tracing::debug!(id = %ctx.id, %client, error = %e, "Forwarding datagram failed");
        }
    }
    lock(&flows).clear();
    tracing::debug!(id = %ctx.id, "UDP listener closed");
}

/// Open the namespace side for `client`, flush what queued up, then relay
/// replies until the flow goes idle
async fn open_flow(
    socket: Arc<UdpSocket>,
    ctx: RelayContext,
    client: SocketAddr,
    flows: Flows,
    cancel: CancellationToken,
) {
    let dialed = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            lock(&flows).remove(&client);
            return;
        }
        dialed = ctx.dialer.dial_udp(ctx.target) => dialed,
    };
    let upstream = match dialed {
        Ok(upstream) => Arc::new(upstream),
        Err(e) => {
            tracing::debug!(id = %ctx.id, %client, error = %e, "Cannot open UDP flow");
            lock(&flows).remove(&client);
            return;
        }
    };

    let last_seen = Arc::new(Mutex::new(Instant::now()));
    let previous = lock(&flows).insert(
        client,
        Flow::Open {
            upstream: Arc::clone(&upstream),
            last_seen: Arc::clone(&last_seen),
        },
    );
    tracing::trace!(id = %ctx.id, %client, "UDP flow opened");

    if let Some(Flow::Dialing(pending)) = previous {
        for datagram in pending {
            if let Err(e) = upstream.send(&datagram).await {
                tracing::debug!(id = %ctx.id, %client, error = %e, "Forwarding datagram failed");
            }
        }
    }
    reply_flow(socket, upstream, client, last_seen, flows, cancel).await;
}

async fn reply_flow(
    socket: Arc<UdpSocket>,
    upstream: Arc<UdpSocket>,
    client: SocketAddr,
    last_seen: Arc<Mutex<Instant>>,
    flows: Flows,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let deadline = *lock(&last_seen) + UDP_IDLE_TIMEOUT;
        tokio::select! {
            () = cancel.cancelled() => return,
            received = upstream.recv(&mut buf) => match received {
                Ok(n) => {
                    *lock(&last_seen) = Instant::now();
                    if let Err(e) = socket.send_to(&buf[..n], client).await {
                        tracing::debug!(%client, error = %e, "Reply failed");
                    }
                }
                Err(e) => {
                    tracing::debug!(%client, error = %e, "Namespace side failed");
                    break;
                }
            },
            () = tokio::time::sleep_until(deadline) => {
                if lock(&last_seen).elapsed() >= UDP_IDLE_TIMEOUT {
                    break;
                }
            }
        }
    }
    lock(&flows).remove(&client);
    tracing::trace!(%client, "UDP flow closed");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
