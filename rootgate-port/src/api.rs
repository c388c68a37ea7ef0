//! Port control socket
//!
//! `api.sock` in the state directory takes one newline-terminated JSON
//! request per connection and answers with one JSON line.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rootgate_core::{Error, PortId, PortSpec, PortStatus, Result, SessionEvent};

use crate::driver::PortParentDriver;

/// Longest request line the server reads
pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// A control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApiRequest {
    /// Expose a port
    Add {
        /// Mapping to add
        spec: PortSpec,
    },
    /// Withdraw a port
    Remove {
        /// Mapping id
        id: PortId,
    },
    /// List active mappings
    List,
}

/// A control response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Whether the request succeeded
    pub ok: bool,
    /// Added mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortStatus>,
    /// Active mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortStatus>>,
    /// Error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error kind: `conflict`, `not_found`, `invalid` or `internal`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ApiResponse {
    fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    fn failure(err: &Error) -> Self {
        Self {
            ok: false,
            error: Some(err.to_string()),
            kind: Some(err.kind().to_string()),
            ..Self::default()
        }
    }
}

/// Apply one request to a driver
pub async fn dispatch(driver: &dyn PortParentDriver, request: ApiRequest) -> ApiResponse {
    match request {
        ApiRequest::Add { spec } => match driver.add_port(spec).await {
            Ok(status) => {
                SessionEvent::PortAdded {
                    id: status.id,
                    spec: status.spec,
                    timestamp: std::time::SystemTime::now(),
                }
                .emit_trace();
                ApiResponse {
                    port: Some(status),
                    ..ApiResponse::success()
                }
            }
            Err(e) => ApiResponse::failure(&e),
        },
        ApiRequest::Remove { id } => match driver.remove_port(id).await {
            Ok(()) => {
                SessionEvent::PortRemoved {
                    id,
                    timestamp: std::time::SystemTime::now(),
                }
                .emit_trace();
                ApiResponse::success()
            }
            Err(e) => ApiResponse::failure(&e),
        },
        ApiRequest::List => ApiResponse {
            ports: Some(driver.list_ports().await),
            ..ApiResponse::success()
        },
    }
}

/// Listening control socket
pub struct ApiServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ApiServer {
    /// Bind the socket, replacing a stale one
    ///
    /// # Errors
    /// Returns error if the socket cannot be bound
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(|source| Error::Bind {
            addr: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Port control socket listening");
        Ok(Self { listener, path })
    }

    /// Socket path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve requests until `cancel` fires, then remove the socket
    ///
    /// Each connection is handled on its own task. Connections still
    /// waiting for their request are dropped on cancel; requests already
    /// dispatched finish before this returns.
    pub async fn serve(self, driver: Arc<dyn PortParentDriver>, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        loop {
            let conn = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((conn, _)) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Control socket accept failed");
                        continue;
                    }
                },
            };
            let driver = Arc::clone(&driver);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                if let Err(e) = handle(conn, driver.as_ref(), &cancel).await {
                    tracing::debug!(error = %e, "Control request failed");
                }
            });
        }
        tracker.close();
        tracker.wait().await;
        let _ = std::fs::remove_file(&self.path);
        tracing::debug!("Port control socket closed");
    }
}

async fn handle(
    conn: UnixStream,
    driver: &dyn PortParentDriver,
    cancel: &CancellationToken,
) -> Result<()> {
    let (read, mut write) = conn.into_split();
    let mut line = String::new();
    let mut reader = BufReader::new(read.take(MAX_REQUEST_BYTES));
    tokio::select! {
        read = reader.read_line(&mut line) => {
            read?;
        }
        () = cancel.cancelled() => return Ok(()),
    }

    let response = match serde_json::from_str::<ApiRequest>(line.trim_end()) {
        Ok(request) => {
            tracing::debug!(request = ?request, "Control request");
            dispatch(driver, request).await
        }
        Err(e) => ApiResponse::failure(&Error::invalid_config(format!("malformed request: {e}"))),
    };

    let mut out = serde_json::to_vec(&response)?;
    out.push(b'\n');
    write.write_all(&out).await?;
    write.shutdown().await?;
    Ok(())
}

/// Client for a running session's control socket
#[derive(Debug, Clone)]
pub struct ApiClient {
    socket: PathBuf,
}

impl ApiClient {
    /// Client for `socket`
    #[must_use]
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// Send one request and read the raw response
    ///
    /// # Errors
    /// Returns error if the socket is unreachable or answers garbage
    pub async fn request(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let conn = UnixStream::connect(&self.socket).await.map_err(|e| Error::StateDir {
            path: self.socket.clone(),
            message: format!("cannot connect to the port control socket: {e}"),
        })?;
        let (read, mut write) = conn.into_split();
        let mut out = serde_json::to_vec(request)?;
        out.push(b'\n');
        write.write_all(&out).await?;

        let mut line = String::new();
        BufReader::new(read).read_line(&mut line).await?;
        if line.is_empty() {
            return Err(Error::desync("port control socket closed without answering"));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Expose a port
    ///
    /// # Errors
    /// Returns the session's error for a rejected mapping
    pub async fn add_port(&self, spec: PortSpec) -> Result<PortStatus> {
        let response = self.request(&ApiRequest::Add { spec }).await?;
        let response = into_result(response, None)?;
        response
            .port
            .ok_or_else(|| Error::handshake("add response carries no port"))
    }

    /// Withdraw a port
    ///
    /// # Errors
    /// Returns [`Error::PortNotFound`] for an unknown id
    pub async fn remove_port(&self, id: PortId) -> Result<()> {
        let response = self.request(&ApiRequest::Remove { id }).await?;
        into_result(response, Some(id)).map(drop)
    }

    /// Active mappings
    ///
    /// # Errors
    /// Returns error if the session cannot be reached
    pub async fn list_ports(&self) -> Result<Vec<PortStatus>> {
        let response = self.request(&ApiRequest::List).await?;
        Ok(into_result(response, None)?.ports.unwrap_or_default())
    }
}

fn into_result(response: ApiResponse, id: Option<PortId>) -> Result<ApiResponse> {
    if response.ok {
        return Ok(response);
    }
    let message = response.error.unwrap_or_else(|| "unknown error".to_string());
    Err(match (response.kind.as_deref(), id) {
        (Some("not_found"), Some(id)) => Error::PortNotFound { id: id.as_raw() },
        (Some("invalid"), _) => Error::invalid_config(message),
        _ => Error::Port {
            driver: "api",
            message,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let add: ApiRequest =
            serde_json::from_str(r#"{"op":"add","spec":{"proto":"udp","host":"0.0.0.0:53","child_port":53}}"#)
                .unwrap();
        match add {
            ApiRequest::Add { spec } => {
                assert_eq!(spec.proto, rootgate_core::Protocol::Udp);
                assert_eq!(spec.child_ip, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            serde_json::to_string(&ApiRequest::Remove {
                id: PortId::from_raw(4)
            })
            .unwrap(),
            r#"{"op":"remove","id":4}"#
        );
        assert_eq!(
            serde_json::to_string(&ApiRequest::List).unwrap(),
            r#"{"op":"list"}"#
        );
    }

    #[test]
    fn test_error_response_shape() {
        let response = ApiResponse::failure(&Error::PortNotFound { id: 9 });
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"ok":false,"error":"Port not found: 9","kind":"not_found"}"#
        );
        assert_eq!(
            serde_json::to_string(&ApiResponse::success()).unwrap(),
            r#"{"ok":true}"#
        );
    }

    #[test]
    fn test_client_error_mapping() {
        let not_found = ApiResponse::failure(&Error::PortNotFound { id: 2 });
        assert!(matches!(
            into_result(not_found, Some(PortId::from_raw(2))),
            Err(Error::PortNotFound { id: 2 })
        ));
        let invalid = ApiResponse::failure(&Error::invalid_config("bad"));
        assert_eq!(into_result(invalid, None).unwrap_err().kind(), "invalid");
        let conflict = ApiResponse::failure(&Error::PortConflict {
            spec: "x".into(),
            existing: 1,
        });
        assert!(into_result(conflict, None).unwrap_err().to_string().contains("overlaps"));
    }
}
