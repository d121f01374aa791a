//! Firecracker HTTP API client.
//!
//! Talks to a running VMM over its Unix socket. Only the calls needed for
//! lifecycle control are implemented; machine configuration is expected to
//! be done by whoever launched the VMM.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/firecracker/swagger/firecracker.yaml

use std::path::{Path, PathBuf};

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

/// Errors from the Firecracker API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Socket not found: {0}")]
    SocketNotFound(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<hyper::http::Error> for ApiError {
    fn from(err: hyper::http::Error) -> Self {
        ApiError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// Instance information from Firecracker (`GET /`).
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    /// Application name.
    #[serde(default)]
    pub app_name: String,
    /// Instance ID.
    pub id: String,
    /// State of the instance: "Not started", "Running" or "Paused".
    pub state: String,
    /// VMM version.
    pub vmm_version: String,
}

/// Firecracker API client for Unix socket communication.
#[derive(Debug)]
pub struct FirecrackerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl FirecrackerClient {
    /// Create a new Firecracker client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Get instance info.
    pub async fn get_instance_info(&self) -> Result<InstanceInfo, ApiError> {
        self.get("/").await
    }

    /// Start the microVM instance.
    pub async fn start_instance(&self) -> Result<(), ApiError> {
        self.action("InstanceStart").await
    }

    /// Send CtrlAltDel to the guest (graceful shutdown).
    pub async fn send_ctrl_alt_del(&self) -> Result<(), ApiError> {
        self.action("SendCtrlAltDel").await
    }

    /// Pause the microVM.
    pub async fn pause(&self) -> Result<(), ApiError> {
        self.set_vm_state("Paused").await
    }

    /// Resume the microVM.
    pub async fn resume(&self) -> Result<(), ApiError> {
        self.set_vm_state("Resumed").await
    }

    async fn action(&self, action_type: &'static str) -> Result<(), ApiError> {
        #[derive(Serialize)]
        struct Action {
            action_type: &'static str,
        }
        self.send(Method::PUT, "/actions", &Action { action_type })
            .await
    }

    async fn set_vm_state(&self, state: &'static str) -> Result<(), ApiError> {
        #[derive(Serialize)]
        struct State {
            state: &'static str,
        }
        self.send(Method::PATCH, "/vm", &State { state }).await
    }

    /// Perform a request with a JSON body and no response payload.
    async fn send<T: Serialize>(&self, method: Method, path: &str, body: &T) -> Result<(), ApiError> {
        self.ensure_socket()?;
        let body_bytes = serde_json::to_vec(body)?;
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "Request to Firecracker API");

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body_bytes))?;

        let response = self.client.request(request).await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            let message = fault_message(body.chunk());
            error!(status = %status, message = %message, "Firecracker API error");
            Err(ApiError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Perform a GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.ensure_socket()?;
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, "GET request to Firecracker API");

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;

        if status.is_success() {
            let result = serde_json::from_reader(body.reader())?;
            Ok(result)
        } else {
            Err(ApiError::Api {
                status: status.as_u16(),
                message: fault_message(body.chunk()),
            })
        }
    }

    fn ensure_socket(&self) -> Result<(), ApiError> {
        if self.socket_exists() {
            Ok(())
        } else {
            Err(ApiError::SocketNotFound(
                self.socket_path.display().to_string(),
            ))
        }
    }
}

/// Extract `fault_message` from an error body, falling back to the raw text.
fn fault_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Fault {
        fault_message: String,
    }

    match serde_json::from_slice::<Fault>(body) {
        Ok(fault) => fault.fault_message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_info_deserializes() {
        let info: InstanceInfo = serde_json::from_str(
            r#"{"app_name":"Firecracker","id":"vm-7","state":"Not started","vmm_version":"1.7.0"}"#,
        )
        .unwrap();

        assert_eq!(info.id, "vm-7");
        assert_eq!(info.state, "Not started");
        assert_eq!(info.vmm_version, "1.7.0");
    }

    #[test]
    fn test_fault_message_extracted() {
        assert_eq!(
            fault_message(br#"{"fault_message":"The requested operation is not supported"}"#),
            "The requested operation is not supported"
        );
        assert_eq!(fault_message(b"bad gateway\n"), "bad gateway");
    }

    #[tokio::test]
    async fn test_missing_socket_fails_fast() {
        let client = FirecrackerClient::new("/nonexistent/firecracker.socket");

        let err = client.get_instance_info().await.unwrap_err();
        assert!(matches!(err, ApiError::SocketNotFound(_)));
    }

    #[tokio::test]
    async fn test_requests_reach_the_vmm() {
        let dir = tempfile::tempdir().unwrap();
        let vmm = super::super::fake::FakeVmm::spawn(dir.path(), "vm-1", "vm-1", "Running");
        let client = FirecrackerClient::new(vmm.socket());

        client.pause().await.unwrap();
        assert_eq!(client.get_instance_info().await.unwrap().state, "Paused");

        vmm.fail_next(400, "The requested operation is not supported");
        let err = client.resume().await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::Api { status: 400, ref message } if message == "The requested operation is not supported"
        ));
    }
}
