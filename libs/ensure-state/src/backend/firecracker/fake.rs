//! Scripted Firecracker API server for tests.
//!
//! Serves `GET /`, `PUT /actions` and `PATCH /vm` on a Unix socket, one
//! thread per connection, and records every request it answers.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{json, Value};

use super::SOCKET_NAME;

#[derive(Debug)]
struct VmmState {
    id: String,
    app_name: String,
    state: &'static str,
    /// Requests (`InstanceStart`, `Paused`, ...) accepted without effect.
    ignored: Vec<&'static str>,
    /// Status and fault message returned for the next mutating request.
    fault: Option<(u16, String)>,
    requests: Vec<(String, String, Value)>,
}

/// A fake VMM listening on `<instances_dir>/<dir>/firecracker.socket`.
#[derive(Debug, Clone)]
pub struct FakeVmm {
    inner: Arc<Mutex<VmmState>>,
    socket: PathBuf,
}

impl FakeVmm {
    /// Bind the API socket and start serving.
    pub fn spawn(instances_dir: &Path, dir: &str, id: &str, state: &'static str) -> Self {
        let instance_dir = instances_dir.join(dir);
        std::fs::create_dir_all(&instance_dir).unwrap();
        let socket = instance_dir.join(SOCKET_NAME);
        let listener = UnixListener::bind(&socket).unwrap();

        let fake = Self {
            inner: Arc::new(Mutex::new(VmmState {
                id: id.to_string(),
                app_name: "Firecracker".to_string(),
                state,
                ignored: Vec::new(),
                fault: None,
                requests: Vec::new(),
            })),
            socket,
        };

        let server = fake.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let connection = server.clone();
                thread::spawn(move || connection.serve(stream));
            }
        });

        fake
    }

    pub fn app_name(self, app_name: &str) -> Self {
        self.lock().app_name = app_name.to_string();
        self
    }

    pub fn ignoring(self, request: &'static str) -> Self {
        self.lock().ignored.push(request);
        self
    }

    pub fn fail_next(&self, status: u16, message: &str) {
        self.lock().fault = Some((status, message.to_string()));
    }

    pub fn state(&self) -> &'static str {
        self.lock().state
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Mutating requests received, as `(method, path, body)`.
    pub fn mutations(&self) -> Vec<(String, String, Value)> {
        self.lock()
            .requests
            .iter()
            .filter(|(method, _, _)| method != "GET")
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VmmState> {
        self.inner.lock().unwrap()
    }

    fn serve(&self, stream: UnixStream) {
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);

        loop {
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
                return;
            }
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let path = parts.next().unwrap_or_default().to_string();

            let mut content_length = 0;
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).unwrap_or(0) == 0 {
                    return;
                }
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
            }

            let mut body = vec![0u8; content_length];
            if reader.read_exact(&mut body).is_err() {
                return;
            }
            let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

            let (status, payload) = self.handle(&method, &path, body);
            let response = match payload {
                Some(payload) => format!(
                    "HTTP/1.1 {status} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{payload}",
                    payload.len()
                ),
                None => format!("HTTP/1.1 {status} No Content\r\nContent-Length: 0\r\n\r\n"),
            };
            if writer.write_all(response.as_bytes()).is_err() {
                return;
            }
        }
    }

    fn handle(&self, method: &str, path: &str, body: Value) -> (u16, Option<String>) {
        let mut vmm = self.lock();
        vmm.requests
            .push((method.to_string(), path.to_string(), body.clone()));

        if method == "GET" && path == "/" {
            let info = json!({
                "app_name": vmm.app_name,
                "id": vmm.id,
                "state": vmm.state,
                "vmm_version": "1.7.0",
            });
            return (200, Some(info.to_string()));
        }

        if let Some((status, message)) = vmm.fault.take() {
            return (status, Some(json!({ "fault_message": message }).to_string()));
        }

        let request = match (method, path) {
            ("PUT", "/actions") => body["action_type"].as_str().unwrap_or_default().to_string(),
            ("PATCH", "/vm") => body["state"].as_str().unwrap_or_default().to_string(),
            _ => return (400, Some(json!({ "fault_message": "unknown route" }).to_string())),
        };
        if vmm.ignored.iter().any(|ignored| *ignored == request) {
            return (204, None);
        }

        match request.as_str() {
            "InstanceStart" | "Resumed" => vmm.state = "Running",
            "Paused" => vmm.state = "Paused",
            // The guest decides what to do with the key press.
            "SendCtrlAltDel" => {}
            other => {
                let fault = json!({ "fault_message": format!("unsupported request {other}") });
                return (400, Some(fault.to_string()));
            }
        }
        (204, None)
    }
}
