//! In-process stand-in for the metadata service.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const HOST_UUID: &str = "host-1";
const API_PREFIX: &str = "/2015-12-19";

struct State {
    ready: bool,
    version: u64,
    containers: Value,
    requests: Vec<String>,
}

pub struct FakeMetadata {
    pub url: String,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl FakeMetadata {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}{}", listener.local_addr().unwrap(), API_PREFIX);
        let state = Arc::new(Mutex::new(State {
            ready: true,
            version: 1,
            containers: json!([]),
            requests: Vec::new(),
        }));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream, Arc::clone(&shared)));
            }
        });

        Self { url, state, task }
    }

    /// Replace the container list and bump the version.
    pub fn set_containers(&self, containers: Value) {
        let mut state = self.state.lock().unwrap();
        state.containers = containers;
        state.version += 1;
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.lock().unwrap().ready = ready;
    }

    pub fn requests(&self, path: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.requests.iter().filter(|p| *p == path).count()
    }
}

impl Drop for FakeMetadata {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(mut stream: TcpStream, state: Arc<Mutex<State>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let path = request
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .trim_start_matches(API_PREFIX)
        .to_string();

    let (status, body) = {
        let mut state = state.lock().unwrap();
        state.requests.push(path.clone());
        if !state.ready {
            ("503 Service Unavailable", json!("not ready"))
        } else {
            match path.as_str() {
                "/version" => ("200 OK", json!(state.version.to_string())),
                "/self/host" => ("200 OK", json!({ "uuid": HOST_UUID, "name": "node1" })),
                "/containers" => ("200 OK", state.containers.clone()),
                _ => ("404 Not Found", json!("not found")),
            }
        }
    };

    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// A container record describing one VM.
pub fn vm(name: &str, index: u64, mac: &str, ip: &str) -> Value {
    let metadata = json!({ "mac": mac, "local-ipv4": ip, "hostname": name });
    json!({
        "name": name,
        "host_uuid": HOST_UUID,
        "create_index": index,
        "labels": { "io.rancher.vm.metadata": metadata.to_string() },
    })
}

/// Write an executable shell script into `dir`.
pub fn script(dir: &std::path::Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}
