//! Test helpers for vtap-broker integration tests.

#![allow(dead_code)]

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use vtap_broker::backend::allocate_blocking;
use vtap_broker::channel::{self, TAP_TAG};
use vtap_broker::error::{BrokerError, Result};
use vtap_broker::{Broker, BrokerConfig, ChannelError, LinkBackend, MacAddress, TapDevice};

/// Kernel call observed by the fake backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String),
    SetAddress(String, MacAddress),
    Attach(String, String),
    SetUp(String),
}

#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls made for one device, in order.
    pub fn calls_for(&self, tap: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| match c {
                Call::Create(n) | Call::SetAddress(n, _) | Call::Attach(n, _) | Call::SetUp(n) => {
                    n == tap
                }
            })
            .collect()
    }

    pub fn created(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn addresses(&self) -> Vec<MacAddress> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SetAddress(_, mac) => Some(mac),
                _ => None,
            })
            .collect()
    }
}

/// Backend that hands out temporary files instead of TAP devices.
#[derive(Default)]
pub struct FakeBackend {
    pub recorder: Arc<Recorder>,
    next: AtomicU32,
    /// Fail the next bridge attachment.
    pub fail_attach_once: AtomicBool,
    /// Never finish bringing a link up.
    pub stall_up: bool,
    /// Block the allocating thread this long, like a contended TUNSETIFF.
    pub block_create: Option<Duration>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stalling_link_up() -> Self {
        Self {
            stall_up: true,
            ..Self::default()
        }
    }

    pub fn blocking_create(delay: Duration) -> Self {
        Self {
            block_create: Some(delay),
            ..Self::default()
        }
    }
}

#[async_trait]
impl LinkBackend for FakeBackend {
    async fn create_tap(&self) -> Result<TapDevice> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let name = format!("faketap{n}");
        let fd = OwnedFd::from(tempfile::tempfile()?);
        self.recorder.push(Call::Create(name.clone()));

        match self.block_create {
            Some(delay) => {
                allocate_blocking(move || {
                    std::thread::sleep(delay);
                    Ok(TapDevice::new(name, 100 + n, fd))
                })
                .await
            }
            None => Ok(TapDevice::new(name, 100 + n, fd)),
        }
    }

    async fn set_address(&self, tap: &TapDevice, mac: MacAddress) -> Result<()> {
        self.recorder
            .push(Call::SetAddress(tap.name().to_string(), mac));
        Ok(())
    }

    async fn attach(&self, tap: &TapDevice, bridge: &str) -> Result<()> {
        if self.fail_attach_once.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::Netlink("injected failure".to_string()));
        }
        self.recorder
            .push(Call::Attach(tap.name().to_string(), bridge.to_string()));
        Ok(())
    }

    async fn set_up(&self, tap: &TapDevice) -> Result<()> {
        if self.stall_up {
            std::future::pending::<()>().await;
        }
        self.recorder.push(Call::SetUp(tap.name().to_string()));
        Ok(())
    }
}

/// In-process broker bound to a socket in a temporary directory.
pub struct TestBroker {
    pub socket: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<Result<()>>>,
    _dir: TempDir,
}

pub const TEST_BRIDGE: &str = "br-test";

pub fn test_config(dir: &Path) -> BrokerConfig {
    BrokerConfig {
        socket_path: dir.join("run").join("tap.sock"),
        bridge: TEST_BRIDGE.to_string(),
        handshake_timeout: Duration::from_secs(1),
        step_timeout: Duration::from_secs(1),
        max_sessions: 8,
        socket_mode: None,
    }
}

impl TestBroker {
    pub async fn start<B: LinkBackend>(backend: B, tweak: impl FnOnce(&mut BrokerConfig)) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let socket = config.socket_path.clone();

        let broker = Broker::new(config, backend);
        let listener = broker.bind().await.expect("Failed to bind broker socket");

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            broker
                .serve_with_shutdown(listener, async {
                    let _ = rx.await;
                })
                .await
        });

        Self {
            socket,
            shutdown: Some(tx),
            handle: Some(handle),
            _dir: dir,
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .expect("Broker task panicked")
                .expect("Broker returned an error");
        }
    }
}

/// Run the client side of one session.
pub async fn request(socket: &Path, mac: Option<MacAddress>) -> std::result::Result<OwnedFd, ChannelError> {
    let mut stream = UnixStream::connect(socket).await?;
    channel::write_handshake(&mut stream, mac).await?;
    channel::recv_fd(&stream, TAP_TAG).await
}
