//! Broker daemon: accept loop and per-connection provisioning sessions.

use std::fmt;
use std::future::Future;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::backend::LinkBackend;
use crate::channel::{self, TAP_TAG};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::mac::MacAddress;

/// Pause after a failed `accept` so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Progress of a provisioning session.
///
/// States are entered strictly in declaration order. There is no explicit
/// closed state: the connection is closed when `Session::run` returns, either
/// after `Transferred` or, on the first failing step, with an error that is
/// logged together with the last state reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    HandshakeRead,
    DeviceCreated,
    MacAssigned,
    BridgeAttached,
    LinkUp,
    Transferred,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Accepted => "accepted",
            SessionState::HandshakeRead => "handshake-read",
            SessionState::DeviceCreated => "device-created",
            SessionState::MacAssigned => "mac-assigned",
            SessionState::BridgeAttached => "bridge-attached",
            SessionState::LinkUp => "link-up",
            SessionState::Transferred => "transferred",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a completed session.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub name: String,
    pub mac: MacAddress,
}

/// The broker daemon.
pub struct Broker<B: LinkBackend> {
    config: Arc<BrokerConfig>,
    backend: Arc<B>,
    sessions: Arc<Semaphore>,
}

impl<B: LinkBackend> Broker<B> {
    pub fn new(config: BrokerConfig, backend: B) -> Self {
        let sessions = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Self {
            config: Arc::new(config),
            backend: Arc::new(backend),
            sessions,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Replace any stale socket file and start listening.
    pub async fn bind(&self) -> Result<UnixListener> {
        let path = &self.config.socket_path;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if tokio::fs::remove_file(path).await.is_ok() {
            debug!(path = %path.display(), "Removed stale socket");
        }

        let listener = UnixListener::bind(path)?;

        if let Some(mode) = self.config.socket_mode {
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }

        info!(
            path = %path.display(),
            bridge = %self.config.bridge,
            max_sessions = self.config.max_sessions,
            "Broker listening"
        );
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves, then remove the socket.
    ///
    /// A failing session never ends the loop.
    pub async fn serve_with_shutdown<F>(&self, listener: UnixListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut next_id: u64 = 0;

        loop {
            // Wait for capacity before accepting so excess clients queue in
            // the backlog instead of creating devices.
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.sessions).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let stream = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            next_id += 1;
            let session = Session {
                config: Arc::clone(&self.config),
                backend: Arc::clone(&self.backend),
            };

            tokio::spawn(
                async move {
                    session.run(stream).await;
                    drop(permit);
                }
                .instrument(info_span!("session", id = next_id)),
            );
        }

        let _ = tokio::fs::remove_file(&self.config.socket_path).await;
        info!("Broker stopped accepting connections");
        Ok(())
    }
}

struct Session<B: LinkBackend> {
    config: Arc<BrokerConfig>,
    backend: Arc<B>,
}

impl<B: LinkBackend> Session<B> {
    async fn run(self, mut stream: UnixStream) {
        let mut state = SessionState::Accepted;

        match self.provision(&mut stream, &mut state).await {
            Ok(done) => info!(
                tap = %done.name,
                mac = %done.mac,
                bridge = %self.config.bridge,
                "TAP device handed to client"
            ),
            Err(e) => warn!(reached = %state, error = %e, "Session failed"),
        }
    }

    async fn provision(
        &self,
        stream: &mut UnixStream,
        state: &mut SessionState,
    ) -> Result<Provisioned> {
        let requested = channel::read_handshake(stream, self.config.handshake_timeout).await?;
        *state = SessionState::HandshakeRead;

        let tap = self
            .step(SessionState::DeviceCreated, self.backend.create_tap())
            .await?;
        *state = SessionState::DeviceCreated;

        let mac = match requested {
            Some(mac) => mac.normalized(),
            None => MacAddress::random(),
        };
        debug!(tap = %tap.name(), mac = %mac, requested = requested.is_some(), "Assigning address");
        self.step(SessionState::MacAssigned, self.backend.set_address(&tap, mac))
            .await?;
        *state = SessionState::MacAssigned;

        self.step(
            SessionState::BridgeAttached,
            self.backend.attach(&tap, &self.config.bridge),
        )
        .await?;
        *state = SessionState::BridgeAttached;

        self.step(SessionState::LinkUp, self.backend.set_up(&tap))
            .await?;
        *state = SessionState::LinkUp;

        self.step(SessionState::Transferred, async {
            channel::send_fd(stream, tap.as_fd(), TAP_TAG).await?;
            Ok(())
        })
        .await?;
        *state = SessionState::Transferred;

        // The client owns the device now; close our copy.
        let done = Provisioned {
            name: tap.name().to_string(),
            mac,
        };
        drop(tap);
        Ok(done)
    }

    async fn step<T>(
        &self,
        state: SessionState,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.step_timeout;
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| BrokerError::StepTimeout { state, timeout })?
    }
}
