//! vtap-client - obtains a TAP device from vtap-broker and hands it to a
//! command.
//!
//! The descriptor number replaces every `%FD%` in the command line. By default
//! the client replaces its own process image with the command; the descriptor
//! is left inheritable so the command owns the interface afterwards.

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::debug;

use vtap_broker::channel::{self, TAP_TAG};
use vtap_broker::{ChannelError, MacAddress, MacError};

/// Token in the command line replaced by the descriptor number.
pub const FD_PLACEHOLDER: &str = "%FD%";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to send handshake: {0}")]
    Handshake(#[source] ChannelError),

    #[error("Failed to receive TAP descriptor: {0}")]
    Receive(#[source] ChannelError),

    #[error(transparent)]
    Mac(#[from] MacError),

    #[error("Failed to make descriptor inheritable: {0}")]
    Inherit(#[from] nix::errno::Errno),

    #[error("No command given")]
    EmptyCommand,

    #[error("Failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Which hardware address to ask the broker for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacRequest {
    /// Let the broker generate one.
    Any,
    Explicit(MacAddress),
    /// Copy the address of an existing interface.
    CopyFrom(String),
}

impl MacRequest {
    /// Resolve to the address put on the wire, already in the broker's
    /// locally administered range.
    pub fn resolve(&self) -> Result<Option<MacAddress>, ClientError> {
        let mac = match self {
            MacRequest::Any => return Ok(None),
            MacRequest::Explicit(mac) => *mac,
            MacRequest::CopyFrom(name) => MacAddress::from_interface(name)?,
        };
        Ok(Some(mac.normalized()))
    }
}

/// Connect to the broker and receive one TAP descriptor.
///
/// The returned descriptor does not have `FD_CLOEXEC` set.
pub async fn request_tap(socket: &Path, mac: Option<MacAddress>) -> Result<OwnedFd, ClientError> {
    let mut stream = UnixStream::connect(socket)
        .await
        .map_err(|source| ClientError::Connect {
            path: socket.to_path_buf(),
            source,
        })?;

    channel::write_handshake(&mut stream, mac)
        .await
        .map_err(ClientError::Handshake)?;
    debug!(mac = ?mac.map(|m| m.to_string()), "Handshake sent");

    let fd = channel::recv_fd(&stream, TAP_TAG)
        .await
        .map_err(ClientError::Receive)?;

    fcntl(&fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(fd)
}

/// Replace every placeholder with the descriptor number.
pub fn substitute_fd(args: &[String], fd: RawFd) -> Vec<String> {
    let fd = fd.to_string();
    args.iter()
        .map(|arg| arg.replace(FD_PLACEHOLDER, &fd))
        .collect()
}

/// Replace the current process with `argv`. Only returns on failure.
pub fn exec(argv: &[String]) -> ClientError {
    let Some((program, args)) = argv.split_first() else {
        return ClientError::EmptyCommand;
    };

    let source = std::process::Command::new(program).args(args).exec();
    ClientError::Exec {
        program: program.clone(),
        source,
    }
}

/// Run `argv` as a child that inherits the descriptor and wait for it.
pub async fn spawn_and_wait(argv: &[String]) -> Result<ExitStatus, ClientError> {
    let (program, args) = argv.split_first().ok_or(ClientError::EmptyCommand)?;

    tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|source| ClientError::Exec {
            program: program.clone(),
            source,
        })
}

/// Exit code reporting `status` the way a shell does: signals map to
/// `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}
