//! Descriptor-transfer channel between broker and client.
//!
//! A session on the broker socket is:
//!
//! 1. client → broker: 17 ASCII bytes `xx:xx:xx:xx:xx:xx`, the requested
//!    hardware address, or `00:00:00:00:00:00` to let the broker choose;
//! 2. broker → client: one message whose payload is the tag `tap` and whose
//!    `SCM_RIGHTS` control data carries exactly one descriptor.
//!
//! The broker closes the connection without sending anything if provisioning
//! fails.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;

use crate::error::{ChannelError, MacError};
use crate::mac::{MAC_STRING_LEN, MacAddress};

/// Tag sent alongside a TAP descriptor.
pub const TAP_TAG: &str = "tap";

/// Upper bound on descriptors accepted in one message; extras are closed.
const MAX_RECV_FDS: usize = 4;

/// Send the handshake. `None` asks the broker to pick an address.
pub async fn write_handshake(
    stream: &mut UnixStream,
    mac: Option<MacAddress>,
) -> Result<(), ChannelError> {
    let line = mac.unwrap_or(MacAddress::WILDCARD).to_string();
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the handshake, giving up after `timeout`.
///
/// Returns `None` for the wildcard address.
pub async fn read_handshake(
    stream: &mut UnixStream,
    timeout: Duration,
) -> Result<Option<MacAddress>, ChannelError> {
    let mut buf = [0u8; MAC_STRING_LEN];

    match tokio::time::timeout(timeout, stream.read_exact(&mut buf)).await {
        Err(_) => return Err(ChannelError::HandshakeTimeout(timeout)),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(MacError::Invalid(String::from_utf8_lossy(&buf).into_owned()).into());
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(_)) => {}
    }

    let text = std::str::from_utf8(&buf)
        .map_err(|_| MacError::Invalid(String::from_utf8_lossy(&buf).into_owned()))?;
    let mac: MacAddress = text.parse()?;

    Ok((!mac.is_wildcard()).then_some(mac))
}

/// Send one descriptor with a tag in a single `sendmsg`.
pub async fn send_fd(
    stream: &UnixStream,
    fd: BorrowedFd<'_>,
    tag: &str,
) -> Result<(), ChannelError> {
    let fds = [fd.as_raw_fd()];

    let sent = stream
        .async_io(Interest::WRITABLE, || {
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            let iov = [IoSlice::new(tag.as_bytes())];
            sendmsg::<()>(
                stream.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            )
            .map_err(io::Error::from)
        })
        .await?;

    if sent != tag.len() {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "short descriptor message").into());
    }
    Ok(())
}

/// Receive exactly one descriptor and check its tag.
///
/// The returned descriptor belongs to the caller.
pub async fn recv_fd(stream: &UnixStream, tag: &str) -> Result<OwnedFd, ChannelError> {
    let mut buf = [0u8; 64];

    let (bytes, truncated, mut fds) = stream
        .async_io(Interest::READABLE, || {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_RECV_FDS]);

            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )
            .map_err(io::Error::from)?;

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    // SAFETY: the kernel just installed these descriptors for us.
                    fds.extend(
                        received
                            .into_iter()
                            .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }),
                    );
                }
            }

            Ok((
                msg.bytes,
                msg.flags.contains(MsgFlags::MSG_CTRUNC),
                fds,
            ))
        })
        .await?;

    if bytes == 0 && fds.is_empty() {
        return Err(ChannelError::Closed);
    }
    if truncated {
        return Err(ChannelError::Truncated);
    }
    if &buf[..bytes] != tag.as_bytes() {
        return Err(ChannelError::UnexpectedTag {
            expected: tag.to_string(),
            actual: String::from_utf8_lossy(&buf[..bytes]).into_owned(),
        });
    }

    match fds.len() {
        0 => Err(ChannelError::MissingDescriptor),
        1 => Ok(fds.remove(0)),
        n => Err(ChannelError::TooManyDescriptors(n)),
    }
}
