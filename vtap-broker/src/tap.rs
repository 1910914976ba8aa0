//! TAP device allocation through `/dev/net/tun`.

use std::ffi::CStr;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::libc::{self, IFF_NO_PI, IFF_TAP, IFNAMSIZ, c_char, c_short};
use tracing::info;

const TUNSETIFF: nix::libc::Ioctl = 0x400454ca as nix::libc::Ioctl;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

/// A TAP interface together with the descriptor that keeps it alive.
///
/// The device is not persistent: once every copy of the descriptor is closed
/// the kernel removes the interface.
#[derive(Debug)]
pub struct TapDevice {
    name: String,
    if_index: u32,
    fd: OwnedFd,
}

impl TapDevice {
    /// Allocate a new TAP interface and let the kernel pick its name.
    pub fn create() -> io::Result<Self> {
        // No O_NONBLOCK: the flag lives on the open file description and
        // would leak into whoever receives the descriptor.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open("/dev/net/tun")?;

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: (IFF_TAP | IFF_NO_PI) as c_short,
            _padding: [0; 22],
        };

        let result = unsafe { nix::libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let name = unsafe { CStr::from_ptr(ifr.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let if_index = nix::net::if_::if_nametoindex(name.as_str()).map_err(io::Error::from)?;

        info!(name = %name, if_index, "TAP device created");

        Ok(Self::new(name, if_index, OwnedFd::from(file)))
    }

    /// Wrap an already allocated device.
    pub fn new(name: String, if_index: u32, fd: OwnedFd) -> Self {
        Self {
            name,
            if_index,
            fd,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }
}

impl AsFd for TapDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
