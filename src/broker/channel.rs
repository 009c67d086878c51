//! Named unix datagram sockets for the control channel

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

use crate::error::{Result, VermeerError};

/// One bound datagram socket plus its filesystem name
pub struct ControlChannel {
    socket: UnixDatagram,
    path: PathBuf,
}

impl ControlChannel {
    /// Bind at `path`, replacing any stale socket file left behind
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VermeerError::from_io(e, "Failed to create socket directory"))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .map_err(|e| VermeerError::from_io(e, "Failed to remove stale socket"))?;
        }
        let socket = UnixDatagram::bind(path)
            .map_err(|e| VermeerError::from_io(e, "Failed to bind control socket"))?;
        Ok(Self {
            socket,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send one encoded message to a named peer
    pub fn send_to(&self, target: &Path, message: &[u8]) -> Result<()> {
        self.socket
            .send_to(message, target)
            .map_err(|e| VermeerError::from_io(e, "Failed to send control message"))?;
        Ok(())
    }

    /// Receive one datagram, blocking
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.socket
            .recv(buf)
            .map_err(|e| VermeerError::from_io(e, "Failed to receive control message"))
    }

    /// Receive one datagram if one arrives within `timeout`
    pub fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        let mut fds = [PollFd::new(self.socket.as_raw_fd(), PollFlags::POLLIN)];
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        match poll(&mut fds, millis) {
            Ok(0) => Ok(None),
            Ok(_) => self.recv(buf).map(Some),
            Err(errno) => Err(VermeerError::platform(format!(
                "poll on control socket failed: {}",
                errno
            ))),
        }
    }

    /// Fire-and-forget send from an unbound socket, for timer callbacks
    pub fn post(target: &Path, message: &[u8]) -> Result<()> {
        let socket = UnixDatagram::unbound()
            .map_err(|e| VermeerError::from_io(e, "Failed to create unbound socket"))?;
        socket
            .send_to(message, target)
            .map_err(|e| VermeerError::from_io(e, "Failed to post control message"))?;
        Ok(())
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
