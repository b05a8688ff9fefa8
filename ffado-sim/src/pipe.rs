//! A self-pipe used as a pollable readiness signal for simulated iso
//! contexts: `nix::poll` needs a real file
//! descriptor to block on, so the loopback transport posts one byte per
//! readiness event the way a real iso context would raise `POLLIN`. The
//! same "wake a blocked poll from another thread" trick
//! `ffado_transport::manager`'s activity semaphore achieves with a
//! condvar instead — a condvar can't be handed to `poll()`.

use std::io::ErrorKind;
use std::os::unix::io::RawFd;

pub struct SelfPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SelfPipe {
    pub fn new() -> std::io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        for fd in [read_fd, write_fd] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }
        Ok(SelfPipe { read_fd, write_fd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Post one readiness signal. Best-effort: a momentarily full pipe
    /// (`EAGAIN`) just means an earlier signal hasn't been drained yet,
    /// which already leaves the fd readable.
    pub fn signal(&self) {
        let byte = [1u8];
        let rc = unsafe { libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::WouldBlock {
                log::warn!("loopback transport: self-pipe write failed: {err}");
            }
        }
    }

    /// Drain all pending signals so the fd goes back to not-ready.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

// SelfPipe owns two plain fds with no shared mutable state beyond the
// kernel pipe buffer itself; safe to move/share across threads.
unsafe impl Send for SelfPipe {}
unsafe impl Sync for SelfPipe {}
