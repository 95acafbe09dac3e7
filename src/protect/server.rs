//! Fd-passing protect server.
//!
//! Protocol, per connection: the client sends one SCM_RIGHTS control
//! message carrying exactly one file descriptor (plus one data byte for
//! portability); the server protects the descriptor and answers with a
//! single status byte, then both sides hang up. The socket path is made
//! world-writable so sidecar processes of any uid can reach it.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Protector;

pub const PROTECT_FAILED: u8 = 0;
pub const PROTECT_SUCCESS: u8 = 1;

pub struct ProtectServer {
    cancel: CancellationToken,
    path: PathBuf,
}

impl ProtectServer {
    pub fn serve(path: &str, protector: Arc<dyn Protector>) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind protect server at {}", path))?;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777));

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move { accept_loop(listener, protector, cancel).await });
        }
        info!(path, "protect server started");

        Ok(Self {
            cancel,
            path: PathBuf::from(path),
        })
    }

    pub fn close(&self) {
        self.cancel.cancel();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(
    listener: UnixListener,
    protector: Arc<dyn Protector>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((conn, _)) => {
                        let protector = protector.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_conn(conn, protector).await {
                                debug!(error = %e, "protect request failed");
                            }
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "protect server accept failed");
                        continue;
                    }
                }
            }
        }
    }
}

async fn handle_conn(conn: UnixStream, protector: Arc<dyn Protector>) -> Result<()> {
    let fd = loop {
        conn.readable().await?;
        match recv_fd(conn.as_raw_fd()) {
            Ok(fd) => break fd,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    };

    let ok = protector.protect(fd);
    // Our copy of the descriptor is no longer needed once protected.
    unsafe { libc::close(fd) };

    let status = if ok { PROTECT_SUCCESS } else { PROTECT_FAILED };
    loop {
        conn.writable().await?;
        match conn.try_write(&[status]) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Receive exactly one descriptor from an SCM_RIGHTS message.
fn recv_fd(socket: RawFd) -> io::Result<RawFd> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    let mut cmsg_buf = [0u8; 64];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(socket, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::other("no control message"));
        }
        if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io::Error::other("unexpected control message"));
        }
        Ok(*(libc::CMSG_DATA(cmsg) as *const libc::c_int))
    }
}

/// Send one descriptor over an SCM_RIGHTS message.
fn send_fd(socket: RawFd, fd: RawFd) -> io::Result<()> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    let space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; space];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<libc::c_int>() as u32) as _;
        *(libc::CMSG_DATA(cmsg) as *mut libc::c_int) = fd;
    }

    let n = unsafe { libc::sendmsg(socket, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Client side: hand `fd` to the protect server at `path` and wait for the
/// verdict. Blocking; intended for sidecar processes and tests.
pub fn request_protect(path: &Path, fd: RawFd) -> io::Result<bool> {
    let mut stream = std::os::unix::net::UnixStream::connect(path)?;
    send_fd(stream.as_raw_fd(), fd)?;
    let mut status = [0u8; 1];
    stream.read_exact(&mut status)?;
    Ok(status[0] == PROTECT_SUCCESS)
}
