//! Loopback escape: everything the engine dials out must bypass the TUN
//! routes, or the packets would re-enter the bridge and loop.
//!
//! The host application supplies a [`Protector`] (Android's
//! `VpnService.protect`); the bridge installs a [`ProtectedDialer`] into
//! the process-wide dialer slot the engine consumes, and optionally serves
//! the fd-passing unix socket for sidecar processes.
//!
//! [`ProtectedDialer`]: dialer::ProtectedDialer

pub mod dialer;
pub mod server;

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};

use crate::engine::Address;

/// Marks a file descriptor as exempt from the TUN routing table.
pub trait Protector: Send + Sync {
    fn protect(&self, fd: RawFd) -> bool;
}

/// Used when the host does not require protection (tests, desktop).
pub struct NoopProtector;

impl Protector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

/// Outbound socket factory the proxy engine must route all its own
/// connections through.
#[async_trait]
pub trait SystemDialer: Send + Sync {
    async fn dial_tcp(&self, destination: &Address) -> Result<TcpStream>;
    async fn bind_udp(&self, destination: &Address) -> Result<UdpSocket>;
}

static SYSTEM_DIALER: ArcSwapOption<Box<dyn SystemDialer>> = ArcSwapOption::const_empty();
static SETUP: Mutex<()> = Mutex::new(());

/// Install (or clear) the process-wide dialer override. Part of the bridge
/// lifecycle; a closing bridge must clear what it installed.
pub fn set_system_dialer(dialer: Option<Box<dyn SystemDialer>>) {
    let _setup = match SETUP.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    SYSTEM_DIALER.store(dialer.map(Arc::new));
}

/// The currently installed dialer override, if any.
pub fn system_dialer() -> Option<Arc<Box<dyn SystemDialer>>> {
    SYSTEM_DIALER.load_full()
}
