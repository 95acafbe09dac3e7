//! tunbridge — a mobile-side bridge between an OS TUN interface and a
//! userland proxy engine.
//!
//! Packets read from the TUN fd are parsed and NAT-rewritten so that a
//! pair of local listeners can adopt every TCP flow and a per-source table
//! every UDP flow; adopted flows are dialed through the injected
//! [`engine::ProxyEngine`], relayed, accounted per owning app, and torn
//! down on close. See [`app::TunBridge`] for the lifecycle entry point.

pub mod app;
pub mod common;
pub mod engine;
pub mod nat;
pub mod pcap;
pub mod protect;
pub mod tun;

#[cfg(test)]
pub(crate) mod testutil;

pub use app::{BridgeSettings, Platform, TunBridge};
pub use common::{Error, PacketConn, ProxyStream};
pub use engine::{Address, LocalResolver, Network, ProxyEngine, Session};
pub use protect::Protector;
