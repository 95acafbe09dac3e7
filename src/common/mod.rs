pub mod coalesce;
pub mod error;
pub mod lru;
pub mod stream;
pub mod udp;

pub use coalesce::{CondTable, Flight};
pub use error::Error;
pub use lru::LruCache;
pub use stream::{AsyncStream, CountedStream, ProxyStream};
pub use udp::{CountedPacketConn, PacketConn};
