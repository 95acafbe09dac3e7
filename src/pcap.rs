//! Packet capture sink in classic pcap format.
//!
//! The writer emits the standard global header once, then one record per
//! tapped packet, truncated to `snaplen`. Frames are raw IP datagrams
//! (LINKTYPE_RAW), exactly what crosses the TUN descriptor.

use std::io::Write;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
/// LINKTYPE_RAW: packets start with the IP header.
const LINKTYPE_RAW: u32 = 101;

pub const DEFAULT_SNAPLEN: u32 = 65535;

pub struct PcapWriter {
    inner: Mutex<Box<dyn Write + Send>>,
    snaplen: u32,
}

impl PcapWriter {
    /// Writes the global header immediately.
    pub fn new(mut writer: Box<dyn Write + Send>, snaplen: u32) -> std::io::Result<Self> {
        let mut header = [0u8; 24];
        header[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
        header[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
        // thiszone, sigfigs = 0
        header[16..20].copy_from_slice(&snaplen.to_le_bytes());
        header[20..24].copy_from_slice(&LINKTYPE_RAW.to_le_bytes());
        writer.write_all(&header)?;
        Ok(Self {
            inner: Mutex::new(writer),
            snaplen,
        })
    }

    /// Append one packet record. Capture failures never disturb the
    /// datapath; they are logged and swallowed.
    pub fn write_packet(&self, packet: &[u8]) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let incl = (packet.len() as u32).min(self.snaplen);

        let mut record = [0u8; 16];
        record[0..4].copy_from_slice(&(now.as_secs() as u32).to_le_bytes());
        record[4..8].copy_from_slice(&now.subsec_micros().to_le_bytes());
        record[8..12].copy_from_slice(&incl.to_le_bytes());
        record[12..16].copy_from_slice(&(packet.len() as u32).to_le_bytes());

        let mut writer = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_poisoned) => return,
        };
        if let Err(e) = writer
            .write_all(&record)
            .and_then(|_| writer.write_all(&packet[..incl as usize]))
        {
            debug!(error = %e, "pcap write failed");
        }
    }
}
