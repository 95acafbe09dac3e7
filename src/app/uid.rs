//! Owning-app resolution for adopted sessions.
//!
//! The platform service is injected as [`UidDumper`]; when it cannot
//! answer (older Android releases), the `/proc/net` tables are scanned
//! directly. Column positions are discovered from the header row once per
//! file read, compensating for the kernel printing `tx_queue:rx_queue`
//! and `tr:tm->when` as single colon-joined fields in data rows.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, SocketAddr};

use anyhow::Result;

use crate::engine::Network;

/// Platform service that maps a five-tuple to the owning uid.
pub trait UidDumper: Send + Sync {
    fn dump_uid(
        &self,
        network: Network,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Result<u32>;

    fn package_name(&self, uid: u32) -> Option<String>;
}

/// Scan the matching `/proc/net` table for the socket bound to `source`.
pub fn query_uid_from_procfs(network: Network, source: SocketAddr) -> Option<u32> {
    let mut path = String::from("/proc/net/");
    path.push_str(match network {
        Network::Tcp => "tcp",
        Network::Udp => "udp",
    });
    if source.is_ipv6() {
        path.push('6');
    }
    let file = File::open(path).ok()?;
    scan_proc_net(BufReader::new(file), &local_token(source))
}

/// The `local_address` token for `addr` as the kernel formats it: hex of
/// the address with every 4-byte word in native byte order, colon, hex
/// port. Works for both families on either endianness.
pub(crate) fn local_token(addr: SocketAddr) -> String {
    let bytes = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    let mut token = String::with_capacity(bytes.len() * 2 + 5);
    for word in bytes.chunks_exact(4) {
        let native = u32::from_be_bytes([word[0], word[1], word[2], word[3]]).to_ne_bytes();
        for b in native {
            token.push_str(&format!("{:02X}", b));
        }
    }
    token.push(':');
    token.push_str(&format!("{:04X}", addr.port()));
    token
}

pub(crate) fn scan_proc_net<R: BufRead>(reader: R, local: &str) -> Option<u32> {
    let mut lines = reader.lines();
    let header = lines.next()?.ok()?;
    let (local_idx, uid_idx) = find_columns(&header)?;

    for line in lines {
        let line = line.ok()?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() <= local_idx || fields.len() <= uid_idx {
            continue;
        }
        if fields[local_idx].eq_ignore_ascii_case(local) {
            return fields[uid_idx].parse().ok();
        }
    }
    None
}

/// Locate `local_address` and `uid` column indices from the header row,
/// shifted for the colon-merged column pairs of the data rows.
fn find_columns(header: &str) -> Option<(usize, usize)> {
    let mut local_idx = None;
    let mut uid_idx = None;
    let mut tx_queue = false;
    let mut rx_queue = false;
    let mut tr = false;
    let mut tm_when = false;

    for (idx, col) in header.split_whitespace().enumerate() {
        let mut offset = 0isize;
        if tx_queue && rx_queue {
            offset -= 1;
        }
        if tr && tm_when {
            offset -= 1;
        }
        match col {
            "tx_queue" => tx_queue = true,
            "rx_queue" => rx_queue = true,
            "tr" => tr = true,
            "tm->when" => tm_when = true,
            "local_address" => local_idx = Some((idx as isize + offset) as usize),
            "uid" => uid_idx = Some((idx as isize + offset) as usize),
            _ => {}
        }
    }
    Some((local_idx?, uid_idx?))
}
