//! UDP dispatch and reply reinjection.
//!
//! The first `ip-header + 8` bytes of each outbound datagram are captured
//! as a reply template after swapping the destination towards the client.
//! Every reply then only needs its source patched in, lengths fixed and
//! checksums redone before the header and payload are injected as one
//! gathered write.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::common::Error;
use crate::nat::packet::{Ipv4Packet, Ipv6Packet, UdpDatagram, UDP_HEADER_LEN};
use crate::tun::{TunInterface, WriteBack};

/// A parsed outbound datagram, ready for the session manager.
pub(crate) struct UdpFlow {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub payload: Bytes,
    pub write_back: Arc<UdpWriteBack>,
}

/// Reinjects reply datagrams for one UDP association.
pub struct UdpWriteBack {
    tun: Arc<TunInterface>,
    /// Reply-oriented IP+UDP header, destination already pointing at the
    /// client. Source address/port are patched per reply.
    template: Mutex<Vec<u8>>,
    ip_header_len: usize,
    orig_dst: SocketAddr,
}

impl UdpWriteBack {
    fn new(
        tun: Arc<TunInterface>,
        template: Vec<u8>,
        ip_header_len: usize,
        orig_dst: SocketAddr,
    ) -> Self {
        Self {
            tun,
            template: Mutex::new(template),
            ip_header_len,
            orig_dst,
        }
    }
}

impl WriteBack for UdpWriteBack {
    fn write_back(&self, payload: &[u8], from: Option<SocketAddr>) -> io::Result<usize> {
        let mut template = match self.template.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let v4 = template[0] >> 4 == 4;

        // A reply source of the wrong family cannot be expressed in the
        // captured header; fall back to the original destination.
        let reply_src = match from {
            Some(addr) if addr.is_ipv4() == v4 => addr,
            _ => self.orig_dst,
        };

        let udp_len = UDP_HEADER_LEN + payload.len();
        if udp_len > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "udp reply too large",
            ));
        }

        let (ip_bytes, udp_bytes) = template.split_at_mut(self.ip_header_len);
        let (client_ip, src_ip) = if v4 {
            let mut ip = Ipv4Packet::new(ip_bytes).map_err(io::Error::from)?;
            let src = match reply_src.ip() {
                IpAddr::V4(addr) => addr,
                IpAddr::V6(_) => unreachable!("family checked above"),
            };
            ip.set_src(src);
            ip.set_total_len((self.ip_header_len + udp_len) as u16);
            ip.update_checksum();
            (IpAddr::V4(ip.dst()), IpAddr::V4(src))
        } else {
            let mut ip = Ipv6Packet::new(ip_bytes).map_err(io::Error::from)?;
            let src = match reply_src.ip() {
                IpAddr::V6(addr) => addr,
                IpAddr::V4(_) => unreachable!("family checked above"),
            };
            ip.set_src(src);
            ip.set_payload_len(udp_len as u16);
            (IpAddr::V6(ip.dst()), IpAddr::V6(src))
        };

        let mut udp = UdpDatagram::new(udp_bytes).map_err(io::Error::from)?;
        udp.set_src_port(reply_src.port());
        udp.set_len(udp_len as u16);
        udp.update_checksum_with_payload(src_ip, client_ip, payload);

        self.tun.write_gathered(template.as_slice(), payload)?;
        Ok(payload.len())
    }
}

/// Parse an outbound IPv4 datagram, swap its header towards the client and
/// capture the reply template.
pub(crate) fn prepare_ipv4(tun: &Arc<TunInterface>, packet: &mut [u8]) -> Result<UdpFlow, Error> {
    let header_len = Ipv4Packet::new(packet)?.header_len();
    if packet.len() < header_len + UDP_HEADER_LEN {
        return Err(Error::Packet("udp packet too short".into()));
    }

    let (source, destination) = {
        let (ip_bytes, udp_bytes) = packet.split_at_mut(header_len);
        let mut ip = Ipv4Packet::new(ip_bytes)?;
        let mut udp = UdpDatagram::new(udp_bytes)?;

        let source = SocketAddr::new(IpAddr::V4(ip.src()), udp.src_port());
        let destination = SocketAddr::new(IpAddr::V4(ip.dst()), udp.dst_port());

        ip.set_dst(ip.src());
        udp.set_dst_port(udp.src_port());
        (source, destination)
    };

    let template = packet[..header_len + UDP_HEADER_LEN].to_vec();
    let payload = Bytes::copy_from_slice(&packet[header_len + UDP_HEADER_LEN..]);

    Ok(UdpFlow {
        source,
        destination,
        payload,
        write_back: Arc::new(UdpWriteBack::new(tun.clone(), template, header_len, destination)),
    })
}

/// IPv6 variant; `transport_offset` comes from the extension-chain walk.
pub(crate) fn prepare_ipv6(
    tun: &Arc<TunInterface>,
    packet: &mut [u8],
    transport_offset: usize,
) -> Result<UdpFlow, Error> {
    if packet.len() < transport_offset + UDP_HEADER_LEN {
        return Err(Error::Packet("udp packet too short".into()));
    }

    let (source, destination) = {
        let (ip_bytes, udp_bytes) = packet.split_at_mut(transport_offset);
        let mut ip = Ipv6Packet::new(ip_bytes)?;
        let mut udp = UdpDatagram::new(udp_bytes)?;

        let source = SocketAddr::new(IpAddr::V6(ip.src()), udp.src_port());
        let destination = SocketAddr::new(IpAddr::V6(ip.dst()), udp.dst_port());

        ip.set_dst(ip.src());
        udp.set_dst_port(udp.src_port());
        (source, destination)
    };

    let template = packet[..transport_offset + UDP_HEADER_LEN].to_vec();
    let payload = Bytes::copy_from_slice(&packet[transport_offset + UDP_HEADER_LEN..]);

    Ok(UdpFlow {
        source,
        destination,
        payload,
        write_back: Arc::new(UdpWriteBack::new(
            tun.clone(),
            template,
            transport_offset,
            destination,
        )),
    })
}
