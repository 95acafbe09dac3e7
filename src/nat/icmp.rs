//! Local ICMP echo responder.
//!
//! The proxy path cannot carry ICMP, so echo requests are answered in
//! place: addresses swapped, type flipped to the reply, checksums redone.
//! Everything that is not an echo request is dropped.

use crate::common::Error;
use crate::nat::packet::{
    Icmpv4Packet, Icmpv6Packet, Ipv4Packet, Ipv6Packet, ICMPV4_ECHO, ICMPV4_ECHO_REPLY,
    ICMPV6_ECHO_REPLY, ICMPV6_ECHO_REQUEST,
};

/// Rewrite an ICMPv4 echo request into its reply, in place.
/// Returns false when the message is not an echo request (drop it).
pub fn icmpv4_echo_reply(packet: &mut [u8]) -> Result<bool, Error> {
    let header_len = {
        let ip = Ipv4Packet::new(packet)?;
        ip.header_len()
    };
    let (ip_bytes, icmp_bytes) = packet.split_at_mut(header_len);
    let mut icmp = Icmpv4Packet::new(icmp_bytes)?;
    if icmp.icmp_type() != ICMPV4_ECHO || icmp.code() != 0 {
        return Ok(false);
    }

    let mut ip = Ipv4Packet::new(ip_bytes)?;
    let src = ip.src();
    ip.set_src(ip.dst());
    ip.set_dst(src);
    ip.update_checksum();

    icmp.set_type(ICMPV4_ECHO_REPLY);
    icmp.update_checksum();
    Ok(true)
}

/// Rewrite an ICMPv6 echo request into its reply, in place.
/// `transport_offset` is the ICMPv6 offset from the extension-chain walk.
pub fn icmpv6_echo_reply(packet: &mut [u8], transport_offset: usize) -> Result<bool, Error> {
    let (ip_bytes, icmp_bytes) = packet.split_at_mut(transport_offset);
    let mut icmp = Icmpv6Packet::new(icmp_bytes)?;
    if icmp.icmp_type() != ICMPV6_ECHO_REQUEST || icmp.code() != 0 {
        return Ok(false);
    }

    let mut ip = Ipv6Packet::new(ip_bytes)?;
    let src = ip.src();
    ip.set_src(ip.dst());
    ip.set_dst(src);

    icmp.set_type(ICMPV6_ECHO_REPLY);
    icmp.update_checksum(ip.src(), ip.dst());
    Ok(true)
}
