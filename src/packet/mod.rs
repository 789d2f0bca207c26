//! Raw IP packet construction and repair.
//!
//! The session data plane re-wraps proxied UDP replies as IP packets before
//! pushing them into the client tunnel; the TCP host paths synthesize RST and
//! ICMP unreachable replies from here as well.

mod checksum;

pub use checksum::internet_checksum;

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use thiserror::Error;

pub const IPV4_HEADER_MIN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const TCP_HEADER_MIN: usize = 20;
const ICMP_HEADER_LEN: usize = 8;

/// ICMPv4 Destination Unreachable embeds at most this much of the original.
const UNREACHABLE_EMBED_MAX: usize = 28;

const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_RST: u8 = 0x04;
const TCP_FLAG_ACK: u8 = 0x10;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),

    #[error("invalid packet length: {0}")]
    InvalidLength(usize),
}

/// Wrap a UDP payload in a ready-to-send IP packet.
pub fn build_udp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    match (src, dst) {
        (SocketAddr::V4(s), SocketAddr::V4(d)) => build_udp_v4(s, d, payload),
        (SocketAddr::V6(s), SocketAddr::V6(d)) => build_udp_v6(s, d, payload),
        _ => Err(PacketError::Unsupported("mixed address families")),
    }
}

fn build_udp_v4(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_MIN + udp_len;
    if total_len > u16::MAX as usize {
        return Err(PacketError::InvalidLength(total_len));
    }

    let mut packet = vec![0u8; total_len];
    write_ipv4_header(&mut packet, *src.ip(), *dst.ip(), PROTO_UDP, total_len as u16);

    let udp = &mut packet[IPV4_HEADER_MIN..];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    let pseudo = checksum::pseudo_sum_v4(*src.ip(), *dst.ip(), PROTO_UDP, udp_len as u16);
    let mut udp_checksum = checksum::checksum_with_pseudo(pseudo, &packet[IPV4_HEADER_MIN..]);
    if udp_checksum == 0 {
        // RFC 768: an all-zero field means "no checksum"
        udp_checksum = 0xffff;
    }
    packet[IPV4_HEADER_MIN + 6..IPV4_HEADER_MIN + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    Ok(packet)
}

fn build_udp_v6(
    src: SocketAddrV6,
    dst: SocketAddrV6,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    if udp_len > u16::MAX as usize {
        return Err(PacketError::InvalidLength(udp_len));
    }
    let total_len = IPV6_HEADER_LEN + udp_len;

    let mut packet = vec![0u8; total_len];
    packet[0] = 0x60;
    packet[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    packet[6] = PROTO_UDP;
    packet[7] = 64;
    packet[8..24].copy_from_slice(&src.ip().octets());
    packet[24..40].copy_from_slice(&dst.ip().octets());

    let udp = &mut packet[IPV6_HEADER_LEN..];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    let pseudo = checksum::pseudo_sum_v6(src.ip(), dst.ip(), PROTO_UDP, udp_len as u32);
    let mut udp_checksum = checksum::checksum_with_pseudo(pseudo, &packet[IPV6_HEADER_LEN..]);
    if udp_checksum == 0 {
        udp_checksum = 0xffff;
    }
    packet[IPV6_HEADER_LEN + 6..IPV6_HEADER_LEN + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    Ok(packet)
}

fn write_ipv4_header(
    packet: &mut [u8],
    src: std::net::Ipv4Addr,
    dst: std::net::Ipv4Addr,
    protocol: u8,
    total_len: u16,
) {
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&total_len.to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    let header_checksum = internet_checksum(&packet[..IPV4_HEADER_MIN]);
    packet[10..12].copy_from_slice(&header_checksum.to_be_bytes());
}

/// Recompute the IP header checksum (IPv4) and the embedded transport
/// checksum after a packet has been mutated in place.
pub fn update_checksums(packet: &mut [u8]) -> Result<(), PacketError> {
    if packet.is_empty() {
        return Err(PacketError::InvalidLength(0));
    }
    match packet[0] >> 4 {
        4 => update_checksums_v4(packet),
        6 => update_checksums_v6(packet),
        _ => Err(PacketError::Unsupported("unknown IP version")),
    }
}

fn update_checksums_v4(packet: &mut [u8]) -> Result<(), PacketError> {
    if packet.len() < IPV4_HEADER_MIN {
        return Err(PacketError::InvalidLength(packet.len()));
    }
    let header_len = usize::from(packet[0] & 0x0f) * 4;
    let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    if header_len < IPV4_HEADER_MIN || total_len < header_len || packet.len() < total_len {
        return Err(PacketError::InvalidLength(packet.len()));
    }

    packet[10] = 0;
    packet[11] = 0;
    let header_checksum = internet_checksum(&packet[..header_len]);
    packet[10..12].copy_from_slice(&header_checksum.to_be_bytes());

    let protocol = packet[9];
    let src = std::net::Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = std::net::Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let segment_len = total_len - header_len;

    let checksum_offset = match protocol {
        PROTO_UDP => 6,
        PROTO_TCP => 16,
        PROTO_ICMP => 2,
        _ => return Ok(()),
    };
    if segment_len < checksum_offset + 2 {
        return Err(PacketError::InvalidLength(segment_len));
    }

    let start = header_len;
    packet[start + checksum_offset] = 0;
    packet[start + checksum_offset + 1] = 0;

    let segment = &packet[start..total_len];
    let transport_checksum = if protocol == PROTO_ICMP {
        internet_checksum(segment)
    } else {
        let pseudo = checksum::pseudo_sum_v4(src, dst, protocol, segment_len as u16);
        checksum::checksum_with_pseudo(pseudo, segment)
    };
    let transport_checksum = if protocol == PROTO_UDP && transport_checksum == 0 {
        0xffff
    } else {
        transport_checksum
    };
    packet[start + checksum_offset..start + checksum_offset + 2]
        .copy_from_slice(&transport_checksum.to_be_bytes());
    Ok(())
}

fn update_checksums_v6(packet: &mut [u8]) -> Result<(), PacketError> {
    if packet.len() < IPV6_HEADER_LEN {
        return Err(PacketError::InvalidLength(packet.len()));
    }
    let payload_len = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
    if packet.len() < IPV6_HEADER_LEN + payload_len {
        return Err(PacketError::InvalidLength(packet.len()));
    }
    let protocol = packet[6];
    let checksum_offset = match protocol {
        PROTO_UDP => 6,
        PROTO_TCP => 16,
        _ => return Ok(()),
    };
    if payload_len < checksum_offset + 2 {
        return Err(PacketError::InvalidLength(payload_len));
    }

    let src = ipv6_at(packet, 8);
    let dst = ipv6_at(packet, 24);
    let start = IPV6_HEADER_LEN;
    packet[start + checksum_offset] = 0;
    packet[start + checksum_offset + 1] = 0;

    let pseudo = checksum::pseudo_sum_v6(&src, &dst, protocol, payload_len as u32);
    let mut transport_checksum =
        checksum::checksum_with_pseudo(pseudo, &packet[start..start + payload_len]);
    if protocol == PROTO_UDP && transport_checksum == 0 {
        transport_checksum = 0xffff;
    }
    packet[start + checksum_offset..start + checksum_offset + 2]
        .copy_from_slice(&transport_checksum.to_be_bytes());
    Ok(())
}

fn ipv6_at(packet: &[u8], offset: usize) -> std::net::Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&packet[offset..offset + 16]);
    std::net::Ipv6Addr::from(octets)
}

/// Synthesize an ICMPv4 Destination Unreachable reply to `original`,
/// embedding its leading bytes as required by RFC 792.
pub fn build_unreachable_reply(original: &[u8], code: u8) -> Result<Vec<u8>, PacketError> {
    if original.len() < IPV4_HEADER_MIN {
        return Err(PacketError::InvalidLength(original.len()));
    }
    if original[0] >> 4 != 4 {
        return Err(PacketError::Unsupported("ICMP unreachable requires IPv4"));
    }

    let embed_len = original.len().min(UNREACHABLE_EMBED_MAX);
    let total_len = IPV4_HEADER_MIN + ICMP_HEADER_LEN + embed_len;
    let src = std::net::Ipv4Addr::new(original[12], original[13], original[14], original[15]);
    let dst = std::net::Ipv4Addr::new(original[16], original[17], original[18], original[19]);

    let mut packet = vec![0u8; total_len];
    // Reply flows from the original destination back to the sender
    write_ipv4_header(&mut packet, dst, src, PROTO_ICMP, total_len as u16);

    let icmp = &mut packet[IPV4_HEADER_MIN..];
    icmp[0] = 3;
    icmp[1] = code;
    icmp[ICMP_HEADER_LEN..].copy_from_slice(&original[..embed_len]);
    let icmp_checksum = internet_checksum(&packet[IPV4_HEADER_MIN..]);
    packet[IPV4_HEADER_MIN + 2..IPV4_HEADER_MIN + 4]
        .copy_from_slice(&icmp_checksum.to_be_bytes());

    Ok(packet)
}

/// Synthesize a TCP RST answering `original`, with RFC 793 reset sequence
/// semantics.
pub fn build_tcp_reset(original: &[u8]) -> Result<Vec<u8>, PacketError> {
    if original.len() < IPV4_HEADER_MIN {
        return Err(PacketError::InvalidLength(original.len()));
    }
    let (src, dst, tcp) = match original[0] >> 4 {
        4 => {
            let header_len = usize::from(original[0] & 0x0f) * 4;
            if original[9] != PROTO_TCP {
                return Err(PacketError::Unsupported("not a TCP packet"));
            }
            if original.len() < header_len + TCP_HEADER_MIN {
                return Err(PacketError::InvalidLength(original.len()));
            }
            let src = SocketAddr::from((
                std::net::Ipv4Addr::new(original[12], original[13], original[14], original[15]),
                0,
            ));
            let dst = SocketAddr::from((
                std::net::Ipv4Addr::new(original[16], original[17], original[18], original[19]),
                0,
            ));
            (src, dst, &original[header_len..])
        }
        6 => {
            if original.len() < IPV6_HEADER_LEN + TCP_HEADER_MIN {
                return Err(PacketError::InvalidLength(original.len()));
            }
            if original[6] != PROTO_TCP {
                return Err(PacketError::Unsupported("not a TCP packet"));
            }
            let src = SocketAddr::from((ipv6_at(original, 8), 0));
            let dst = SocketAddr::from((ipv6_at(original, 24), 0));
            (src, dst, &original[IPV6_HEADER_LEN..])
        }
        _ => return Err(PacketError::Unsupported("unknown IP version")),
    };

    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    let seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
    let ack_no = u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]);
    let flags = tcp[13];

    let (out_flags, out_seq, out_ack) = if flags & TCP_FLAG_SYN != 0 && flags & TCP_FLAG_ACK == 0 {
        (TCP_FLAG_RST | TCP_FLAG_ACK, 0, seq.wrapping_add(1))
    } else {
        (TCP_FLAG_RST, ack_no, ack_no)
    };

    let mut segment = [0u8; TCP_HEADER_MIN];
    segment[0..2].copy_from_slice(&dst_port.to_be_bytes());
    segment[2..4].copy_from_slice(&src_port.to_be_bytes());
    segment[4..8].copy_from_slice(&out_seq.to_be_bytes());
    segment[8..12].copy_from_slice(&out_ack.to_be_bytes());
    segment[12] = (TCP_HEADER_MIN as u8 / 4) << 4;
    segment[13] = out_flags;

    match (dst, src) {
        (SocketAddr::V4(reply_src), SocketAddr::V4(reply_dst)) => {
            let total_len = IPV4_HEADER_MIN + TCP_HEADER_MIN;
            let mut packet = vec![0u8; total_len];
            write_ipv4_header(
                &mut packet,
                *reply_src.ip(),
                *reply_dst.ip(),
                PROTO_TCP,
                total_len as u16,
            );
            let pseudo = checksum::pseudo_sum_v4(
                *reply_src.ip(),
                *reply_dst.ip(),
                PROTO_TCP,
                TCP_HEADER_MIN as u16,
            );
            let tcp_checksum = checksum::checksum_with_pseudo(pseudo, &segment);
            segment[16..18].copy_from_slice(&tcp_checksum.to_be_bytes());
            packet[IPV4_HEADER_MIN..].copy_from_slice(&segment);
            Ok(packet)
        }
        (SocketAddr::V6(reply_src), SocketAddr::V6(reply_dst)) => {
            let mut packet = vec![0u8; IPV6_HEADER_LEN + TCP_HEADER_MIN];
            packet[0] = 0x60;
            packet[4..6].copy_from_slice(&(TCP_HEADER_MIN as u16).to_be_bytes());
            packet[6] = PROTO_TCP;
            packet[7] = 64;
            packet[8..24].copy_from_slice(&reply_src.ip().octets());
            packet[24..40].copy_from_slice(&reply_dst.ip().octets());
            let pseudo = checksum::pseudo_sum_v6(
                reply_src.ip(),
                reply_dst.ip(),
                PROTO_TCP,
                TCP_HEADER_MIN as u32,
            );
            let tcp_checksum = checksum::checksum_with_pseudo(pseudo, &segment);
            segment[16..18].copy_from_slice(&tcp_checksum.to_be_bytes());
            packet[IPV6_HEADER_LEN..].copy_from_slice(&segment);
            Ok(packet)
        }
        _ => Err(PacketError::Unsupported("mixed address families")),
    }
}

/// Split the leading IP packet off a length-prefixed stream buffer.
///
/// The packet length is the big-endian u16 at offset 2 (the IPv4 total-length
/// field). Returns `None` while the buffer holds an incomplete packet.
pub fn next_packet(buffer: &[u8]) -> Result<Option<(&[u8], &[u8])>, PacketError> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let len = usize::from(u16::from_be_bytes([buffer[2], buffer[3]]));
    if len < IPV4_HEADER_MIN {
        return Err(PacketError::InvalidLength(len));
    }
    if buffer.len() < len {
        return Ok(None);
    }
    Ok(Some(buffer.split_at(len)))
}
