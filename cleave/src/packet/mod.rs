//! IPv4/TCP packet carrier and codec.
//!
//! A [`Packet`] owns the raw bytes of one captured or fabricated datagram
//! together with the platform address blob needed to reinject it and the
//! decoded header metadata. Ownership is exclusive: a packet moves through
//! the pipeline and ends its life in `adapter.send`, `adapter.drop`, or the
//! shutdown drain.

pub mod checksum;

use thiserror::Error;

pub const PROTO_TCP: u8 = 6;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet too short")]
    TooShort,
    #[error("not ipv4")]
    NotIpv4,
    #[error("not tcp")]
    NotTcp,
    #[error("ipv4 fragment")]
    Ipv4Fragment,
}

/// Raw platform address bytes carried from recv to send.
///
/// Sized for the largest consumer (the WinDivert address structure); other
/// backends ignore it. Kept out of `Meta` so header rewrites never touch it.
#[derive(Clone)]
pub struct Address {
    pub data: [u8; 256],
}

impl Default for Address {
    fn default() -> Self {
        Self { data: [0; 256] }
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Address").finish_non_exhaustive()
    }
}

/// Decoded IPv4+TCP header metadata, filled by [`decode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Meta {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub ip_header_len: usize,
    pub tcp_header_len: usize,
    pub payload_offset: usize,
}

/// Provenance of a packet: captured from the kernel, fabricated by us, or
/// not yet classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Source {
    #[default]
    Unknown,
    Captured,
    Injected,
}

#[derive(Debug, Default)]
pub struct Packet {
    pub data: Vec<u8>,
    pub addr: Address,
    pub meta: Meta,
    pub source: Source,
    /// Verdict handle for adapters with per-packet verdicts (NFQUEUE).
    pub nfq_id: u32,
}

impl Packet {
    pub fn captured(data: Vec<u8>) -> Self {
        Self {
            data,
            source: Source::Captured,
            ..Default::default()
        }
    }

    /// TCP payload bytes, empty when the packet is undecoded or payloadless.
    pub fn payload(&self) -> &[u8] {
        if self.meta.payload_offset == 0 || self.meta.payload_offset > self.data.len() {
            return &[];
        }
        &self.data[self.meta.payload_offset..]
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.meta.flags & flag != 0
    }
}

/// Decode an IPv4/TCP datagram into `pkt.meta`.
///
/// Rejects non-IPv4, non-TCP, IPv4 fragments, and any header geometry that
/// would place the payload past the end of the datagram.
pub fn decode(pkt: &mut Packet) -> Result<(), CodecError> {
    let data = &pkt.data;
    if data.len() < 20 {
        return Err(CodecError::TooShort);
    }
    let vihl = data[0];
    if vihl >> 4 != 4 {
        return Err(CodecError::NotIpv4);
    }
    let ihl = usize::from(vihl & 0x0f) * 4;
    if ihl < 20 || data.len() < ihl + 20 {
        return Err(CodecError::TooShort);
    }
    let flags_offset = u16::from_be_bytes([data[6], data[7]]);
    // Fragment offset non-zero or MF set: we never reassemble IP fragments.
    if flags_offset & 0x1fff != 0 || flags_offset & 0x2000 != 0 {
        return Err(CodecError::Ipv4Fragment);
    }
    if data[9] != PROTO_TCP {
        return Err(CodecError::NotTcp);
    }

    let mut meta = Meta {
        proto: PROTO_TCP,
        ip_header_len: ihl,
        ..Meta::default()
    };
    meta.src_ip.copy_from_slice(&data[12..16]);
    meta.dst_ip.copy_from_slice(&data[16..20]);

    let tcp = ihl;
    meta.src_port = u16::from_be_bytes([data[tcp], data[tcp + 1]]);
    meta.dst_port = u16::from_be_bytes([data[tcp + 2], data[tcp + 3]]);
    meta.seq = u32::from_be_bytes([data[tcp + 4], data[tcp + 5], data[tcp + 6], data[tcp + 7]]);
    meta.ack = u32::from_be_bytes([data[tcp + 8], data[tcp + 9], data[tcp + 10], data[tcp + 11]]);

    let data_offset = usize::from(data[tcp + 12] >> 4) * 4;
    if data_offset < 20 || data.len() < tcp + data_offset {
        return Err(CodecError::TooShort);
    }
    meta.flags = data[tcp + 13];
    meta.tcp_header_len = data_offset;
    meta.payload_offset = tcp + data_offset;

    pkt.meta = meta;
    Ok(())
}

pub fn ipv4_id(data: &[u8]) -> u16 {
    if data.len() < 6 {
        return 0;
    }
    u16::from_be_bytes([data[4], data[5]])
}

pub fn set_ipv4_id(data: &mut [u8], id: u16) {
    if data.len() >= 6 {
        data[4..6].copy_from_slice(&id.to_be_bytes());
    }
}

pub fn set_ipv4_total_len(data: &mut [u8], total: u16) {
    if data.len() >= 4 {
        data[2..4].copy_from_slice(&total.to_be_bytes());
    }
}

pub fn set_ipv4_checksum_zero(data: &mut [u8]) {
    if data.len() >= 12 {
        data[10] = 0;
        data[11] = 0;
    }
}

pub fn set_ipv4_checksum(data: &mut [u8], sum: u16) {
    if data.len() >= 12 {
        data[10..12].copy_from_slice(&sum.to_be_bytes());
    }
}

pub fn set_tcp_seq(data: &mut [u8], ip_header_len: usize, seq: u32) {
    if data.len() >= ip_header_len + 8 {
        data[ip_header_len + 4..ip_header_len + 8].copy_from_slice(&seq.to_be_bytes());
    }
}

pub fn set_tcp_flags(data: &mut [u8], ip_header_len: usize, flags: u8) {
    if data.len() >= ip_header_len + 14 {
        data[ip_header_len + 13] = flags;
    }
}

pub fn set_tcp_checksum_zero(data: &mut [u8], ip_header_len: usize) {
    if data.len() >= ip_header_len + 18 {
        data[ip_header_len + 16] = 0;
        data[ip_header_len + 17] = 0;
    }
}

pub fn set_tcp_checksum(data: &mut [u8], ip_header_len: usize, sum: u16) {
    if data.len() >= ip_header_len + 18 {
        data[ip_header_len + 16..ip_header_len + 18].copy_from_slice(&sum.to_be_bytes());
    }
}

/// Software checksum recomputation, usable by any adapter as the fallback
/// for its `calc_checksums` capability.
pub fn recompute_checksums(data: &mut [u8]) {
    if data.len() < 20 {
        return;
    }
    let ip_header_len = usize::from(data[0] & 0x0f) * 4;
    if ip_header_len < 20 || data.len() < ip_header_len + 20 {
        return;
    }
    set_ipv4_checksum_zero(data);
    set_tcp_checksum_zero(data, ip_header_len);
    let ip_sum = checksum::ipv4_checksum(data, ip_header_len);
    let tcp_sum = checksum::tcp_checksum_ipv4(data, ip_header_len);
    set_ipv4_checksum(data, ip_sum);
    set_tcp_checksum(data, ip_header_len, tcp_sum);
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::PROTO_TCP;

    /// Minimal well-formed IPv4/TCP datagram with 20-byte headers.
    pub(crate) fn build_ipv4_tcp(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        seq: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = vec![0u8; 40 + payload.len()];
        buf[0] = 0x45;
        let total = (40 + payload.len()) as u16;
        buf[2..4].copy_from_slice(&total.to_be_bytes());
        buf[4..6].copy_from_slice(&0x1c46u16.to_be_bytes());
        buf[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
        buf[8] = 64;
        buf[9] = PROTO_TCP;
        buf[12..16].copy_from_slice(&src);
        buf[16..20].copy_from_slice(&dst);
        buf[20..22].copy_from_slice(&src_port.to_be_bytes());
        buf[22..24].copy_from_slice(&dst_port.to_be_bytes());
        buf[24..28].copy_from_slice(&seq.to_be_bytes());
        buf[32] = 0x50;
        buf[33] = flags;
        buf[34..36].copy_from_slice(&0xfaf0u16.to_be_bytes());
        buf[40..].copy_from_slice(payload);
        buf
    }
}
