//! IPv4: header codec, receive validation, routing and fragmentation.
//!
//! Inbound packets are validated in order (length, version, IHL, total
//! length, header checksum, TTL).  Anything malformed is dropped silently and
//! counted in [`IpStats`]; the stack never surfaces a malformed packet as an
//! error.
//!
//! Outbound datagrams larger than the MTU are split on 8-byte boundaries
//! when fragmentation is enabled; otherwise the send fails with
//! [`NetError::MessageTooLarge`].

use slopnet_lib::klog_debug;

use crate::checksum::internet_checksum;
use crate::types::{IpProtocol, Ipv4Addr, NetError};

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV4_VERSION: u8 = 4;
/// Don't Fragment.
pub const IPV4_FLAG_DF: u16 = 0x4000;
/// More Fragments.
pub const IPV4_FLAG_MF: u16 = 0x2000;
const IPV4_FRAG_OFFSET_MASK: u16 = 0x1fff;

// =============================================================================
// Header
// =============================================================================

/// Parsed IPv4 header.  Multi-byte fields are in host order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes (IHL × 4).
    pub header_len: u8,
    pub tos: u8,
    pub total_len: u16,
    pub identification: u16,
    /// Flags (top 3 bits) and fragment offset in 8-byte units.
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Header for an unfragmented datagram carrying `payload_len` bytes.
    pub const fn new(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        identification: u16,
        ttl: u8,
        payload_len: usize,
    ) -> Self {
        Self {
            header_len: IPV4_HEADER_LEN as u8,
            tos: 0,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            identification,
            flags_fragment: 0,
            ttl,
            protocol: protocol as u8,
            checksum: 0,
            src,
            dst,
        }
    }

    /// Fragment offset in bytes.
    #[inline]
    pub const fn fragment_offset(&self) -> usize {
        ((self.flags_fragment & IPV4_FRAG_OFFSET_MASK) as usize) * 8
    }

    #[inline]
    pub const fn more_fragments(&self) -> bool {
        self.flags_fragment & IPV4_FLAG_MF != 0
    }

    /// `true` for any piece of a fragmented datagram.
    #[inline]
    pub const fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    #[inline]
    pub const fn payload_len(&self) -> usize {
        self.total_len as usize - self.header_len as usize
    }

    #[inline]
    pub fn ip_protocol(&self) -> Option<IpProtocol> {
        IpProtocol::from_u8(self.protocol)
    }

    /// Validate and parse the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, IpDrop> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(IpDrop::TooShort);
        }
        let version = data[0] >> 4;
        if version != IPV4_VERSION {
            return Err(IpDrop::BadVersion);
        }
        let header_len = ((data[0] & 0x0f) as usize) * 4;
        if header_len < IPV4_HEADER_LEN || data.len() < header_len {
            return Err(IpDrop::BadHeaderLength);
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]);
        if (total_len as usize) < header_len || total_len as usize > data.len() {
            return Err(IpDrop::BadTotalLength);
        }
        if internet_checksum(&data[..header_len]) != 0 {
            return Err(IpDrop::BadChecksum);
        }
        if data[8] == 0 {
            return Err(IpDrop::ZeroTtl);
        }
        let mut src = [0u8; 4];
        let mut dst = [0u8; 4];
        src.copy_from_slice(&data[12..16]);
        dst.copy_from_slice(&data[16..20]);
        Ok(Self {
            header_len: header_len as u8,
            tos: data[1],
            total_len,
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags_fragment: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src: Ipv4Addr(src),
            dst: Ipv4Addr(dst),
        })
    }

    /// Write a 20-byte header (no options) with a freshly computed checksum.
    pub fn write(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < IPV4_HEADER_LEN {
            return None;
        }
        out[0] = (IPV4_VERSION << 4) | (IPV4_HEADER_LEN / 4) as u8;
        out[1] = self.tos;
        out[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&[0, 0]);
        out[12..16].copy_from_slice(&self.src.0);
        out[16..20].copy_from_slice(&self.dst.0);
        let sum = internet_checksum(&out[..IPV4_HEADER_LEN]);
        out[10..12].copy_from_slice(&sum.to_be_bytes());
        Some(IPV4_HEADER_LEN)
    }
}

/// Borrowed view of a received packet: parsed header plus the payload slice
/// of the frame that carried it.  Lives for one receive dispatch only.
#[derive(Clone, Copy, Debug)]
pub struct IpPacketView<'a> {
    pub header: Ipv4Header,
    pub payload: &'a [u8],
}

impl<'a> IpPacketView<'a> {
    /// Parse `data`, trimming Ethernet padding past `total_len`.
    pub fn parse(data: &'a [u8]) -> Result<Self, IpDrop> {
        let header = Ipv4Header::parse(data)?;
        let payload = &data[header.header_len as usize..header.total_len as usize];
        Ok(Self { header, payload })
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Why an inbound packet was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpDrop {
    TooShort,
    BadVersion,
    BadHeaderLength,
    BadTotalLength,
    BadChecksum,
    ZeroTtl,
    NotForUs,
    UnknownProtocol,
    /// Fragment arrived with reassembly disabled, or the reassembler is full.
    Fragment,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpStats {
    pub rx_packets: u32,
    pub rx_delivered: u32,
    pub rx_malformed: u32,
    pub rx_bad_checksum: u32,
    pub rx_not_for_us: u32,
    pub rx_unknown_protocol: u32,
    pub rx_fragments: u32,
    pub rx_fragments_dropped: u32,
    pub rx_reassembled: u32,
    pub tx_packets: u32,
    pub tx_fragments: u32,
    pub tx_failed: u32,
}

impl IpStats {
    pub fn record_drop(&mut self, reason: IpDrop) {
        klog_debug!("ipv4: drop ({:?})", reason);
        match reason {
            IpDrop::TooShort
            | IpDrop::BadVersion
            | IpDrop::BadHeaderLength
            | IpDrop::BadTotalLength
            | IpDrop::ZeroTtl => self.rx_malformed += 1,
            IpDrop::BadChecksum => self.rx_bad_checksum += 1,
            IpDrop::NotForUs => self.rx_not_for_us += 1,
            IpDrop::UnknownProtocol => self.rx_unknown_protocol += 1,
            IpDrop::Fragment => self.rx_fragments_dropped += 1,
        }
    }
}

// =============================================================================
// Addressing and routing
// =============================================================================

/// `true` if a packet for `dst` should be delivered locally.
///
/// While unconfigured every destination is accepted so DHCP offers sent to
/// the offered address still arrive.
pub fn accepts_destination(dst: Ipv4Addr, our_ip: Ipv4Addr, mask: Ipv4Addr) -> bool {
    if !our_ip.is_valid() {
        return true;
    }
    dst == our_ip
        || dst.is_broadcast()
        || dst == Ipv4Addr::ALL_HOSTS
        || (mask.is_valid() && dst == our_ip.subnet_broadcast(mask))
}

/// Next-hop IP for `dst`: the destination itself when on-link, otherwise the
/// gateway.
pub fn next_hop(
    dst: Ipv4Addr,
    our_ip: Ipv4Addr,
    mask: Ipv4Addr,
    gateway: Ipv4Addr,
) -> Result<Ipv4Addr, NetError> {
    if dst.is_broadcast() || dst.is_multicast() || Ipv4Addr::in_subnet(dst, our_ip, mask) {
        return Ok(dst);
    }
    if !gateway.is_valid() {
        return Err(NetError::NoRoute);
    }
    Ok(gateway)
}

// =============================================================================
// Fragmentation
// =============================================================================

/// One piece of an outbound datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    /// Offset into the transport payload, in bytes.
    pub offset: usize,
    pub len: usize,
    pub more: bool,
}

/// Split `payload_len` bytes into fragments that fit `mtu`.
///
/// Every fragment but the last carries a multiple of 8 bytes.
pub fn fragments(payload_len: usize, mtu: usize) -> impl Iterator<Item = Fragment> {
    let max_chunk = ((mtu - IPV4_HEADER_LEN) / 8) * 8;
    let mut offset = 0usize;
    let mut done = false;
    core::iter::from_fn(move || {
        if done {
            return None;
        }
        let remaining = payload_len - offset;
        let len = remaining.min(max_chunk);
        let frag = Fragment {
            offset,
            len,
            more: len < remaining,
        };
        offset += len;
        done = !frag.more;
        Some(frag)
    })
}

impl Fragment {
    /// `flags_fragment` field value for this piece.
    pub const fn flags_fragment(&self) -> u16 {
        let mut field = (self.offset / 8) as u16 & IPV4_FRAG_OFFSET_MASK;
        if self.more {
            field |= IPV4_FLAG_MF;
        }
        field
    }
}
