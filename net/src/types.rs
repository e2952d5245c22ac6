//! Type-safe network primitives for the slopnet stack.
//!
//! Newtype wrappers keep addresses, ports and protocol numbers from being
//! confused with one another or with raw byte arrays.  Every type here is a
//! small `Copy` value passed by value; nothing aliases stack state.

use core::fmt;
use core::str::FromStr;

use crate::arp::ArpError;
use crate::dhcp::DhcpError;
use crate::dns::DnsError;
use crate::llip::LinkLocalError;
use crate::tcp::TcpError;

// =============================================================================
// Address newtypes
// =============================================================================

/// IPv4 address stored in **network byte order** (`[u8; 4]`).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// `0.0.0.0`, the unconfigured address.
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);
    /// `255.255.255.255`, the limited broadcast address.
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);
    /// `127.0.0.1`, the loopback address.
    pub const LOCALHOST: Self = Self([127, 0, 0, 1]);
    /// `224.0.0.1`, the all-hosts multicast group.
    pub const ALL_HOSTS: Self = Self([224, 0, 0, 1]);

    #[inline]
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    /// Construct from a big-endian `u32`.
    #[inline]
    pub const fn from_u32_be(val: u32) -> Self {
        Self(val.to_be_bytes())
    }

    /// Return the address as a big-endian `u32`.
    #[inline]
    pub const fn to_u32_be(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// `true` for any address other than `0.0.0.0`.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        !self.is_unspecified()
    }

    /// `true` if the address is in the `127.0.0.0/8` loopback range.
    #[inline]
    pub const fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }

    /// `true` if the address is `255.255.255.255`.
    #[inline]
    pub const fn is_broadcast(&self) -> bool {
        self.to_u32_be() == u32::MAX
    }

    /// `true` if the address is in the multicast range `224.0.0.0/4`.
    #[inline]
    pub const fn is_multicast(&self) -> bool {
        self.0[0] >= 224 && self.0[0] <= 239
    }

    /// `true` if the address is in `169.254.0.0/16`.
    #[inline]
    pub const fn is_link_local(&self) -> bool {
        self.0[0] == 169 && self.0[1] == 254
    }

    /// `true` if the address is `0.0.0.0`.
    #[inline]
    pub const fn is_unspecified(&self) -> bool {
        self.to_u32_be() == 0
    }

    /// `true` if `addr` falls within the subnet defined by `network` and `mask`.
    #[inline]
    pub const fn in_subnet(addr: Ipv4Addr, network: Ipv4Addr, mask: Ipv4Addr) -> bool {
        let a = addr.to_u32_be();
        let n = network.to_u32_be();
        let m = mask.to_u32_be();
        (a & m) == (n & m)
    }

    /// The directed broadcast address of the subnet `self` belongs to.
    #[inline]
    pub const fn subnet_broadcast(self, mask: Ipv4Addr) -> Ipv4Addr {
        Self::from_u32_be(self.to_u32_be() | !mask.to_u32_be())
    }

    /// Return the raw bytes in network byte order.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Parse a dotted-decimal literal such as `b"10.0.2.3"`.
    pub fn parse_bytes(s: &[u8]) -> Option<Self> {
        let mut octets = [0u8; 4];
        let mut octet_idx = 0usize;
        let mut current: u16 = 0;
        let mut digit_count = 0usize;

        for &b in s {
            if b == b'.' {
                if digit_count == 0 || octet_idx >= 3 || current > 255 {
                    return None;
                }
                octets[octet_idx] = current as u8;
                octet_idx += 1;
                current = 0;
                digit_count = 0;
            } else if b.is_ascii_digit() {
                current = current * 10 + (b - b'0') as u16;
                digit_count += 1;
                if digit_count > 3 {
                    return None;
                }
            } else {
                return None;
            }
        }

        if digit_count == 0 || octet_idx != 3 || current > 255 {
            return None;
        }
        octets[3] = current as u8;
        Some(Self(octets))
    }
}

impl fmt::Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl FromStr for Ipv4Addr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_bytes(s.as_bytes()).ok_or(AddrParseError)
    }
}

/// Port number in **host byte order**.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Port(pub u16);

impl Port {
    #[inline]
    pub const fn new(val: u16) -> Self {
        Self(val)
    }

    /// Serialize to big-endian bytes for the wire.
    #[inline]
    pub const fn to_network_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Deserialize from big-endian wire bytes.
    #[inline]
    pub const fn from_network_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    /// `true` if the port is in the IANA ephemeral range (49152–65535).
    #[inline]
    pub const fn is_ephemeral(&self) -> bool {
        self.0 >= 49152
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port({})", self.0)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ethernet MAC address (6 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// `ff:ff:ff:ff:ff:ff`, the broadcast address.
    pub const BROADCAST: Self = Self([0xff; 6]);
    /// `00:00:00:00:00:00`, the zero / unset address.
    pub const ZERO: Self = Self([0; 6]);

    #[inline]
    pub const fn is_broadcast(&self) -> bool {
        matches!(self.0, [0xff, 0xff, 0xff, 0xff, 0xff, 0xff])
    }

    /// `true` if the least-significant bit of the first octet is set (multicast).
    #[inline]
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        matches!(self.0, [0, 0, 0, 0, 0, 0])
    }

    /// RFC 1112 mapping of an IPv4 multicast group onto `01:00:5e:xx:xx:xx`.
    #[inline]
    pub const fn ipv4_multicast(ip: Ipv4Addr) -> Self {
        Self([0x01, 0x00, 0x5e, ip.0[1] & 0x7f, ip.0[2], ip.0[3]])
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = AddrParseError;

    /// Accepts six hex octets separated by `:` or `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut count = 0usize;
        for part in s.split([':', '-']) {
            if count >= 6 || part.is_empty() || part.len() > 2 {
                return Err(AddrParseError);
            }
            out[count] = u8::from_str_radix(part, 16).map_err(|_| AddrParseError)?;
            count += 1;
        }
        if count != 6 {
            return Err(AddrParseError);
        }
        Ok(Self(out))
    }
}

/// Failure to parse a textual MAC or IPv4 address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddrParseError;

impl fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address syntax")
    }
}

/// An IPv4 address and port pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockAddr {
    pub ip: Ipv4Addr,
    pub port: Port,
}

impl SockAddr {
    #[inline]
    pub const fn new(ip: Ipv4Addr, port: Port) -> Self {
        Self { ip, port }
    }
}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

// =============================================================================
// EtherType and IpProtocol enums
// =============================================================================

/// Ethernet frame type field values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EtherType {
    /// IPv4 (`0x0800`).
    Ipv4 = 0x0800,
    /// ARP (`0x0806`).
    Arp = 0x0806,
}

impl EtherType {
    /// Parse from a raw `u16` value.  Returns `None` for unknown types.
    #[inline]
    pub const fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x0800 => Some(Self::Ipv4),
            0x0806 => Some(Self::Arp),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// IP protocol number field values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpProtocol {
    /// ICMP (`1`).
    Icmp = 1,
    /// TCP (`6`).
    Tcp = 6,
    /// UDP (`17`).
    Udp = 17,
}

impl IpProtocol {
    /// Parse from a raw `u8` value.  Returns `None` for unknown protocols.
    #[inline]
    pub const fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::Icmp),
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Icmp => write!(f, "ICMP"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

// =============================================================================
// NetError
// =============================================================================

/// Error type returned by every fallible stack operation.
///
/// Layer-specific failures are wrapped so the caller can match on the layer
/// without losing the detail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    /// The next hop MAC is not resolved yet; retry later.
    WouldBlock,
    /// A bounded wait ran out.
    Timeout,
    /// ARP retries exhausted for the next hop.
    Unreachable,
    /// Off-subnet destination with no gateway configured.
    NoRoute,
    /// UDP port already bound, or TCP port already listening.
    PortInUse,
    /// Every connection pool slot is in use.
    PoolExhausted,
    /// Send ring or driver transmit buffer is full.
    BufferFull,
    /// Payload does not fit the MTU (fragmentation off) or the caller's buffer.
    MessageTooLarge,
    /// A fixed-size table (ARP, reassembly, ports) has no free entry.
    ResourceExhausted,
    /// The driver reports the link is down.
    LinkDown,
    /// No IP address configured yet.
    Unconfigured,
    /// A layer needed for the call was disabled in `StackConfig`.
    LayerDisabled,
    /// The connection handle does not name a live connection.
    NotConnected,
    InvalidArgument,
    /// An inbound packet or reply failed to parse.
    Malformed,
    Arp(ArpError),
    Tcp(TcpError),
    Dhcp(DhcpError),
    Dns(DnsError),
    LinkLocal(LinkLocalError),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "next hop not resolved yet"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Unreachable => write!(f, "destination unreachable"),
            Self::NoRoute => write!(f, "no route to destination"),
            Self::PortInUse => write!(f, "port already in use"),
            Self::PoolExhausted => write!(f, "connection pool exhausted"),
            Self::BufferFull => write!(f, "buffer full"),
            Self::MessageTooLarge => write!(f, "message too large"),
            Self::ResourceExhausted => write!(f, "table full"),
            Self::LinkDown => write!(f, "link down"),
            Self::Unconfigured => write!(f, "no IP address configured"),
            Self::LayerDisabled => write!(f, "protocol layer disabled"),
            Self::NotConnected => write!(f, "no such connection"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Malformed => write!(f, "malformed packet"),
            Self::Arp(e) => write!(f, "arp: {}", e),
            Self::Tcp(e) => write!(f, "tcp: {}", e),
            Self::Dhcp(e) => write!(f, "dhcp: {}", e),
            Self::Dns(e) => write!(f, "dns: {}", e),
            Self::LinkLocal(e) => write!(f, "link-local: {}", e),
        }
    }
}

impl NetError {
    /// Stable numeric code used in error events.  The high byte names
    /// the layer, the low byte the failure.
    pub const fn code(&self) -> u16 {
        match self {
            Self::WouldBlock => 0x0001,
            Self::Timeout => 0x0002,
            Self::Unreachable => 0x0003,
            Self::NoRoute => 0x0004,
            Self::PortInUse => 0x0005,
            Self::PoolExhausted => 0x0006,
            Self::BufferFull => 0x0007,
            Self::MessageTooLarge => 0x0008,
            Self::ResourceExhausted => 0x0009,
            Self::LinkDown => 0x000a,
            Self::Unconfigured => 0x000b,
            Self::LayerDisabled => 0x000c,
            Self::NotConnected => 0x000d,
            Self::InvalidArgument => 0x000e,
            Self::Malformed => 0x000f,
            Self::Arp(e) => 0x0100 | *e as u16,
            Self::Tcp(e) => 0x0200 | *e as u16,
            Self::Dhcp(e) => 0x0300 | *e as u16,
            Self::Dns(e) => 0x0400 | e.discriminant(),
            Self::LinkLocal(e) => 0x0500 | *e as u16,
        }
    }
}

impl From<ArpError> for NetError {
    fn from(e: ArpError) -> Self {
        Self::Arp(e)
    }
}

impl From<TcpError> for NetError {
    fn from(e: TcpError) -> Self {
        Self::Tcp(e)
    }
}

impl From<DhcpError> for NetError {
    fn from(e: DhcpError) -> Self {
        Self::Dhcp(e)
    }
}

impl From<DnsError> for NetError {
    fn from(e: DnsError) -> Self {
        Self::Dns(e)
    }
}

impl From<LinkLocalError> for NetError {
    fn from(e: LinkLocalError) -> Self {
        Self::LinkLocal(e)
    }
}
