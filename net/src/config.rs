//! Stack configuration.
//!
//! [`StackConfig`] selects which optional layers are compiled into the
//! receive path and carries every tunable.  Defaults match a small board on
//! a home LAN: DHCP addressing, ICMP echo on, fragmentation and reassembly
//! on, DNS on.
//!
//! ```ignore
//! let config = StackConfig::builder()
//!     .static_ipv4(ip, mask, gateway)
//!     .layers(Layers::ICMP | Layers::DNS)
//!     .tcp(TcpParams { max_connections: 2, ..TcpParams::default() })
//!     .build()?;
//! ```

use bitflags::bitflags;

use crate::types::{Ipv4Addr, MacAddr, NetError};

/// Smallest MTU every IPv4 host must accept (RFC 791).
pub const MIN_MTU: u16 = 576;

bitflags! {
    /// Optional protocol layers.  ARP, IPv4, UDP and TCP are always present.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Layers: u8 {
        /// Echo replies, port-unreachable generation and `ping`.
        const ICMP = 1 << 0;
        /// Split outbound datagrams larger than the MTU.
        const FRAGMENTATION = 1 << 1;
        /// Reassemble inbound fragments.
        const REASSEMBLY = 1 << 2;
        const DNS = 1 << 3;
        const DHCP = 1 << 4;
        /// Self-assigned 169.254/16 addresses (RFC 3927).
        const LINK_LOCAL = 1 << 5;
    }
}

impl Default for Layers {
    fn default() -> Self {
        Self::all()
    }
}

/// How the interface gets its address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Addressing {
    /// Call [`NetStack::dhcp_start`](crate::stack::NetStack::dhcp_start).
    Dhcp,
    Static {
        ip: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        gateway: Ipv4Addr,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct ArpParams {
    /// Fixed number of cache entries.
    pub cache_size: usize,
    /// Total time a Pending entry may wait for a reply.
    pub reply_timeout_ms: u32,
    /// Request retransmissions before the entry is dropped.
    pub max_retries: u8,
    /// Lifetime of a Resolved entry.
    pub entry_lifetime_ms: u32,
    /// Broadcast a gratuitous ARP when an address is configured.
    pub announce_on_startup: bool,
}

impl ArpParams {
    /// Interval between request retransmissions.
    pub const fn retry_interval_ms(&self) -> u32 {
        let retries = if self.max_retries == 0 { 1 } else { self.max_retries as u32 };
        self.reply_timeout_ms / retries
    }
}

impl Default for ArpParams {
    fn default() -> Self {
        Self {
            cache_size: 10,
            reply_timeout_ms: 5000,
            max_retries: 5,
            entry_lifetime_ms: 600_000,
            announce_on_startup: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IpParams {
    pub mtu: u16,
    pub initial_ttl: u8,
    pub reassembly_timeout_ms: u32,
    /// Concurrent datagrams under reassembly.
    pub max_reassembly_packets: usize,
    /// Total payload bytes held by the reassembler.
    pub max_reassembly_bytes: usize,
    /// Largest reassembled datagram accepted.
    pub max_datagram_len: usize,
}

impl Default for IpParams {
    fn default() -> Self {
        Self {
            mtu: 1500,
            initial_ttl: 64,
            reassembly_timeout_ms: 10_000,
            max_reassembly_packets: 4,
            max_reassembly_bytes: 8192,
            max_datagram_len: 4096,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IcmpParams {
    pub echo_reply: bool,
    /// Answer datagrams to unbound UDP ports with port unreachable.
    pub port_unreachable: bool,
}

impl Default for IcmpParams {
    fn default() -> Self {
        Self {
            echo_reply: true,
            port_unreachable: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct UdpParams {
    /// Simultaneous port bindings, both receive modes combined.
    pub max_bindings: usize,
}

impl Default for UdpParams {
    fn default() -> Self {
        Self { max_bindings: 8 }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TcpParams {
    /// Connection pool capacity.
    pub max_connections: usize,
    /// Listening ports.
    pub max_listeners: usize,
    /// Maximum segment lifetime; TIME_WAIT lasts twice this.
    pub msl_ms: u32,
    pub connect_retry_interval_ms: u32,
    pub connect_max_retries: u8,
    pub initial_resend_delay_ms: u32,
    pub max_resend_delay_ms: u32,
    /// Data retransmissions before the connection is reset.
    pub max_retransmits: u8,
    /// Connections with no traffic for this long are reset.
    pub idle_timeout_ms: u32,
    /// MSS advertised in our SYN.
    pub mss: u16,
}

impl Default for TcpParams {
    fn default() -> Self {
        Self {
            max_connections: 4,
            max_listeners: 5,
            msl_ms: 30_000,
            connect_retry_interval_ms: 4000,
            connect_max_retries: 5,
            initial_resend_delay_ms: 4000,
            max_resend_delay_ms: 60_000,
            max_retransmits: 8,
            idle_timeout_ms: 300_000,
            mss: 1460,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DhcpParams {
    /// Wait for each OFFER/ACK before retrying.
    pub response_timeout_ms: u32,
    /// DISCOVER/REQUEST attempts before giving up.
    pub max_retries: u8,
    /// Clear the BOOTP broadcast flag.
    pub expect_unicast_response: bool,
    pub request_domain_name: bool,
}

impl Default for DhcpParams {
    fn default() -> Self {
        Self {
            response_timeout_ms: 6000,
            max_retries: 5,
            expect_unicast_response: false,
            request_domain_name: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DnsParams {
    pub cache_size: usize,
    /// Floor applied to answer TTLs.
    pub min_ttl_secs: u32,
}

impl Default for DnsParams {
    fn default() -> Self {
        Self {
            cache_size: 20,
            min_ttl_secs: 60,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LinkLocalParams {
    /// Pick the first candidate at random instead of `fixed_start`.
    pub random_start: bool,
    pub fixed_start: Ipv4Addr,
    /// Candidate addresses tried before giving up.
    pub max_tries: u16,
    /// Fall back to link-local when DHCP finds no server.
    pub dhcp_fallback: bool,
}

impl Default for LinkLocalParams {
    fn default() -> Self {
        Self {
            random_start: true,
            fixed_start: Ipv4Addr::new(169, 254, 1, 1),
            max_tries: 30,
            dhcp_fallback: false,
        }
    }
}

/// Complete stack configuration.  Build with [`StackConfig::builder`].
#[derive(Clone, Debug)]
pub struct StackConfig {
    /// Overrides the driver's MAC when set.
    pub mac: Option<MacAddr>,
    pub addressing: Addressing,
    /// Statically configured DNS servers.
    pub dns_servers: [Option<Ipv4Addr>; 3],
    pub layers: Layers,
    pub arp: ArpParams,
    pub ip: IpParams,
    pub icmp: IcmpParams,
    pub udp: UdpParams,
    pub tcp: TcpParams,
    pub dhcp: DhcpParams,
    pub dns: DnsParams,
    pub link_local: LinkLocalParams,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mac: None,
            addressing: Addressing::Dhcp,
            dns_servers: [None; 3],
            layers: Layers::default(),
            arp: ArpParams::default(),
            ip: IpParams::default(),
            icmp: IcmpParams::default(),
            udp: UdpParams::default(),
            tcp: TcpParams::default(),
            dhcp: DhcpParams::default(),
            dns: DnsParams::default(),
            link_local: LinkLocalParams::default(),
        }
    }
}

impl StackConfig {
    pub fn builder() -> StackConfigBuilder {
        StackConfigBuilder {
            config: StackConfig::default(),
        }
    }

    /// Check capacities and sizes.  Called by the builder and by
    /// [`NetStack::new`](crate::stack::NetStack::new).
    pub fn validate(&self) -> Result<(), NetError> {
        if self.arp.cache_size == 0
            || self.tcp.max_connections == 0
            || self.udp.max_bindings == 0
            || self.arp.max_retries == 0
        {
            return Err(NetError::InvalidArgument);
        }
        if self.ip.mtu < MIN_MTU || self.ip.mtu as usize > crate::ethernet::ETH_MAX_PAYLOAD {
            return Err(NetError::InvalidArgument);
        }
        if self.tcp.mss == 0 || self.tcp.mss > self.ip.mtu - 40 {
            return Err(NetError::InvalidArgument);
        }
        let ll = &self.link_local;
        if ll.max_tries == 0 || (!ll.random_start && !crate::llip::is_claimable(ll.fixed_start)) {
            return Err(NetError::InvalidArgument);
        }
        if self.layers.contains(Layers::DHCP) {
            return Ok(());
        }
        if self.addressing == Addressing::Dhcp {
            return Err(NetError::LayerDisabled);
        }
        Ok(())
    }

    pub fn has(&self, layer: Layers) -> bool {
        self.layers.contains(layer)
    }
}

/// Consuming builder for [`StackConfig`].
pub struct StackConfigBuilder {
    config: StackConfig,
}

impl StackConfigBuilder {
    pub fn mac(mut self, mac: MacAddr) -> Self {
        self.config.mac = Some(mac);
        self
    }

    pub fn static_ipv4(mut self, ip: Ipv4Addr, subnet_mask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        self.config.addressing = Addressing::Static {
            ip,
            subnet_mask,
            gateway,
        };
        self
    }

    pub fn dhcp(mut self) -> Self {
        self.config.addressing = Addressing::Dhcp;
        self.config.layers |= Layers::DHCP;
        self
    }

    /// Add a static DNS server.  Extra servers beyond three are ignored.
    pub fn dns_server(mut self, server: Ipv4Addr) -> Self {
        if let Some(slot) = self.config.dns_servers.iter_mut().find(|s| s.is_none()) {
            *slot = Some(server);
        }
        self
    }

    pub fn layers(mut self, layers: Layers) -> Self {
        self.config.layers = layers;
        self
    }

    pub fn arp(mut self, params: ArpParams) -> Self {
        self.config.arp = params;
        self
    }

    pub fn ip(mut self, params: IpParams) -> Self {
        self.config.ip = params;
        self
    }

    pub fn icmp(mut self, params: IcmpParams) -> Self {
        self.config.icmp = params;
        self
    }

    pub fn udp(mut self, params: UdpParams) -> Self {
        self.config.udp = params;
        self
    }

    pub fn tcp(mut self, params: TcpParams) -> Self {
        self.config.tcp = params;
        self
    }

    pub fn dhcp_params(mut self, params: DhcpParams) -> Self {
        self.config.dhcp = params;
        self
    }

    pub fn dns(mut self, params: DnsParams) -> Self {
        self.config.dns = params;
        self
    }

    pub fn link_local(mut self, params: LinkLocalParams) -> Self {
        self.config.link_local = params;
        self.config.layers |= Layers::LINK_LOCAL;
        self
    }

    pub fn build(self) -> Result<StackConfig, NetError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
