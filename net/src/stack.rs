//! Interface configuration and the stack facade.
//!
//! [`NetStack`] owns every piece of protocol state behind one [`IrqMutex`]
//! and is the only type the application and the driver talk to.
//!
//! # Paths
//!
//! - **Receive**: [`NetStack::on_frame_received`] (interrupt context) parses
//!   the Ethernet header, filters by destination MAC and dispatches ARP or
//!   IPv4; IPv4 dispatches by protocol.  Nothing on this path blocks.
//! - **Tick**: [`NetStack::poll`] drains pull-mode drivers and the loopback
//!   queue, then runs ARP, reassembly, TCP, DHCP and link-local timers and
//!   flushes TCP output.
//! - **Blocking calls** (`tcp_connect`, `udp_receive`, `dns_query`,
//!   `dhcp_start`, `link_local_start`, `ping`, ...) are bounded loops of
//!   `poll()` and [`Clock::relax`].
//!
//! # Concurrency
//!
//! Events raised while the state lock is held are queued in the state and
//! published once the lock is dropped, so subscribers may call back into the
//! stack.  [`PoolHandler`] callbacks are the exception: they run under the
//! lock and must not.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use slopnet_lib::{IrqMutex, klog_debug, klog_info, klog_warn};

use crate::arp::{self, ArpCache, ArpError, ArpOp, ArpPacket, ArpResolve, ARP_PACKET_LEN};
use crate::config::{Addressing, Layers, StackConfig};
use crate::device::{Clock, LinkStatus, NetDevice, RandomSource, has_elapsed};
use crate::dhcp::{DHCP_MAX_MESSAGE, DhcpClient, DhcpError, DhcpState, DhcpStep};
use crate::dns::{DNS_MAX_MESSAGE, DnsClient, DnsError, DnsStatus};
use crate::ethernet::{self, ETH_HEADER_LEN, ETH_MAX_FRAME, EthernetHeader};
use crate::event::{
    Deferred, DnsServers, ErrorEvent, ErrorProvider, EventBus, NetworkEvent, SubscriberId,
    UdpDatagramEvent,
};
use crate::icmp::{
    self, ICMP_CODE_PORT_UNREACHABLE, ICMP_HEADER_LEN, IcmpMessage, PING_DATA, PING_IDENTIFIER,
    PingStatus, PingTracker,
};
use crate::ipv4::{self, IPV4_HEADER_LEN, IpDrop, IpPacketView, IpStats, Ipv4Header};
use crate::llip::{self, LinkLocalClient, LinkLocalError, LinkLocalState, LinkLocalStep};
use crate::ports::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT, DNS_PORT, PortAllocator};
use crate::reassembly::Reassembler;
use crate::tcp::{
    self, ISN_MASK, TCP_BUFFER_SIZE, TCP_HEADER_MAX_LEN, TcpConnection, TcpError, TcpOutSegment,
    TcpSegment, TcpState, TcpTuple,
};
use crate::tcp_pool::{ConnHandle, ConnectionPool, PoolHandler};
use crate::types::{EtherType, IpProtocol, Ipv4Addr, MacAddr, NetError, Port, SockAddr};
use crate::udp::{self, BindMode, Mailbox, UDP_HEADER_LEN, UdpBindings, UdpDelivery, UdpHeader};

/// Frames pulled from the driver per `poll()`.
const RX_BUDGET: usize = 16;
/// Looped-back packets queued between polls.
const LOOPBACK_QUEUE_LEN: usize = 8;
/// Segments one connection may emit per output pass.
const TCP_SEGMENTS_PER_PASS: usize = 8;
/// Extra wait granted to loops whose deadline is owned by a state machine.
const WAIT_SLACK_MS: u32 = 1000;

// =============================================================================
// Interface configuration
// =============================================================================

/// IPv4 configuration of the interface.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IfaceConfig {
    pub ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: DnsServers,
}

impl IfaceConfig {
    pub const UNCONFIGURED: Self = Self {
        ip: Ipv4Addr::UNSPECIFIED,
        subnet_mask: Ipv4Addr::UNSPECIFIED,
        gateway: Ipv4Addr::UNSPECIFIED,
        dns: DnsServers::EMPTY,
    };

    pub fn is_configured(&self) -> bool {
        self.ip.is_valid()
    }

    /// `broadcast = ip | !mask`
    #[inline]
    pub fn broadcast(&self) -> Ipv4Addr {
        self.ip.subnet_broadcast(self.subnet_mask)
    }

    /// `true` if `ip` is on the directly connected subnet.
    #[inline]
    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        Ipv4Addr::in_subnet(ip, self.ip, self.subnet_mask)
    }

    /// Leading one bits of the mask, e.g. `255.255.255.0` → 24.
    #[inline]
    pub fn prefix_len(&self) -> u8 {
        self.subnet_mask.to_u32_be().leading_ones() as u8
    }
}

impl fmt::Debug for IfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IfaceConfig {{ ip={}/{}, gw={}, dns={:?} }}",
            self.ip,
            self.prefix_len(),
            self.gateway,
            self.dns.as_slice(),
        )
    }
}

impl fmt::Display for IfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} gw {}", self.ip, self.prefix_len(), self.gateway)
    }
}

// =============================================================================
// State
// =============================================================================

/// A datagram for a port in event mode, published once the lock is dropped.
struct PendingDatagram {
    src: SockAddr,
    dst: SockAddr,
    payload: Vec<u8>,
    /// Offending IP header and leading payload, for port unreachable.
    quote: Vec<u8>,
    header_len: usize,
}

struct StackState {
    mac: MacAddr,
    link: LinkStatus,
    iface: IfaceConfig,
    static_dns: DnsServers,
    arp: ArpCache,
    ip_id: u16,
    stats: IpStats,
    reassembler: Reassembler,
    /// TCP and UDP port numbers are separate namespaces.
    tcp_ports: PortAllocator,
    udp_ports: PortAllocator,
    ping: PingTracker,
    udp: UdpBindings,
    tcp: ConnectionPool,
    dhcp: DhcpClient,
    dhcp_result: Option<Result<Ipv4Addr, DhcpError>>,
    llip: LinkLocalClient,
    llip_result: Option<Result<Ipv4Addr, LinkLocalError>>,
    dns: DnsClient,
    loopback: VecDeque<Vec<u8>>,
    events: Vec<Deferred>,
    datagrams: Vec<PendingDatagram>,
}

impl StackState {
    fn notify(&mut self, event: NetworkEvent<'static>) {
        self.events.push(Deferred::Notify(event));
    }

    fn error(&mut self, provider: ErrorProvider, error: NetError, cause: u32) {
        self.events
            .push(Deferred::Error(ErrorEvent::new(provider, error, cause)));
    }

    fn next_ip_id(&mut self) -> u16 {
        self.ip_id = self.ip_id.wrapping_add(1);
        self.ip_id
    }

    /// Source address for a datagram to `dst`.
    fn source_for(&self, dst: Ipv4Addr) -> Result<Ipv4Addr, NetError> {
        if dst.is_loopback() {
            return Ok(Ipv4Addr::LOCALHOST);
        }
        if self.iface.is_configured() {
            return Ok(self.iface.ip);
        }
        // DHCP talks before it has an address
        if dst.is_broadcast() {
            return Ok(Ipv4Addr::UNSPECIFIED);
        }
        Err(NetError::Unconfigured)
    }

    fn is_local_delivery(&self, dst: Ipv4Addr) -> bool {
        dst.is_loopback() || (self.iface.is_configured() && dst == self.iface.ip)
    }

    /// Turn recorded TCP transitions into events and release the local port
    /// of every active connection that closed.
    fn collect_tcp_changes(&mut self) {
        for change in self.tcp.drain_changes() {
            if change.new == TcpState::Closed && !change.passive {
                self.tcp_ports.release(change.local_port);
            }
            self.notify(NetworkEvent::TcpStateChanged {
                conn: change.conn,
                old: change.old,
                new: change.new,
            });
            if let Some(err) = change.error {
                self.error(
                    ErrorProvider::Tcp,
                    NetError::Tcp(err),
                    change.conn.slot() as u32,
                );
            }
        }
    }

    fn effective_dns(&self) -> DnsServers {
        if self.iface.dns.is_empty() {
            self.static_dns
        } else {
            self.iface.dns
        }
    }
}

// =============================================================================
// NetStack
// =============================================================================

/// The network stack for one Ethernet interface.
///
/// ```ignore
/// let stack = NetStack::new(driver, ticker, rng, StackConfig::default())?;
/// stack.start();
/// let ip = stack.dhcp_start(Some("board"))?;
/// let conn = stack.tcp_connect(server, Port(80))?;
/// stack.tcp_send(conn, b"GET / HTTP/1.0\r\n\r\n", 1000)?;
/// ```
pub struct NetStack<D: NetDevice, C: Clock, R: RandomSource> {
    device: D,
    clock: C,
    rng: R,
    config: StackConfig,
    state: IrqMutex<StackState>,
    bus: EventBus,
}

impl<D: NetDevice, C: Clock, R: RandomSource> NetStack<D, C, R> {
    pub fn new(device: D, clock: C, rng: R, config: StackConfig) -> Result<Self, NetError> {
        config.validate()?;

        let mac = config.mac.unwrap_or_else(|| device.mac_addr());
        let mut static_dns = DnsServers::EMPTY;
        for server in config.dns_servers.iter().flatten() {
            static_dns.push(*server);
        }
        let iface = match config.addressing {
            Addressing::Static {
                ip,
                subnet_mask,
                gateway,
            } => IfaceConfig {
                ip,
                subnet_mask,
                gateway,
                dns: DnsServers::EMPTY,
            },
            Addressing::Dhcp => IfaceConfig::UNCONFIGURED,
        };

        let mut dns = DnsClient::new(config.dns.cache_size, config.dns.min_ttl_secs);
        dns.set_servers(static_dns);

        let state = StackState {
            mac,
            link: device.link_status(),
            iface,
            static_dns,
            arp: ArpCache::new(config.arp),
            ip_id: rng.next_u32() as u16,
            stats: IpStats::default(),
            reassembler: Reassembler::new(config.ip),
            tcp_ports: PortAllocator::new(rng.next_u32()),
            udp_ports: PortAllocator::new(rng.next_u32()),
            ping: PingTracker::new(),
            udp: UdpBindings::new(config.udp.max_bindings),
            tcp: ConnectionPool::new(config.tcp),
            dhcp: DhcpClient::new(config.dhcp),
            dhcp_result: None,
            llip: LinkLocalClient::new(config.link_local),
            llip_result: None,
            dns,
            loopback: VecDeque::with_capacity(LOOPBACK_QUEUE_LEN),
            events: Vec::new(),
            datagrams: Vec::new(),
        };

        klog_info!("net: stack up, mac {} layers {:?}", mac, config.layers);
        Ok(Self {
            device,
            clock,
            rng,
            config,
            state: IrqMutex::new(state),
            bus: EventBus::new(),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn mac_addr(&self) -> MacAddr {
        self.state.lock().mac
    }

    pub fn iface(&self) -> IfaceConfig {
        self.state.lock().iface
    }

    pub fn ip_stats(&self) -> IpStats {
        self.state.lock().stats
    }

    pub fn link_status(&self) -> LinkStatus {
        self.state.lock().link
    }

    pub fn dhcp_state(&self) -> DhcpState {
        self.state.lock().dhcp.state()
    }

    pub fn link_local_state(&self) -> LinkLocalState {
        self.state.lock().llip.state()
    }

    pub fn dns_servers(&self) -> DnsServers {
        self.state.lock().dns.servers()
    }

    /// Announce a statically configured address: gratuitous ARP plus the
    /// address notifications.  A DHCP interface does this on lease.
    pub fn start(&self) {
        self.locked(|st| {
            if st.iface.is_configured() {
                self.announce(st);
            }
        });
    }

    // --- Events -------------------------------------------------------------

    pub fn subscribe_notifications<F>(&self, handler: F) -> Result<SubscriberId, NetError>
    where
        F: for<'a> Fn(&NetworkEvent<'a>) + Send + Sync + 'static,
    {
        self.bus.subscribe_notifications(handler)
    }

    pub fn subscribe_errors<F>(&self, handler: F) -> Result<SubscriberId, NetError>
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe_errors(handler)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Run `f` on the locked state, then publish whatever it raised.
    fn locked<T>(&self, f: impl FnOnce(&mut StackState) -> T) -> T {
        let mut st = self.state.lock();
        let out = f(&mut st);
        st.collect_tcp_changes();
        let events = core::mem::take(&mut st.events);
        let datagrams = core::mem::take(&mut st.datagrams);
        drop(st);

        self.bus.publish_deferred(events);
        for datagram in datagrams {
            self.publish_datagram(datagram);
        }
        out
    }

    fn publish_datagram(&self, pending: PendingDatagram) {
        let event = NetworkEvent::UdpDatagram(UdpDatagramEvent::new(
            pending.src,
            pending.dst,
            &pending.payload,
        ));
        self.bus.publish(&event);
        let handled = matches!(&event, NetworkEvent::UdpDatagram(d) if d.is_handled());
        if !handled {
            klog_debug!("udp: datagram for {} not handled", pending.dst);
            let now = self.clock.now_ms();
            self.locked(|st| {
                self.port_unreachable(
                    st,
                    pending.src.ip,
                    pending.dst.ip,
                    &pending.quote,
                    pending.header_len,
                    now,
                )
            });
        }
    }

    // --- Driver entry points ------------------------------------------------

    /// Process one received Ethernet frame.  Safe to call from the receive
    /// interrupt.
    pub fn on_frame_received(&self, frame: &[u8]) {
        let now = self.clock.now_ms();
        self.locked(|st| self.handle_frame(st, frame, now));
    }

    /// Record a link transition reported by the driver.
    pub fn on_link_change(&self, status: LinkStatus) {
        self.locked(|st| {
            let was_up = st.link.up;
            st.link = status;
            klog_info!("net: link {}", status);
            st.notify(NetworkEvent::LinkChanged(status));
            if was_up && !status.up {
                st.arp.clear();
                st.error(ErrorProvider::Link, NetError::LinkDown, 0);
            } else if !was_up && status.up && st.iface.is_configured() {
                self.send_announcement(st);
            }
        });
    }

    /// Drain pull-mode receive, then run every timer and flush TCP output.
    pub fn poll(&self) {
        let mut frame = [0u8; ETH_MAX_FRAME];
        for _ in 0..RX_BUDGET {
            let Some(len) = self.device.receive_frame(&mut frame) else {
                break;
            };
            self.on_frame_received(&frame[..len.min(frame.len())]);
        }

        let now = self.clock.now_ms();
        self.locked(|st| {
            for _ in 0..LOOPBACK_QUEUE_LEN {
                let Some(packet) = st.loopback.pop_front() else {
                    break;
                };
                self.handle_ip(st, &packet, now);
            }

            let work = st.arp.tick(now);
            for ip in work.retransmit {
                let request = ArpPacket::request(st.mac, st.iface.ip, ip);
                let _ = self.send_arp(st, &request, MacAddr::BROADCAST);
            }
            for ip in work.failed {
                st.error(
                    ErrorProvider::Arp,
                    NetError::Arp(ArpError::Timeout),
                    ip.to_u32_be(),
                );
            }

            let expired = st.reassembler.expire(now);
            if expired > 0 {
                st.stats.rx_fragments_dropped += expired as u32;
            }

            for rst in st.tcp.on_timer(now) {
                self.send_tcp_segment(st, &rst, now);
            }
            self.flush_tcp(st, now);

            if st.dhcp.state() != DhcpState::Init {
                let step = st.dhcp.poll(now);
                self.apply_dhcp_step(st, step, now);
            }

            if st.llip.is_active() {
                let step = st.llip.poll(&self.rng, now);
                self.apply_llip_step(st, step);
            }
        });
    }

    /// Bounded wait: poll, test `check` under the lock, relax, until `check`
    /// yields or `timeout_ms` passes.
    fn wait_for<T>(
        &self,
        timeout_ms: u32,
        mut check: impl FnMut(&mut StackState, u32) -> Option<T>,
    ) -> Option<T> {
        let start = self.clock.now_ms();
        loop {
            self.poll();
            let now = self.clock.now_ms();
            if let Some(done) = self.locked(|st| check(st, now)) {
                return Some(done);
            }
            if has_elapsed(start, timeout_ms, now) {
                return None;
            }
            self.clock.relax();
        }
    }

    // --- Receive path -------------------------------------------------------

    fn handle_frame(&self, st: &mut StackState, frame: &[u8], now_ms: u32) {
        let Some((eth, payload)) = EthernetHeader::parse(frame) else {
            klog_debug!("net: runt frame ({} bytes)", frame.len());
            return;
        };
        if !ethernet::accepts(eth.dst, st.mac) {
            return;
        }
        match eth.ether_type() {
            Some(EtherType::Arp) => self.handle_arp(st, payload, now_ms),
            Some(EtherType::Ipv4) => self.handle_ip(st, payload, now_ms),
            None => klog_debug!("net: unknown EtherType 0x{:04x}, dropping", eth.ethertype),
        }
    }

    fn handle_arp(&self, st: &mut StackState, payload: &[u8], now_ms: u32) {
        let Some(pkt) = ArpPacket::parse(payload) else {
            klog_debug!("arp: malformed packet");
            return;
        };
        // Probes carry a zero sender address, so link-local sees them first.
        let defended = st.llip.address().is_some_and(|ip| ip == st.iface.ip);
        if st.llip.is_active() {
            let step = st.llip.on_arp(&pkt, now_ms);
            self.apply_llip_step(st, step);
        }
        if !pkt.sender_ip.is_valid() {
            return;
        }

        let ours = st.iface.ip;
        if ours.is_valid() && pkt.sender_ip == ours && pkt.sender_mac != st.mac {
            if !defended {
                klog_warn!("arp: {} claims our address {}", pkt.sender_mac, ours);
                st.error(
                    ErrorProvider::Arp,
                    NetError::Arp(ArpError::IpAddressClash),
                    ours.to_u32_be(),
                );
            }
            return;
        }

        let for_us = ours.is_valid() && pkt.target_ip == ours;
        let create = for_us || pkt.op == ArpOp::Reply || pkt.is_gratuitous();
        let learned = st.arp.learn(pkt.sender_ip, pkt.sender_mac, now_ms, create);
        if learned.conflict.is_some() {
            st.error(
                ErrorProvider::Arp,
                NetError::Arp(ArpError::AddressConflict),
                pkt.sender_ip.to_u32_be(),
            );
        }

        if pkt.op == ArpOp::Request && for_us {
            let reply = pkt.reply_to(st.mac);
            let _ = self.send_arp(st, &reply, pkt.sender_mac);
        }
        if learned.resolved_pending {
            self.flush_tcp(st, now_ms);
        }
    }

    fn handle_ip(&self, st: &mut StackState, data: &[u8], now_ms: u32) {
        let packet = match IpPacketView::parse(data) {
            Ok(p) => p,
            Err(reason) => {
                st.stats.record_drop(reason);
                return;
            }
        };
        st.stats.rx_packets += 1;

        let header = packet.header;
        let local = header.dst.is_loopback()
            || ipv4::accepts_destination(header.dst, st.iface.ip, st.iface.subnet_mask);
        if !local {
            st.stats.record_drop(IpDrop::NotForUs);
            return;
        }

        if header.is_fragment() {
            st.stats.rx_fragments += 1;
            if !self.config.has(Layers::REASSEMBLY) {
                st.stats.record_drop(IpDrop::Fragment);
                return;
            }
            match st.reassembler.insert(&packet, now_ms) {
                Ok(Some((rebuilt, payload))) => {
                    st.stats.rx_reassembled += 1;
                    let mut quote = [0u8; IPV4_HEADER_LEN + 8];
                    let mut quoted_header = rebuilt;
                    quoted_header.header_len = IPV4_HEADER_LEN as u8;
                    let _ = quoted_header.write(&mut quote);
                    let tail = payload.len().min(8);
                    quote[IPV4_HEADER_LEN..IPV4_HEADER_LEN + tail].copy_from_slice(&payload[..tail]);
                    self.dispatch_ip(
                        st,
                        &quoted_header,
                        &payload,
                        &quote[..IPV4_HEADER_LEN + tail],
                        now_ms,
                    );
                }
                Ok(None) => {}
                Err(reason) => st.stats.record_drop(reason),
            }
            return;
        }

        self.dispatch_ip(st, &header, packet.payload, &data[..header.total_len as usize], now_ms);
    }

    fn dispatch_ip(
        &self,
        st: &mut StackState,
        header: &Ipv4Header,
        payload: &[u8],
        quote: &[u8],
        now_ms: u32,
    ) {
        match header.ip_protocol() {
            Some(IpProtocol::Icmp) if self.config.has(Layers::ICMP) => {
                self.handle_icmp(st, header, payload, now_ms)
            }
            Some(IpProtocol::Udp) => self.handle_udp(st, header, payload, quote, now_ms),
            Some(IpProtocol::Tcp) => self.handle_tcp(st, header, payload, now_ms),
            _ => {
                st.stats.record_drop(IpDrop::UnknownProtocol);
                return;
            }
        }
        st.stats.rx_delivered += 1;
    }

    fn handle_icmp(&self, st: &mut StackState, header: &Ipv4Header, payload: &[u8], now_ms: u32) {
        let Some(msg) = IcmpMessage::parse(payload) else {
            st.stats.rx_malformed += 1;
            return;
        };
        match msg {
            IcmpMessage::EchoRequest { ident, seq, data } => {
                if !self.config.icmp.echo_reply
                    || header.dst.is_broadcast()
                    || header.dst.is_multicast()
                {
                    return;
                }
                let mut reply = vec![0u8; ICMP_HEADER_LEN + data.len()];
                let Some(len) = icmp::write_echo_reply(ident, seq, data, &mut reply) else {
                    return;
                };
                let sent = self.send_ip(st, header.src, IpProtocol::Icmp, &reply[..len], now_ms);
                if let Err(e) = sent {
                    klog_debug!("icmp: echo reply to {} not sent: {}", header.src, e);
                }
            }
            IcmpMessage::EchoReply { ident, seq, .. } => {
                st.ping.on_echo_reply(header.src, ident, seq, now_ms);
            }
            IcmpMessage::DestUnreachable { code, .. } => {
                klog_debug!("icmp: destination unreachable (code {}) from {}", code, header.src);
            }
            IcmpMessage::Other { icmp_type, code } => {
                klog_debug!("icmp: ignoring type {} code {}", icmp_type, code);
            }
        }
    }

    fn handle_udp(
        &self,
        st: &mut StackState,
        header: &Ipv4Header,
        datagram: &[u8],
        quote: &[u8],
        now_ms: u32,
    ) {
        let Some((udp_hdr, payload)) = UdpHeader::parse(datagram) else {
            st.stats.rx_malformed += 1;
            return;
        };
        if !udp::verify_checksum(header.src, header.dst, &datagram[..udp_hdr.length as usize]) {
            st.stats.rx_bad_checksum += 1;
            return;
        }
        let src = SockAddr::new(header.src, udp_hdr.src_port);
        let dst = SockAddr::new(header.dst, udp_hdr.dst_port);

        if dst.port == DHCP_CLIENT_PORT && st.dhcp.state() != DhcpState::Init {
            let step = st.dhcp.on_datagram(payload, now_ms);
            self.apply_dhcp_step(st, step, now_ms);
            return;
        }
        if st.dns.on_datagram(src, dst.port, payload, now_ms) {
            return;
        }

        match st.udp.deliver(src, dst.port, payload) {
            UdpDelivery::Stored | UdpDelivery::Dropped => {}
            UdpDelivery::Event => st.datagrams.push(PendingDatagram {
                src,
                dst,
                payload: payload.to_vec(),
                quote: quote.to_vec(),
                header_len: header.header_len as usize,
            }),
            UdpDelivery::Unbound => {
                klog_debug!("udp: nothing bound to port {}", dst.port);
                self.port_unreachable(
                    st,
                    header.src,
                    header.dst,
                    quote,
                    header.header_len as usize,
                    now_ms,
                );
            }
        }
    }

    fn port_unreachable(
        &self,
        st: &mut StackState,
        to: Ipv4Addr,
        dst: Ipv4Addr,
        quote: &[u8],
        header_len: usize,
        now_ms: u32,
    ) {
        if !self.config.has(Layers::ICMP)
            || !self.config.icmp.port_unreachable
            || dst.is_broadcast()
            || dst.is_multicast()
            || !to.is_valid()
        {
            return;
        }
        let mut msg = [0u8; ICMP_HEADER_LEN + 60 + 8];
        let Some(len) =
            icmp::write_dest_unreachable(ICMP_CODE_PORT_UNREACHABLE, quote, header_len, &mut msg)
        else {
            return;
        };
        let _ = self.send_ip(st, to, IpProtocol::Icmp, &msg[..len], now_ms);
    }

    fn handle_tcp(&self, st: &mut StackState, header: &Ipv4Header, segment: &[u8], now_ms: u32) {
        if header.dst.is_broadcast() || header.dst.is_multicast() {
            return;
        }
        if !tcp::verify_checksum(header.src, header.dst, segment) {
            st.stats.rx_bad_checksum += 1;
            return;
        }
        let Some(seg) = TcpSegment::parse(segment) else {
            st.stats.rx_malformed += 1;
            return;
        };

        let rng = &self.rng;
        let reply = st
            .tcp
            .on_segment(header.dst, header.src, &seg, now_ms, || rng.next_u32() & ISN_MASK);
        if let Some(rst) = reply {
            self.send_tcp_segment(st, &rst, now_ms);
        }
        self.flush_tcp(st, now_ms);
    }

    fn apply_dhcp_step(&self, st: &mut StackState, step: DhcpStep, now_ms: u32) {
        if let Some(lease_secs) = step.renewal_due {
            st.notify(NetworkEvent::DhcpRenewalDue { lease_secs });
        }
        if let Some(msg) = step.transmit {
            let mut buf = [0u8; DHCP_MAX_MESSAGE];
            if let Some(len) = st.dhcp.write_message(&msg, &mut buf) {
                let src_ip = st.source_for(msg.dst).unwrap_or(Ipv4Addr::UNSPECIFIED);
                let src = SockAddr::new(src_ip, DHCP_CLIENT_PORT);
                let dst = SockAddr::new(msg.dst, DHCP_SERVER_PORT);
                if let Err(e) = self.send_udp(st, src, dst, &buf[..len], now_ms) {
                    klog_debug!("dhcp: send to {} failed: {}", msg.dst, e);
                }
            }
        }
        if step.bound {
            let lease = st.dhcp.lease().map(|l| IfaceConfig {
                ip: l.ip,
                subnet_mask: l.subnet_mask,
                gateway: l.gateway,
                dns: l.dns_servers,
            });
            if let Some(iface) = lease {
                if st.iface.ip != iface.ip {
                    st.arp.clear();
                }
                st.iface = iface;
                st.dhcp_result = Some(Ok(iface.ip));
                self.publish_config(st);
                self.send_announcement(st);
            }
        }
        if step.lease_lost {
            klog_warn!("dhcp: lease on {} withdrawn", st.iface.ip);
            st.iface = IfaceConfig::UNCONFIGURED;
            let dns = st.effective_dns();
            st.dns.set_servers(dns);
            st.arp.clear();
            st.notify(NetworkEvent::DhcpLeaseExpired);
        }
        if let Some(err) = step.failed {
            st.dhcp_result = Some(Err(err));
            st.error(ErrorProvider::Dhcp, NetError::Dhcp(err), 0);
        }
    }

    fn apply_llip_step(&self, st: &mut StackState, step: LinkLocalStep) {
        if let Some(ip) = step.probe {
            let probe = ArpPacket::probe(st.mac, ip);
            if let Err(e) = self.send_arp(st, &probe, MacAddr::BROADCAST) {
                klog_debug!("llip: probe for {} failed: {}", ip, e);
            }
        }
        if let Some(ip) = step.claimed {
            if st.iface.ip != ip {
                st.arp.clear();
            }
            st.iface = IfaceConfig {
                ip,
                subnet_mask: llip::LINK_LOCAL_MASK,
                gateway: Ipv4Addr::UNSPECIFIED,
                dns: DnsServers::EMPTY,
            };
            st.llip_result = Some(Ok(ip));
            self.publish_config(st);
        }
        if let Some(ip) = step.announce {
            let pkt = ArpPacket::announcement(st.mac, ip);
            if let Err(e) = self.send_arp(st, &pkt, MacAddr::BROADCAST) {
                klog_debug!("llip: announcement of {} failed: {}", ip, e);
            }
        }
        if step.lost {
            st.iface = IfaceConfig::UNCONFIGURED;
            let dns = st.effective_dns();
            st.dns.set_servers(dns);
            st.arp.clear();
        }
        if let Some(err) = step.failed {
            if err == LinkLocalError::NoAddress {
                st.llip_result = Some(Err(err));
            }
            st.error(ErrorProvider::LinkLocal, NetError::LinkLocal(err), 0);
        }
    }

    /// Raise the address notifications and send a gratuitous ARP.
    fn announce(&self, st: &mut StackState) {
        self.publish_config(st);
        self.send_announcement(st);
    }

    /// Raise the address notifications for the current interface.
    fn publish_config(&self, st: &mut StackState) {
        let iface = st.iface;
        let dns = st.effective_dns();
        st.dns.set_servers(dns);
        klog_info!("net: configured {}", iface);
        st.notify(NetworkEvent::IpAddressAnnounced(iface.ip));
        st.notify(NetworkEvent::SubnetMaskAnnounced(iface.subnet_mask));
        st.notify(NetworkEvent::DefaultGatewayAnnounced(iface.gateway));
        if !dns.is_empty() {
            st.notify(NetworkEvent::DnsServersAnnounced(dns));
        }
    }

    fn send_announcement(&self, st: &mut StackState) {
        if !self.config.arp.announce_on_startup || !st.link.up {
            return;
        }
        let pkt = ArpPacket::announcement(st.mac, st.iface.ip);
        if let Err(e) = self.send_arp(st, &pkt, MacAddr::BROADCAST) {
            klog_debug!("arp: announcement failed: {}", e);
        }
    }

    // --- Transmit path ------------------------------------------------------

    fn transmit(&self, st: &mut StackState, frame: &[u8]) -> Result<(), NetError> {
        self.device.send_frame(frame).inspect_err(|e| {
            st.stats.tx_failed += 1;
            klog_debug!("net: driver refused frame: {}", e);
        })
    }

    fn send_arp(
        &self,
        st: &mut StackState,
        pkt: &ArpPacket,
        dst_mac: MacAddr,
    ) -> Result<(), NetError> {
        if !st.link.up {
            return Err(NetError::LinkDown);
        }
        let mut frame = [0u8; ETH_HEADER_LEN + ARP_PACKET_LEN];
        let eth = EthernetHeader {
            dst: dst_mac,
            src: st.mac,
            ethertype: EtherType::Arp.as_u16(),
        };
        eth.write(&mut frame).ok_or(NetError::BufferFull)?;
        pkt.write(&mut frame[ETH_HEADER_LEN..])
            .ok_or(NetError::BufferFull)?;
        self.transmit(st, &frame)
    }

    /// Destination MAC for `dst`, starting resolution on a miss.
    fn resolve_mac(
        &self,
        st: &mut StackState,
        dst: Ipv4Addr,
        now_ms: u32,
    ) -> Result<MacAddr, NetError> {
        let hop = if dst.is_broadcast() {
            dst
        } else {
            ipv4::next_hop(dst, st.iface.ip, st.iface.subnet_mask, st.iface.gateway)?
        };
        if let Some(mac) = arp::special_destination(hop, st.iface.ip, st.iface.subnet_mask) {
            return Ok(mac);
        }
        match st.arp.resolve(hop, now_ms)? {
            ArpResolve::Resolved(mac) => Ok(mac),
            ArpResolve::Pending { send_request } => {
                if send_request {
                    let request = ArpPacket::request(st.mac, st.iface.ip, hop);
                    let _ = self.send_arp(st, &request, MacAddr::BROADCAST);
                }
                Err(NetError::WouldBlock)
            }
        }
    }

    /// Send one transport payload to `dst`, fragmenting when it exceeds the
    /// MTU.  Fails with `WouldBlock` while the next hop is being resolved.
    fn send_ip(
        &self,
        st: &mut StackState,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        payload: &[u8],
        now_ms: u32,
    ) -> Result<(), NetError> {
        let src = st.source_for(dst)?;
        let ttl = self.config.ip.initial_ttl;
        if IPV4_HEADER_LEN + payload.len() > u16::MAX as usize {
            return Err(NetError::MessageTooLarge);
        }

        if st.is_local_delivery(dst) {
            if st.loopback.len() >= LOOPBACK_QUEUE_LEN {
                return Err(NetError::BufferFull);
            }
            let id = st.next_ip_id();
            let header = Ipv4Header::new(src, dst, protocol, id, ttl, payload.len());
            let mut packet = vec![0u8; IPV4_HEADER_LEN + payload.len()];
            header.write(&mut packet).ok_or(NetError::BufferFull)?;
            packet[IPV4_HEADER_LEN..].copy_from_slice(payload);
            st.loopback.push_back(packet);
            st.stats.tx_packets += 1;
            return Ok(());
        }

        if !st.link.up {
            return Err(NetError::LinkDown);
        }
        let mtu = self.config.ip.mtu as usize;
        let needs_fragments = IPV4_HEADER_LEN + payload.len() > mtu;
        if needs_fragments && !self.config.has(Layers::FRAGMENTATION) {
            return Err(NetError::MessageTooLarge);
        }

        let dst_mac = self.resolve_mac(st, dst, now_ms)?;
        let id = st.next_ip_id();
        let eth = EthernetHeader {
            dst: dst_mac,
            src: st.mac,
            ethertype: EtherType::Ipv4.as_u16(),
        };

        let mut frame = [0u8; ETH_MAX_FRAME];
        for frag in ipv4::fragments(payload.len(), mtu) {
            let mut header = Ipv4Header::new(src, dst, protocol, id, ttl, frag.len);
            header.flags_fragment = frag.flags_fragment();
            eth.write(&mut frame).ok_or(NetError::BufferFull)?;
            header
                .write(&mut frame[ETH_HEADER_LEN..])
                .ok_or(NetError::BufferFull)?;
            let start = ETH_HEADER_LEN + IPV4_HEADER_LEN;
            frame[start..start + frag.len]
                .copy_from_slice(&payload[frag.offset..frag.offset + frag.len]);
            self.transmit(st, &frame[..start + frag.len])?;
            if needs_fragments {
                st.stats.tx_fragments += 1;
            }
        }
        st.stats.tx_packets += 1;
        Ok(())
    }

    fn send_udp(
        &self,
        st: &mut StackState,
        src: SockAddr,
        dst: SockAddr,
        payload: &[u8],
        now_ms: u32,
    ) -> Result<(), NetError> {
        let mut datagram = vec![0u8; UDP_HEADER_LEN + payload.len()];
        let len = udp::write_datagram(src, dst, payload, &mut datagram)
            .ok_or(NetError::MessageTooLarge)?;
        self.send_ip(st, dst.ip, IpProtocol::Udp, &datagram[..len], now_ms)
    }

    /// Send a segment with no payload (RST or bare ACK).
    fn send_tcp_segment(&self, st: &mut StackState, seg: &TcpOutSegment, now_ms: u32) {
        let mut buf = [0u8; TCP_HEADER_MAX_LEN];
        let Some(len) = seg.write(&[], &mut buf) else {
            return;
        };
        if let Err(e) = self.send_ip(st, seg.tuple.remote_ip, IpProtocol::Tcp, &buf[..len], now_ms) {
            klog_debug!("tcp: control segment to {} not sent: {}", seg.tuple, e);
        }
    }

    /// Output pass: send and commit whatever every connection has queued.
    /// A segment that cannot go out yet stays queued for the next pass.
    fn flush_tcp(&self, st: &mut StackState, now_ms: u32) {
        let mut buf = vec![0u8; TCP_HEADER_MAX_LEN + TCP_BUFFER_SIZE];
        for idx in 0..st.tcp.capacity() {
            for _ in 0..TCP_SEGMENTS_PER_PASS {
                let Some(seg) = st.tcp.next_segment(idx) else {
                    break;
                };
                let header_len = seg.header_len();
                let end = header_len + seg.payload_len;
                if end > buf.len() {
                    break;
                }
                if st.tcp.copy_payload(idx, &seg, &mut buf[header_len..end]) != seg.payload_len {
                    break;
                }
                let Some(len) = seg.finish(&mut buf) else {
                    break;
                };
                match self.send_ip(st, seg.tuple.remote_ip, IpProtocol::Tcp, &buf[..len], now_ms) {
                    Ok(()) => st.tcp.commit(idx, &seg, now_ms),
                    Err(e) => {
                        klog_debug!("tcp: {:?} for {} deferred: {}", seg.kind, seg.tuple, e);
                        break;
                    }
                }
            }
        }
    }

    // --- TCP ----------------------------------------------------------------

    /// Open a connection.  Blocks until ESTABLISHED or the SYN retries run
    /// out.
    pub fn tcp_connect(&self, ip: Ipv4Addr, port: Port) -> Result<ConnHandle, NetError> {
        let now = self.clock.now_ms();
        let handle = self.locked(|st| -> Result<ConnHandle, NetError> {
            let local_ip = st.source_for(ip)?;
            let local_port = st.tcp_ports.acquire_ephemeral()?;
            let tuple = TcpTuple {
                local_ip,
                local_port,
                remote_ip: ip,
                remote_port: port,
            };
            let iss = self.rng.next_u32() & ISN_MASK;
            let handle = st.tcp.connect(tuple, iss, now).inspect_err(|_| {
                st.tcp_ports.release(local_port);
            })?;
            self.flush_tcp(st, now);
            Ok(handle)
        })?;

        let params = &self.config.tcp;
        let budget = params
            .connect_retry_interval_ms
            .saturating_mul(params.connect_max_retries as u32 + 1)
            .saturating_add(WAIT_SLACK_MS);
        let outcome = self.wait_for(budget, |st, _| match st.tcp.get(handle) {
            Ok(conn) if conn.state() == TcpState::Established => Some(Ok(handle)),
            Ok(conn) if conn.state() == TcpState::Closed => Some(Err(NetError::Tcp(
                conn.error().unwrap_or(TcpError::Refused),
            ))),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        });

        match outcome {
            Some(result) => result,
            None => {
                let _ = self.tcp_abort(handle);
                Err(NetError::Tcp(TcpError::Timeout))
            }
        }
    }

    /// Queue `data` for transmission, waiting up to `timeout_ms` for ring
    /// space.  Returns how many bytes were accepted.
    pub fn tcp_send(
        &self,
        conn: ConnHandle,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<usize, NetError> {
        let mut sent = 0usize;
        let mut failure = None;
        self.wait_for(timeout_ms, |st, now| {
            match st.tcp.with(conn, |c| c.send(&data[sent..], now)) {
                Ok(Ok(n)) => sent += n,
                Ok(Err(e)) => failure = Some(NetError::Tcp(e)),
                Err(e) => failure = Some(e),
            }
            self.flush_tcp(st, now);
            (sent == data.len() || failure.is_some()).then_some(())
        });
        match failure {
            Some(e) if sent == 0 => Err(e),
            _ => Ok(sent),
        }
    }

    /// Read into `buf` once at least `min_bytes` are available, the peer
    /// has closed, or `timeout_ms` passes.  `Ok(0)` means end of stream.
    pub fn tcp_receive(
        &self,
        conn: ConnHandle,
        buf: &mut [u8],
        timeout_ms: u32,
        min_bytes: usize,
    ) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let wanted = min_bytes.clamp(1, buf.len());
        let ready = self.wait_for(timeout_ms, |st, _| match st.tcp.get(conn) {
            Ok(c) if c.available() >= wanted || c.is_remote_end_closed() => Some(Ok(())),
            Ok(c) if c.state() == TcpState::Closed => Some(Ok(())),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        });
        if let Some(Err(e)) = ready {
            return Err(e);
        }

        let now = self.clock.now_ms();
        let read = self.locked(|st| {
            let read = st.tcp.with(conn, |c| c.recv(buf));
            self.flush_tcp(st, now);
            read
        })?;
        if read == 0 && ready.is_none() {
            return Err(NetError::Timeout);
        }
        Ok(read)
    }

    /// Graceful close: FIN once queued data is out.
    pub fn tcp_close(&self, conn: ConnHandle) -> Result<(), NetError> {
        let now = self.clock.now_ms();
        self.locked(|st| {
            st.tcp.close(conn)?;
            self.flush_tcp(st, now);
            Ok(())
        })
    }

    /// Reset the connection.
    pub fn tcp_abort(&self, conn: ConnHandle) -> Result<(), NetError> {
        let now = self.clock.now_ms();
        self.locked(|st| {
            if let Some(rst) = st.tcp.abort(conn)? {
                self.send_tcp_segment(st, &rst, now);
            }
            Ok(())
        })
    }

    pub fn tcp_state(&self, conn: ConnHandle) -> Result<TcpState, NetError> {
        self.state.lock().tcp.get(conn).map(TcpConnection::state)
    }

    /// Accept connections on `port`.  Accepted connections are reported to
    /// [`tcp_service`](Self::tcp_service) handlers and as state changes.
    pub fn tcp_listen(&self, port: Port) -> Result<(), NetError> {
        self.locked(|st| {
            st.tcp_ports.claim(port)?;
            st.tcp.listen(port).inspect_err(|_| st.tcp_ports.release(port))
        })
    }

    pub fn tcp_unlisten(&self, port: Port) -> bool {
        self.locked(|st| {
            let removed = st.tcp.unlisten(port);
            if removed {
                st.tcp_ports.release(port);
            }
            removed
        })
    }

    /// One round-robin pass over the pool, then an output pass.
    pub fn tcp_service<H: PoolHandler + ?Sized>(&self, handler: &mut H) {
        let now = self.clock.now_ms();
        self.locked(|st| {
            st.tcp.service(handler);
            self.flush_tcp(st, now);
        });
    }

    // --- UDP ----------------------------------------------------------------

    /// Send one datagram, waiting up to `timeout_ms` for ARP.
    pub fn udp_send(
        &self,
        dst_ip: Ipv4Addr,
        src_port: Port,
        dst_port: Port,
        payload: &[u8],
        timeout_ms: u32,
    ) -> Result<(), NetError> {
        let dst = SockAddr::new(dst_ip, dst_port);
        let outcome = self.wait_for(timeout_ms, |st, now| {
            let src = match st.source_for(dst_ip) {
                Ok(ip) => SockAddr::new(ip, src_port),
                Err(e) => return Some(Err(e)),
            };
            match self.send_udp(st, src, dst, payload, now) {
                Err(NetError::WouldBlock) => None,
                other => Some(other),
            }
        });
        outcome.unwrap_or(Err(NetError::Timeout))
    }

    /// Wait up to `timeout_ms` for one datagram on `port`.
    pub fn udp_receive(
        &self,
        port: Port,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(usize, SockAddr), NetError> {
        self.locked(|st| {
            st.udp_ports.claim(port)?;
            st.udp
                .bind(
                    port,
                    BindMode::SynchronousWait {
                        capacity: buf.len(),
                    },
                )
                .inspect_err(|_| st.udp_ports.release(port))
        })?;

        let mailbox = self.wait_for(timeout_ms, |st, _| st.udp.take(port));

        self.locked(|st| {
            st.udp.unbind(port);
            st.udp_ports.release(port);
        });

        match mailbox {
            Some(Mailbox::Datagram { src, data }) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), src))
            }
            Some(Mailbox::TooLarge) => Err(NetError::MessageTooLarge),
            None => Err(NetError::Timeout),
        }
    }

    /// Publish every datagram for `port` as [`NetworkEvent::UdpDatagram`].
    pub fn udp_bind_events(&self, port: Port) -> Result<(), NetError> {
        self.locked(|st| {
            st.udp_ports.claim(port)?;
            st.udp
                .bind(port, BindMode::EventCallback)
                .inspect_err(|_| st.udp_ports.release(port))
        })
    }

    pub fn udp_unbind(&self, port: Port) -> Result<(), NetError> {
        self.locked(|st| {
            if !st.udp.unbind(port) {
                return Err(NetError::InvalidArgument);
            }
            st.udp_ports.release(port);
            Ok(())
        })
    }

    // --- ICMP ---------------------------------------------------------------

    /// Echo request to `ip`.  Returns the round trip in milliseconds.
    pub fn ping(&self, ip: Ipv4Addr, timeout_ms: u32) -> Result<u32, NetError> {
        if !self.config.has(Layers::ICMP) {
            return Err(NetError::LayerDisabled);
        }
        let now = self.clock.now_ms();
        let seq = self.locked(|st| st.ping.begin(ip, now));
        let mut request = [0u8; ICMP_HEADER_LEN + PING_DATA.len()];
        let len = icmp::write_echo_request(PING_IDENTIFIER, seq, PING_DATA, &mut request)
            .ok_or(NetError::BufferFull)?;

        let mut sent = false;
        let outcome = self.wait_for(timeout_ms.saturating_add(WAIT_SLACK_MS), |st, now| {
            if !sent {
                match self.send_ip(st, ip, IpProtocol::Icmp, &request[..len], now) {
                    Ok(()) => sent = true,
                    Err(NetError::WouldBlock) => {}
                    Err(e) => return Some(Err(e)),
                }
            }
            match st.ping.status(timeout_ms, now) {
                PingStatus::Replied(rtt) => Some(Ok(rtt)),
                PingStatus::TimedOut | PingStatus::Idle => Some(Err(NetError::Timeout)),
                PingStatus::Waiting => None,
            }
        });
        let result = outcome.unwrap_or(Err(NetError::Timeout));
        if result.is_err() {
            self.locked(|st| st.ping.cancel());
        }
        result
    }

    // --- DHCP ---------------------------------------------------------------

    /// Acquire a lease.  Blocks until BOUND or every attempt has failed.
    /// With link-local fallback configured, a failed acquisition goes on to
    /// [`link_local_start`](Self::link_local_start).
    pub fn dhcp_start(&self, hostname: Option<&str>) -> Result<Ipv4Addr, NetError> {
        if !self.config.has(Layers::DHCP) {
            return Err(NetError::LayerDisabled);
        }
        let result = self.acquire_lease(hostname);
        if result.is_err()
            && self.config.has(Layers::LINK_LOCAL)
            && self.config.link_local.dhcp_fallback
        {
            klog_info!("dhcp: no lease, falling back to link-local");
            return self.link_local_start();
        }
        result
    }

    fn acquire_lease(&self, hostname: Option<&str>) -> Result<Ipv4Addr, NetError> {
        let xid = self.rng.next_u32();
        self.locked(|st| {
            st.llip.stop();
            st.dhcp_result = None;
            let mac = st.mac;
            st.dhcp.start(mac, hostname, xid);
        });

        let params = &self.config.dhcp;
        let budget = params
            .response_timeout_ms
            .saturating_mul(params.max_retries as u32 + 1)
            .saturating_add(WAIT_SLACK_MS);
        let outcome = self.wait_for(budget, |st, _| st.dhcp_result.take());

        match outcome {
            Some(result) => result.map_err(NetError::Dhcp),
            None => {
                self.locked(|st| st.dhcp.stop());
                Err(NetError::Dhcp(DhcpError::NoLease))
            }
        }
    }

    // --- Link-local ---------------------------------------------------------

    /// Claim a 169.254/16 address.  Blocks until one is probed free and
    /// announced, or every try met a conflict.  The address is defended
    /// afterwards from `poll()`.
    pub fn link_local_start(&self) -> Result<Ipv4Addr, NetError> {
        if !self.config.has(Layers::LINK_LOCAL) {
            return Err(NetError::LayerDisabled);
        }
        let now = self.clock.now_ms();
        self.locked(|st| {
            st.dhcp.stop();
            st.llip_result = None;
            let mac = st.mac;
            st.llip.start(mac, &self.rng, now);
        });

        let per_try = llip::PROBE_WAIT_MS
            + llip::PROBE_NUM as u32 * llip::PROBE_MAX_MS
            + llip::ANNOUNCE_WAIT_MS
            + llip::RATE_LIMIT_INTERVAL_MS;
        let budget = per_try
            .saturating_mul(self.config.link_local.max_tries as u32)
            .saturating_add(WAIT_SLACK_MS);
        match self.wait_for(budget, |st, _| st.llip_result.take()) {
            Some(result) => result.map_err(NetError::LinkLocal),
            None => {
                self.locked(|st| st.llip.stop());
                Err(NetError::LinkLocal(LinkLocalError::NoAddress))
            }
        }
    }

    // --- DNS ----------------------------------------------------------------

    /// Resolve `hostname` to an IPv4 address.
    pub fn dns_query(&self, hostname: &str, timeout_ms: u32) -> Result<Ipv4Addr, NetError> {
        if !self.config.has(Layers::DNS) {
            return Err(NetError::LayerDisabled);
        }
        let now = self.clock.now_ms();
        let id = self.rng.next_u32() as u16;

        let first = self.locked(|st| -> Result<Option<Ipv4Addr>, NetError> {
            if let Some(addr) = st.dns.resolve_local(hostname, now) {
                return Ok(Some(addr));
            }
            if let Some(stale) = st.dns.cancel() {
                st.udp_ports.release(stale);
            }
            let port = st.udp_ports.acquire_ephemeral()?;
            match st.dns.begin_query(hostname, id, port, timeout_ms, now) {
                Ok(_) => Ok(None),
                Err(e) => {
                    st.udp_ports.release(port);
                    let cause = match e {
                        DnsError::ServerError(rcode) => rcode as u32,
                        _ => 0,
                    };
                    st.error(ErrorProvider::Dns, NetError::Dns(e), cause);
                    Err(NetError::Dns(e))
                }
            }
        })?;
        if let Some(addr) = first {
            return Ok(addr);
        }

        let mut target = self.locked(|st| st.dns.servers().as_slice().first().copied());
        let outcome = self.wait_for(timeout_ms, |st, now| {
            if let Some(server) = target {
                match self.send_dns_query(st, server, now) {
                    Err(NetError::WouldBlock) => {}
                    Err(e) => {
                        klog_debug!("dns: query to {} failed: {}", server, e);
                        target = None;
                    }
                    Ok(()) => target = None,
                }
            }
            match st.dns.poll(now) {
                DnsStatus::Idle => Some(Err(DnsError::Timeout)),
                DnsStatus::Pending => None,
                DnsStatus::Resend(server) => {
                    target = Some(server);
                    None
                }
                DnsStatus::Done { port, result } => {
                    st.udp_ports.release(port);
                    Some(result)
                }
            }
        });

        let result = outcome.unwrap_or_else(|| {
            self.locked(|st| {
                if let Some(port) = st.dns.cancel() {
                    st.udp_ports.release(port);
                }
            });
            Err(DnsError::Timeout)
        });
        result.map_err(|e| {
            let cause = match e {
                DnsError::ServerError(rcode) => rcode as u32,
                _ => 0,
            };
            self.bus
                .publish_error(ErrorEvent::new(ErrorProvider::Dns, NetError::Dns(e), cause));
            NetError::Dns(e)
        })
    }

    fn send_dns_query(
        &self,
        st: &mut StackState,
        server: Ipv4Addr,
        now_ms: u32,
    ) -> Result<(), NetError> {
        let port = st.dns.query_port().ok_or(NetError::InvalidArgument)?;
        let mut buf = [0u8; DNS_MAX_MESSAGE];
        let len = st.dns.write_query(&mut buf).ok_or(NetError::InvalidArgument)?;
        let src = SockAddr::new(st.source_for(server)?, port);
        self.send_udp(st, src, SockAddr::new(server, DNS_PORT), &buf[..len], now_ms)
    }

    /// Forget every cached hostname.
    pub fn dns_flush_cache(&self) {
        self.state.lock().dns.cache().flush();
    }
}
