//! Scriptable driver, clock and random source for the stack tests, plus
//! frame builders and decoders.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use slopnet_lib::IrqMutex;

use crate::arp::{ARP_PACKET_LEN, ArpOp, ArpPacket};
use crate::config::StackConfig;
use crate::dhcp::{BOOTP_HEADER_LEN, MSG_ACK, MSG_DISCOVER, MSG_OFFER, MSG_REQUEST, parse_options};
use crate::device::{Clock, Duplex, LinkSpeed, LinkStatus, NetDevice, RandomSource};
use crate::ethernet::{ETH_HEADER_LEN, EthernetHeader};
use crate::event::NetworkEvent;
use crate::ipv4::{IPV4_HEADER_LEN, IpPacketView, Ipv4Header};
use crate::ports::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT, DNS_PORT};
use crate::stack::NetStack;
use crate::types::{EtherType, IpProtocol, Ipv4Addr, MacAddr, NetError, SockAddr};
use crate::udp::{self, UDP_HEADER_LEN, UdpHeader};

pub const OUR_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
pub const PEER_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);
pub const GATEWAY_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xfe]);

pub const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

pub const LINK_UP: LinkStatus = LinkStatus {
    up: true,
    speed: LinkSpeed::Mbps100,
    duplex: Duplex::Full,
};

type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// Loopback-free fake driver.  Every sent frame is logged and offered to
/// the responder; its answers are queued for `receive_frame`.
pub struct MockDevice {
    mac: MacAddr,
    link: IrqMutex<LinkStatus>,
    sent: IrqMutex<Vec<Vec<u8>>>,
    rx: IrqMutex<VecDeque<Vec<u8>>>,
    responder: IrqMutex<Option<Responder>>,
}

impl MockDevice {
    pub fn new(mac: MacAddr) -> Self {
        Self {
            mac,
            link: IrqMutex::new(LINK_UP),
            sent: IrqMutex::new(Vec::new()),
            rx: IrqMutex::new(VecDeque::new()),
            responder: IrqMutex::new(None),
        }
    }

    pub fn set_responder(
        &self,
        responder: impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) {
        *self.responder.lock() = Some(Box::new(responder));
    }

    pub fn set_link(&self, status: LinkStatus) {
        *self.link.lock() = status;
    }

    pub fn inject(&self, frame: Vec<u8>) {
        self.rx.lock().push_back(frame);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// ARP requests sent, by target IP.
    pub fn arp_requests(&self) -> Vec<Ipv4Addr> {
        self.sent()
            .iter()
            .filter_map(|f| decode_arp(f))
            .filter(|p| p.op == ArpOp::Request && !p.is_gratuitous())
            .map(|p| p.target_ip)
            .collect()
    }

    /// IPv4 packets sent with the given protocol.
    pub fn ip_packets(&self, protocol: IpProtocol) -> Vec<(Ipv4Header, Vec<u8>)> {
        self.sent()
            .iter()
            .filter_map(|f| decode_ipv4(f))
            .filter(|(h, _)| h.protocol == protocol.as_u8())
            .collect()
    }
}

impl NetDevice for MockDevice {
    fn send_frame(&self, frame: &[u8]) -> Result<(), NetError> {
        self.sent.lock().push(frame.to_vec());
        let replies = match self.responder.lock().as_ref() {
            Some(responder) => responder(frame),
            None => Vec::new(),
        };
        self.rx.lock().extend(replies);
        Ok(())
    }

    fn link_status(&self) -> LinkStatus {
        *self.link.lock()
    }

    fn mac_addr(&self) -> MacAddr {
        self.mac
    }

    fn receive_frame(&self, buf: &mut [u8]) -> Option<usize> {
        let frame = self.rx.lock().pop_front()?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Some(len)
    }
}

/// Clock that only moves when told to, or by `step` per `relax()`.
pub struct MockClock {
    now: AtomicU32,
    step: u32,
}

impl MockClock {
    pub fn new(start_ms: u32, step: u32) -> Self {
        Self {
            now: AtomicU32::new(start_ms),
            step,
        }
    }

    pub fn advance(&self, ms: u32) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }

    fn relax(&self) {
        self.advance(self.step);
    }
}

pub struct MockRandom(AtomicU32);

impl MockRandom {
    pub fn new(seed: u32) -> Self {
        Self(AtomicU32::new(seed))
    }
}

impl RandomSource for MockRandom {
    fn next_u32(&self) -> u32 {
        self.0.fetch_add(0x1234_5677, Ordering::Relaxed)
    }
}

pub type TestStack = NetStack<MockDevice, MockClock, MockRandom>;

/// Static 192.168.1.10/24 via 192.168.1.1, clock stepping 10 ms per relax.
pub fn static_config() -> StackConfig {
    StackConfig::builder()
        .static_ipv4(OUR_IP, MASK, GATEWAY_IP)
        .dns_server(GATEWAY_IP)
        .build()
        .unwrap()
}

fn print_backend(args: core::fmt::Arguments<'_>) {
    println!("{}", args);
}

/// Route klog to the test's stdout so a failing assertion shows its context.
pub fn init_logging() {
    slopnet_lib::klog_register_backend(print_backend);
    slopnet_lib::klog_set_level(slopnet_lib::KlogLevel::Debug);
}

pub fn stack_with(config: StackConfig) -> TestStack {
    init_logging();
    NetStack::new(
        MockDevice::new(OUR_MAC),
        MockClock::new(1_000, 10),
        MockRandom::new(7),
        config,
    )
    .unwrap()
}

pub fn static_stack() -> TestStack {
    stack_with(static_config())
}

// --- Frame builders ---------------------------------------------------------

pub fn ethernet_frame(
    dst: MacAddr,
    src: MacAddr,
    ethertype: EtherType,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = vec![0u8; ETH_HEADER_LEN + payload.len()];
    EthernetHeader {
        dst,
        src,
        ethertype: ethertype.as_u16(),
    }
    .write(&mut frame)
    .unwrap();
    frame[ETH_HEADER_LEN..].copy_from_slice(payload);
    frame
}

pub fn arp_frame(pkt: &ArpPacket, dst: MacAddr) -> Vec<u8> {
    let mut body = [0u8; ARP_PACKET_LEN];
    pkt.write(&mut body).unwrap();
    ethernet_frame(dst, pkt.sender_mac, EtherType::Arp, &body)
}

/// ARP reply from `(mac, ip)` to us.
pub fn arp_reply(mac: MacAddr, ip: Ipv4Addr) -> Vec<u8> {
    let pkt = ArpPacket {
        op: ArpOp::Reply,
        sender_mac: mac,
        sender_ip: ip,
        target_mac: OUR_MAC,
        target_ip: OUR_IP,
    };
    arp_frame(&pkt, OUR_MAC)
}

pub fn ipv4_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: IpProtocol,
    id: u16,
    payload: &[u8],
) -> Vec<u8> {
    let header = Ipv4Header::new(src, dst, protocol, id, 64, payload.len());
    let mut packet = vec![0u8; IPV4_HEADER_LEN + payload.len()];
    header.write(&mut packet).unwrap();
    packet[IPV4_HEADER_LEN..].copy_from_slice(payload);
    packet
}

pub fn ipv4_frame(
    src_mac: MacAddr,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: IpProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let packet = ipv4_packet(src, dst, protocol, 0x4242, payload);
    ethernet_frame(OUR_MAC, src_mac, EtherType::Ipv4, &packet)
}

pub fn udp_frame(src_mac: MacAddr, src: SockAddr, dst: SockAddr, payload: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0u8; UDP_HEADER_LEN + payload.len()];
    let len = udp::write_datagram(src, dst, payload, &mut datagram).unwrap();
    ipv4_frame(src_mac, src.ip, dst.ip, IpProtocol::Udp, &datagram[..len])
}

// --- Frame decoders ---------------------------------------------------------

pub fn decode_arp(frame: &[u8]) -> Option<ArpPacket> {
    let (eth, payload) = EthernetHeader::parse(frame)?;
    if eth.ether_type() != Some(EtherType::Arp) {
        return None;
    }
    ArpPacket::parse(payload)
}

pub fn decode_ipv4(frame: &[u8]) -> Option<(Ipv4Header, Vec<u8>)> {
    let (eth, payload) = EthernetHeader::parse(frame)?;
    if eth.ether_type() != Some(EtherType::Ipv4) {
        return None;
    }
    let view = IpPacketView::parse(payload).ok()?;
    Some((view.header, view.payload.to_vec()))
}

/// UDP header and payload of a sent frame.
pub fn decode_udp(frame: &[u8]) -> Option<(Ipv4Header, UdpHeader, Vec<u8>)> {
    let (ip, datagram) = decode_ipv4(frame)?;
    if ip.protocol != IpProtocol::Udp.as_u8() {
        return None;
    }
    let (hdr, payload) = UdpHeader::parse(&datagram)?;
    Some((ip, hdr, payload.to_vec()))
}

/// Responder answering ARP requests for `ip` with `mac`.
pub fn arp_responder(
    ip: Ipv4Addr,
    mac: MacAddr,
) -> impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static {
    move |frame| match decode_arp(frame) {
        Some(p) if p.op == ArpOp::Request && p.target_ip == ip => vec![arp_reply(mac, ip)],
        _ => Vec::new(),
    }
}

/// BOOTREPLY from the gateway to OUR_MAC.  Offers `yiaddr` with a /24 mask
/// and the gateway as router, DNS server and server id.
pub fn dhcp_reply(xid: u32, yiaddr: Ipv4Addr, msg_type: u8, lease_secs: Option<u32>) -> Vec<u8> {
    let mut msg = vec![0u8; BOOTP_HEADER_LEN];
    msg[0] = 2;
    msg[1] = 1;
    msg[2] = 6;
    msg[4..8].copy_from_slice(&xid.to_be_bytes());
    msg[16..20].copy_from_slice(&yiaddr.0);
    msg[28..34].copy_from_slice(&OUR_MAC.0);
    msg[236..240].copy_from_slice(&[0x63, 0x82, 0x53, 0x63]);
    msg.extend_from_slice(&[53, 1, msg_type]);
    for (code, addr) in [(54u8, GATEWAY_IP), (1, MASK), (3, GATEWAY_IP), (6, GATEWAY_IP)] {
        msg.extend_from_slice(&[code, 4]);
        msg.extend_from_slice(&addr.0);
    }
    if let Some(secs) = lease_secs {
        msg.extend_from_slice(&[51, 4]);
        msg.extend_from_slice(&secs.to_be_bytes());
    }
    msg.push(255);
    msg
}

/// Responder playing a DHCP server: OFFER for DISCOVER, ACK for REQUEST.
pub fn dhcp_responder(
    offer: Ipv4Addr,
    lease_secs: u32,
) -> impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static {
    move |frame| {
        let Some((_, udp, payload)) = decode_udp(frame) else {
            return Vec::new();
        };
        if udp.dst_port != DHCP_SERVER_PORT || payload.len() < BOOTP_HEADER_LEN {
            return Vec::new();
        }
        let xid = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let reply_type = match parse_options(&payload[BOOTP_HEADER_LEN..]).message_type {
            MSG_DISCOVER => MSG_OFFER,
            MSG_REQUEST => MSG_ACK,
            _ => return Vec::new(),
        };
        let reply = dhcp_reply(xid, offer, reply_type, Some(lease_secs));
        vec![udp_frame(
            GATEWAY_MAC,
            SockAddr::new(GATEWAY_IP, DHCP_SERVER_PORT),
            SockAddr::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT),
            &reply,
        )]
    }
}

/// Answer to the DNS query `query`, carrying one A record.
pub fn dns_answer(query: &[u8], flags: u16, addr: Ipv4Addr, ttl: u32) -> Vec<u8> {
    let mut msg = query.to_vec();
    msg[2..4].copy_from_slice(&flags.to_be_bytes());
    msg[6..8].copy_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1]);
    msg.extend_from_slice(&ttl.to_be_bytes());
    msg.extend_from_slice(&[0, 4]);
    msg.extend_from_slice(&addr.0);
    msg
}

/// Responder playing a DNS server on `server`: every A query resolves to
/// `addr`.  Also answers ARP for the server.
pub fn dns_responder(
    server: Ipv4Addr,
    server_mac: MacAddr,
    addr: Ipv4Addr,
) -> impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static {
    let arp = arp_responder(server, server_mac);
    move |frame| {
        let mut replies = arp(frame);
        if let Some((ip, udp, payload)) = decode_udp(frame)
            && ip.dst == server
            && udp.dst_port == DNS_PORT
        {
            let answer = dns_answer(&payload, 0x8180, addr, 300);
            replies.push(udp_frame(
                server_mac,
                SockAddr::new(server, DNS_PORT),
                SockAddr::new(ip.src, udp.src_port),
                &answer,
            ));
        }
        replies
    }
}

/// Short name of an event, for ordering assertions.
pub fn event_tag(event: &NetworkEvent<'_>) -> &'static str {
    match event {
        NetworkEvent::IpAddressAnnounced(_) => "ip",
        NetworkEvent::SubnetMaskAnnounced(_) => "mask",
        NetworkEvent::DefaultGatewayAnnounced(_) => "gateway",
        NetworkEvent::DnsServersAnnounced(_) => "dns",
        NetworkEvent::DhcpRenewalDue { .. } => "renewal",
        NetworkEvent::DhcpLeaseExpired => "expired",
        NetworkEvent::TcpStateChanged { .. } => "tcp",
        NetworkEvent::LinkChanged(_) => "link",
        NetworkEvent::UdpDatagram(_) => "udp",
    }
}
