//! DHCP client: BOOTP packet construction/parsing and the lease state
//! machine (RFC 2131).
//!
//! [`DhcpClient`] is driven from outside: the stack calls
//! [`DhcpClient::poll`] from its tick path and [`DhcpClient::on_datagram`]
//! for every datagram on port 68, transmits whatever message the returned
//! [`DhcpStep`] asks for, and applies or withdraws the lease.
//!
//! ```text
//! Init -> Selecting -(OFFER)-> Requesting -(ACK)-> Bound
//! Requesting -(NAK or timeout)-> Selecting
//! Bound -(half lease)-> Renewing -(T2)-> Rebinding -(expiry)-> Selecting
//! Renewing/Rebinding -(ACK)-> Bound
//! Renewing/Rebinding -(NAK)-> Selecting
//! ```
//!
//! Only running out of acquisition retries parks the client in Init.

extern crate alloc;

use alloc::string::String;
use core::fmt;

use slopnet_lib::{klog_debug, klog_info, klog_warn};

use crate::config::DhcpParams;
use crate::device::has_elapsed;
use crate::event::DnsServers;
use crate::types::{Ipv4Addr, MacAddr};

// =============================================================================
// Wire constants
// =============================================================================

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const FLAGS_BROADCAST: u16 = 0x8000;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OPTION_PAD: u8 = 0;
const OPTION_SUBNET_MASK: u8 = 1;
const OPTION_ROUTER: u8 = 3;
const OPTION_DNS: u8 = 6;
const OPTION_HOSTNAME: u8 = 12;
const OPTION_DOMAIN_NAME: u8 = 15;
const OPTION_REQUESTED_IP: u8 = 50;
const OPTION_LEASE_TIME: u8 = 51;
const OPTION_MSG_TYPE: u8 = 53;
const OPTION_SERVER_ID: u8 = 54;
const OPTION_PARAM_REQ_LIST: u8 = 55;
const OPTION_RENEWAL_TIME: u8 = 58;
const OPTION_REBINDING_TIME: u8 = 59;
const OPTION_END: u8 = 255;

pub const MSG_DISCOVER: u8 = 1;
pub const MSG_OFFER: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_ACK: u8 = 5;
pub const MSG_NAK: u8 = 6;

/// Fixed BOOTP header including the magic cookie.
pub const BOOTP_HEADER_LEN: usize = 240;

/// Largest message we build: the 576-byte minimum datagram less IP and UDP
/// headers.
pub const DHCP_MAX_MESSAGE: usize = 548;

/// Lease time meaning "never expires".
pub const LEASE_INFINITE: u32 = u32::MAX;

/// Hostnames longer than this are truncated in option 12.
const HOSTNAME_MAX: usize = 63;


// =============================================================================
// Parsing
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    pub message_type: u8,
    pub server_id: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns: DnsServers,
    pub domain_name: Option<String>,
    pub lease_secs: Option<u32>,
    pub renewal_secs: Option<u32>,
    pub rebinding_secs: Option<u32>,
}

fn read_ip(data: &[u8]) -> Ipv4Addr {
    Ipv4Addr([data[0], data[1], data[2], data[3]])
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

pub fn parse_options(options: &[u8]) -> DhcpOptions {
    let mut opts = DhcpOptions::default();
    let mut i = 0usize;
    while i < options.len() {
        let code = options[i];
        if code == OPTION_END {
            break;
        }
        if code == OPTION_PAD {
            i += 1;
            continue;
        }
        if i + 1 >= options.len() {
            break;
        }
        let len = options[i + 1] as usize;
        if i + 2 + len > options.len() {
            break;
        }

        let data = &options[i + 2..i + 2 + len];
        match code {
            OPTION_MSG_TYPE if len >= 1 => opts.message_type = data[0],
            OPTION_SERVER_ID if len >= 4 => opts.server_id = read_ip(data),
            OPTION_SUBNET_MASK if len >= 4 => opts.subnet_mask = read_ip(data),
            OPTION_ROUTER if len >= 4 => opts.router = read_ip(data),
            OPTION_DNS => {
                for chunk in data.chunks_exact(4) {
                    opts.dns.push(read_ip(chunk));
                }
            }
            OPTION_DOMAIN_NAME => {
                opts.domain_name = core::str::from_utf8(data).ok().map(String::from);
            }
            OPTION_LEASE_TIME if len >= 4 => opts.lease_secs = Some(read_u32(data)),
            OPTION_RENEWAL_TIME if len >= 4 => opts.renewal_secs = Some(read_u32(data)),
            OPTION_REBINDING_TIME if len >= 4 => opts.rebinding_secs = Some(read_u32(data)),
            _ => {}
        }

        i += 2 + len;
    }

    opts
}

/// A BOOTREPLY addressed to us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpReply {
    pub yiaddr: Ipv4Addr,
    pub options: DhcpOptions,
}

/// Parse a server reply, checking op, transaction id, client hardware
/// address and the magic cookie.
pub fn parse_bootp_reply(payload: &[u8], xid: u32, mac: MacAddr) -> Option<DhcpReply> {
    if payload.len() < BOOTP_HEADER_LEN {
        return None;
    }
    if payload[0] != BOOTREPLY {
        return None;
    }
    if read_u32(&payload[4..8]) != xid {
        return None;
    }
    if payload[28..34] != mac.0 {
        return None;
    }
    if payload[236..240] != MAGIC_COOKIE {
        return None;
    }

    Some(DhcpReply {
        yiaddr: read_ip(&payload[16..20]),
        options: parse_options(&payload[BOOTP_HEADER_LEN..]),
    })
}

// =============================================================================
// Packet construction
// =============================================================================

struct OptionWriter<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl OptionWriter<'_> {
    fn put(&mut self, code: u8, data: &[u8]) -> Option<()> {
        let end = self.pos + 2 + data.len();
        if end > self.out.len() || data.len() > u8::MAX as usize {
            return None;
        }
        self.out[self.pos] = code;
        self.out[self.pos + 1] = data.len() as u8;
        self.out[self.pos + 2..end].copy_from_slice(data);
        self.pos = end;
        Some(())
    }

    fn finish(self) -> Option<usize> {
        if self.pos >= self.out.len() {
            return None;
        }
        self.out[self.pos] = OPTION_END;
        Some(self.pos + 1)
    }
}

/// Write the BOOTP header shared by every client message.  Returns the
/// offset where options begin.
fn write_bootp_header(
    out: &mut [u8],
    mac: MacAddr,
    xid: u32,
    ciaddr: Ipv4Addr,
    broadcast: bool,
) -> Option<usize> {
    if out.len() < BOOTP_HEADER_LEN {
        return None;
    }
    out[..BOOTP_HEADER_LEN].fill(0);
    out[0] = BOOTREQUEST;
    out[1] = HTYPE_ETHERNET;
    out[2] = 6;
    out[4..8].copy_from_slice(&xid.to_be_bytes());
    if broadcast {
        out[10..12].copy_from_slice(&FLAGS_BROADCAST.to_be_bytes());
    }
    out[12..16].copy_from_slice(&ciaddr.0);
    out[28..34].copy_from_slice(&mac.0);
    out[236..240].copy_from_slice(&MAGIC_COOKIE);
    Some(BOOTP_HEADER_LEN)
}

fn param_request_list(params: &DhcpParams) -> ([u8; 7], usize) {
    let mut list = [
        OPTION_SUBNET_MASK,
        OPTION_ROUTER,
        OPTION_DNS,
        OPTION_LEASE_TIME,
        OPTION_RENEWAL_TIME,
        OPTION_REBINDING_TIME,
        0,
    ];
    let mut len = 6;
    if params.request_domain_name {
        list[len] = OPTION_DOMAIN_NAME;
        len += 1;
    }
    (list, len)
}

pub fn build_discover(mac: MacAddr, xid: u32, params: &DhcpParams, out: &mut [u8]) -> Option<usize> {
    let pos = write_bootp_header(
        out,
        mac,
        xid,
        Ipv4Addr::UNSPECIFIED,
        !params.expect_unicast_response,
    )?;
    let mut w = OptionWriter { out, pos };
    w.put(OPTION_MSG_TYPE, &[MSG_DISCOVER])?;
    let (list, len) = param_request_list(params);
    w.put(OPTION_PARAM_REQ_LIST, &list[..len])?;
    w.finish()
}

/// What a REQUEST is for; decides ciaddr and the server-identifying options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Accepting an offer: requested IP and server id options, ciaddr zero.
    Selecting { requested: Ipv4Addr, server_id: Ipv4Addr },
    /// Extending a lease we hold: ciaddr set, no server options.
    Renewing { ciaddr: Ipv4Addr },
}

pub fn build_request(
    mac: MacAddr,
    xid: u32,
    kind: RequestKind,
    hostname: Option<&str>,
    params: &DhcpParams,
    out: &mut [u8],
) -> Option<usize> {
    let ciaddr = match kind {
        RequestKind::Selecting { .. } => Ipv4Addr::UNSPECIFIED,
        RequestKind::Renewing { ciaddr } => ciaddr,
    };
    let broadcast = !params.expect_unicast_response && ciaddr.is_unspecified();
    let pos = write_bootp_header(out, mac, xid, ciaddr, broadcast)?;
    let mut w = OptionWriter { out, pos };
    w.put(OPTION_MSG_TYPE, &[MSG_REQUEST])?;
    if let RequestKind::Selecting {
        requested,
        server_id,
    } = kind
    {
        w.put(OPTION_REQUESTED_IP, &requested.0)?;
        w.put(OPTION_SERVER_ID, &server_id.0)?;
    }
    let (list, len) = param_request_list(params);
    w.put(OPTION_PARAM_REQ_LIST, &list[..len])?;
    if let Some(name) = hostname.filter(|n| !n.is_empty()) {
        let bytes = name.as_bytes();
        w.put(OPTION_HOSTNAME, &bytes[..bytes.len().min(HOSTNAME_MAX)])?;
    }
    w.finish()
}

// =============================================================================
// Client state machine
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhcpState {
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DhcpError {
    /// No lease after every DISCOVER/REQUEST attempt.
    NoLease = 1,
    /// The server refused our REQUEST.
    Nak = 2,
    /// The lease ran out without renewal.
    LeaseExpired = 3,
}

impl fmt::Display for DhcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoLease => write!(f, "no lease obtained"),
            Self::Nak => write!(f, "request refused by server"),
            Self::LeaseExpired => write!(f, "lease expired"),
        }
    }
}

/// An address lease.
///
/// Lease times run to months, past the point where the 32-bit tick wraps,
/// so the lease keeps its own 64-bit count of time held instead of
/// absolute deadlines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpLease {
    pub ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_servers: DnsServers,
    pub lease_secs: u32,
    /// Always half the lease.
    pub renewal_secs: u32,
    pub rebinding_secs: u32,
    pub server_id: Ipv4Addr,
    pub domain_name: Option<String>,
    pub acquired_ms: u32,
    held_ms: u64,
    last_tick_ms: u32,
}

impl DhcpLease {
    pub fn is_infinite(&self) -> bool {
        self.lease_secs == LEASE_INFINITE
    }

    /// Time since the lease was granted or last extended.
    pub fn held_ms(&self) -> u64 {
        self.held_ms
    }

    /// Count time up to `now_ms`.  Needs a call at least every 2^31 ms.
    fn advance(&mut self, now_ms: u32) {
        let delta = now_ms.wrapping_sub(self.last_tick_ms);
        if (delta as i32) > 0 {
            self.held_ms += delta as u64;
            self.last_tick_ms = now_ms;
        }
    }

    fn renewal_due(&self) -> bool {
        !self.is_infinite() && self.held_ms >= secs_to_ms(self.renewal_secs)
    }

    fn rebinding_due(&self) -> bool {
        !self.is_infinite() && self.held_ms >= secs_to_ms(self.rebinding_secs)
    }

    fn expired(&self) -> bool {
        !self.is_infinite() && self.held_ms >= secs_to_ms(self.lease_secs)
    }
}

fn secs_to_ms(secs: u32) -> u64 {
    secs as u64 * 1000
}

/// Transaction id for a fresh exchange after the old one failed.
fn next_xid(xid: u32) -> u32 {
    xid.wrapping_mul(1_664_525).wrapping_add(1_013_904_223)
}

/// Message the client wants transmitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DhcpMessage {
    pub kind: MessageKind,
    /// Broadcast, or the server for a unicast renewal.
    pub dst: Ipv4Addr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Discover,
    Request(RequestKind),
}

/// Everything one call into the client asks of the stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DhcpStep {
    pub transmit: Option<DhcpMessage>,
    /// A lease was granted or extended; apply [`DhcpClient::lease`].
    pub bound: bool,
    /// Entered RENEWING; carries the lease length in seconds.
    pub renewal_due: Option<u32>,
    /// The lease was withdrawn; unconfigure the interface.
    pub lease_lost: bool,
    pub failed: Option<DhcpError>,
}

pub struct DhcpClient {
    params: DhcpParams,
    state: DhcpState,
    mac: MacAddr,
    hostname: Option<String>,
    xid: u32,
    attempts: u8,
    transmit_due: bool,
    sent_ms: u32,
    offer: Option<(Ipv4Addr, Ipv4Addr)>,
    lease: Option<DhcpLease>,
}

impl DhcpClient {
    pub fn new(params: DhcpParams) -> Self {
        Self {
            params,
            state: DhcpState::Init,
            mac: MacAddr::ZERO,
            hostname: None,
            xid: 0,
            attempts: 0,
            transmit_due: false,
            sent_ms: 0,
            offer: None,
            lease: None,
        }
    }

    pub fn state(&self) -> DhcpState {
        self.state
    }

    pub fn lease(&self) -> Option<&DhcpLease> {
        self.lease.as_ref()
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Begin lease acquisition.  The DISCOVER goes out on the next poll.
    pub fn start(&mut self, mac: MacAddr, hostname: Option<&str>, xid: u32) {
        klog_info!("dhcp: starting, xid={:#010x}", xid);
        self.mac = mac;
        self.hostname = hostname.map(String::from);
        self.xid = xid;
        self.attempts = 1;
        self.lease = None;
        self.discover();
    }

    /// Forget the lease and go idle.
    pub fn stop(&mut self) {
        self.state = DhcpState::Init;
        self.transmit_due = false;
        self.offer = None;
        self.lease = None;
    }

    fn discover(&mut self) {
        self.offer = None;
        self.state = DhcpState::Selecting;
        self.transmit_due = true;
    }

    fn set_state(&mut self, new: DhcpState) {
        klog_debug!("dhcp: {:?} -> {:?}", self.state, new);
        self.state = new;
    }

    fn message(&self) -> Option<DhcpMessage> {
        let kind = match self.state {
            DhcpState::Init | DhcpState::Bound => return None,
            DhcpState::Selecting => MessageKind::Discover,
            DhcpState::Requesting => {
                let (requested, server_id) = self.offer?;
                MessageKind::Request(RequestKind::Selecting {
                    requested,
                    server_id,
                })
            }
            DhcpState::Renewing | DhcpState::Rebinding => {
                let lease = self.lease.as_ref()?;
                MessageKind::Request(RequestKind::Renewing { ciaddr: lease.ip })
            }
        };
        let dst = match (self.state, self.lease.as_ref()) {
            (DhcpState::Renewing, Some(lease)) if lease.server_id.is_valid() => lease.server_id,
            _ => Ipv4Addr::BROADCAST,
        };
        Some(DhcpMessage { kind, dst })
    }

    fn transmit(&mut self, step: &mut DhcpStep, now_ms: u32) {
        self.transmit_due = false;
        self.sent_ms = now_ms;
        step.transmit = self.message();
    }

    /// Serialize `msg` into `out`.
    pub fn write_message(&self, msg: &DhcpMessage, out: &mut [u8]) -> Option<usize> {
        match msg.kind {
            MessageKind::Discover => build_discover(self.mac, self.xid, &self.params, out),
            MessageKind::Request(kind) => build_request(
                self.mac,
                self.xid,
                kind,
                self.hostname.as_deref(),
                &self.params,
                out,
            ),
        }
    }

    fn lose_lease(&mut self, step: &mut DhcpStep) {
        if self.lease.take().is_some() {
            step.lease_lost = true;
        }
        self.offer = None;
        self.transmit_due = false;
        self.set_state(DhcpState::Init);
    }

    /// Drop the lease and start over from DISCOVER with a new transaction.
    /// The DISCOVER goes out on the next poll.
    fn restart(&mut self, step: &mut DhcpStep) {
        self.lose_lease(step);
        self.xid = next_xid(self.xid);
        self.attempts = 1;
        klog_info!("dhcp: restarting discovery, xid={:#010x}", self.xid);
        self.discover();
    }

    /// Count a failed exchange during acquisition and try again, or give up
    /// once the retries are spent.
    fn retry(&mut self, step: &mut DhcpStep, now_ms: u32) {
        if self.attempts >= self.params.max_retries {
            klog_warn!("dhcp: no lease after {} attempts", self.attempts);
            self.lose_lease(step);
            step.failed = Some(DhcpError::NoLease);
            return;
        }
        self.attempts += 1;
        self.xid = self.xid.wrapping_add(1);
        klog_debug!("dhcp: attempt {}", self.attempts);
        self.discover();
        self.transmit(step, now_ms);
    }

    /// Run timers: retransmission, retries, renewal, rebinding and expiry.
    pub fn poll(&mut self, now_ms: u32) -> DhcpStep {
        let mut step = DhcpStep::default();
        match self.state {
            DhcpState::Init => {}
            DhcpState::Selecting | DhcpState::Requesting => {
                if self.transmit_due {
                    self.transmit(&mut step, now_ms);
                } else if has_elapsed(self.sent_ms, self.params.response_timeout_ms, now_ms) {
                    klog_debug!("dhcp: no answer in {:?}", self.state);
                    self.retry(&mut step, now_ms);
                }
            }
            DhcpState::Bound => {
                let Some(lease) = self.lease.as_mut() else {
                    self.set_state(DhcpState::Init);
                    return step;
                };
                lease.advance(now_ms);
                if !lease.renewal_due() {
                    return step;
                }
                let lease_secs = lease.lease_secs;
                klog_info!("dhcp: renewal due");
                self.set_state(DhcpState::Renewing);
                self.xid = self.xid.wrapping_add(1);
                step.renewal_due = Some(lease_secs);
                self.transmit(&mut step, now_ms);
            }
            DhcpState::Renewing | DhcpState::Rebinding => {
                let Some(lease) = self.lease.as_mut() else {
                    self.set_state(DhcpState::Init);
                    return step;
                };
                lease.advance(now_ms);
                if lease.expired() {
                    klog_warn!("dhcp: lease on {} expired", lease.ip);
                    self.restart(&mut step);
                    step.failed = Some(DhcpError::LeaseExpired);
                } else if self.state == DhcpState::Renewing && lease.rebinding_due() {
                    self.set_state(DhcpState::Rebinding);
                    self.transmit(&mut step, now_ms);
                } else if has_elapsed(self.sent_ms, self.params.response_timeout_ms, now_ms) {
                    self.transmit(&mut step, now_ms);
                }
            }
        }
        step
    }

    /// Handle a datagram received on the client port.
    pub fn on_datagram(&mut self, payload: &[u8], now_ms: u32) -> DhcpStep {
        let mut step = DhcpStep::default();
        if matches!(self.state, DhcpState::Init | DhcpState::Bound) {
            return step;
        }
        let Some(reply) = parse_bootp_reply(payload, self.xid, self.mac) else {
            klog_debug!("dhcp: ignoring datagram not meant for us");
            return step;
        };

        match (self.state, reply.options.message_type) {
            (DhcpState::Selecting, MSG_OFFER) => {
                if !reply.options.server_id.is_valid() {
                    klog_debug!("dhcp: OFFER without server id ignored");
                    return step;
                }
                klog_debug!(
                    "dhcp: OFFER {} from {}",
                    reply.yiaddr,
                    reply.options.server_id
                );
                self.offer = Some((reply.yiaddr, reply.options.server_id));
                self.set_state(DhcpState::Requesting);
                self.transmit(&mut step, now_ms);
            }
            (
                DhcpState::Requesting | DhcpState::Renewing | DhcpState::Rebinding,
                MSG_ACK,
            ) => {
                self.bind(reply, now_ms);
                step.bound = true;
            }
            (DhcpState::Requesting, MSG_NAK) => {
                klog_warn!("dhcp: offer from {:?} withdrawn", self.offer.map(|(_, id)| id));
                self.retry(&mut step, now_ms);
            }
            (DhcpState::Renewing | DhcpState::Rebinding, MSG_NAK) => {
                klog_warn!("dhcp: NAK in {:?}", self.state);
                self.restart(&mut step);
                step.failed = Some(DhcpError::Nak);
            }
            (state, msg_type) => {
                klog_debug!("dhcp: unexpected message {} in {:?}", msg_type, state);
            }
        }
        step
    }

    fn bind(&mut self, reply: DhcpReply, now_ms: u32) {
        let opts = reply.options;
        let lease_secs = opts.lease_secs.unwrap_or(LEASE_INFINITE);
        // A server's T1 is ignored: renewal always starts at half the lease.
        let renewal_secs = lease_secs / 2;
        let rebinding_secs = opts
            .rebinding_secs
            .unwrap_or((lease_secs as u64 * 7 / 8) as u32)
            .clamp(renewal_secs, lease_secs);
        let server_id = if opts.server_id.is_valid() {
            opts.server_id
        } else {
            self.offer
                .map(|(_, id)| id)
                .or(self.lease.as_ref().map(|l| l.server_id))
                .unwrap_or(Ipv4Addr::UNSPECIFIED)
        };

        let lease = DhcpLease {
            ip: reply.yiaddr,
            subnet_mask: opts.subnet_mask,
            gateway: opts.router,
            dns_servers: opts.dns,
            lease_secs,
            renewal_secs,
            rebinding_secs,
            server_id,
            domain_name: opts.domain_name,
            acquired_ms: now_ms,
            held_ms: 0,
            last_tick_ms: now_ms,
        };
        klog_info!(
            "dhcp: bound to {} mask {} gw {} lease {}s",
            lease.ip,
            lease.subnet_mask,
            lease.gateway,
            lease.lease_secs
        );
        self.lease = Some(lease);
        self.offer = None;
        self.attempts = 0;
        self.set_state(DhcpState::Bound);
    }
}
