//! DNS client: wire protocol, cache, and resolver state.
//!
//! A minimal stub resolver for A-record lookups over UDP.  One query is in
//! flight at a time; [`DnsClient::poll`] drives resends across the
//! configured servers and the overall deadline, and the stack feeds every
//! datagram from port 53 through [`DnsClient::on_datagram`].

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use slopnet_lib::{klog_debug, klog_info};

use crate::device::{deadline_reached, has_elapsed};
use crate::event::DnsServers;
use crate::ports::DNS_PORT;
use crate::types::{Ipv4Addr, Port, SockAddr};

// =============================================================================
// Constants
// =============================================================================

/// Maximum DNS name length (RFC 1035).
const DNS_NAME_MAX: usize = 253;
/// Maximum label length (RFC 1035).
const DNS_LABEL_MAX: usize = 63;
/// DNS header length.
pub const DNS_HEADER_LEN: usize = 12;
/// Maximum standard DNS UDP message size.
pub const DNS_MAX_MESSAGE: usize = 512;
/// Maximum compression pointer follows (loop detection).
const MAX_POINTER_FOLLOWS: usize = 16;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// Cache TTLs are capped so expiry stays comparable on a wrapping clock.
const MAX_TTL_MS: u32 = i32::MAX as u32;

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsError {
    /// No usable reply before the deadline.
    Timeout,
    /// No DNS server configured or announced.
    Unconfigured,
    /// The reply had the TC bit set.
    Truncated,
    /// The server answered with a non-zero RCODE.
    ServerError(u8),
    /// The reply carried no A record.
    NoAddress,
    /// The hostname cannot be encoded as a DNS name.
    InvalidName,
}

impl DnsError {
    /// Numeric code for error events.  The RCODE of `ServerError` travels
    /// as the event cause.
    pub const fn discriminant(&self) -> u16 {
        match self {
            Self::Timeout => 1,
            Self::Unconfigured => 2,
            Self::Truncated => 3,
            Self::ServerError(_) => 4,
            Self::NoAddress => 5,
            Self::InvalidName => 6,
        }
    }
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "query timed out"),
            Self::Unconfigured => write!(f, "no DNS server configured"),
            Self::Truncated => write!(f, "reply truncated"),
            Self::ServerError(rcode) => write!(f, "server error (rcode {})", rcode),
            Self::NoAddress => write!(f, "no A record in reply"),
            Self::InvalidName => write!(f, "invalid hostname"),
        }
    }
}

// =============================================================================
// Wire format
// =============================================================================

/// Parsed DNS header (12 bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    /// QR bit: 0 = query, 1 = response.
    pub fn qr(&self) -> bool {
        (self.flags & FLAG_QR) != 0
    }

    pub fn truncated(&self) -> bool {
        (self.flags & FLAG_TC) != 0
    }

    /// RCODE (low 4 bits of flags).
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }

    fn to_bytes(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf[4..6].copy_from_slice(&self.qdcount.to_be_bytes());
        buf[6..8].copy_from_slice(&self.ancount.to_be_bytes());
        buf[8..10].copy_from_slice(&self.nscount.to_be_bytes());
        buf[10..12].copy_from_slice(&self.arcount.to_be_bytes());
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < DNS_HEADER_LEN {
            return None;
        }
        Some(DnsHeader {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            flags: u16::from_be_bytes([buf[2], buf[3]]),
            qdcount: u16::from_be_bytes([buf[4], buf[5]]),
            ancount: u16::from_be_bytes([buf[6], buf[7]]),
            nscount: u16::from_be_bytes([buf[8], buf[9]]),
            arcount: u16::from_be_bytes([buf[10], buf[11]]),
        })
    }
}

/// Encode a hostname into DNS wire format (length-prefixed labels).
///
/// `"example.com"` → `[7, e,x,a,m,p,l,e, 3, c,o,m, 0]`
///
/// Returns the number of bytes written, or `None` on invalid input.
pub fn encode_name(hostname: &[u8], buf: &mut [u8]) -> Option<usize> {
    if hostname.len() > DNS_NAME_MAX {
        return None;
    }

    // Strip trailing dot if present
    let hostname = hostname.strip_suffix(b".").unwrap_or(hostname);

    let mut out_pos = 0usize;
    if !hostname.is_empty() {
        for label in hostname.split(|&b| b == b'.') {
            if label.is_empty() || label.len() > DNS_LABEL_MAX {
                return None;
            }
            // Length byte + label + at least the trailing zero
            if out_pos + 1 + label.len() >= buf.len() {
                return None;
            }
            buf[out_pos] = label.len() as u8;
            out_pos += 1;
            buf[out_pos..out_pos + label.len()].copy_from_slice(label);
            out_pos += label.len();
        }
    }

    if out_pos >= buf.len() {
        return None;
    }
    buf[out_pos] = 0;
    Some(out_pos + 1)
}

/// Build an A query with recursion desired.  Returns the message length.
pub fn build_query(id: u16, hostname: &[u8], buf: &mut [u8]) -> Option<usize> {
    if buf.len() < DNS_HEADER_LEN + 5 {
        return None;
    }

    let header = DnsHeader {
        id,
        flags: FLAG_RD,
        qdcount: 1,
        ..DnsHeader::default()
    };
    header.to_bytes(&mut buf[..DNS_HEADER_LEN]);

    let name_len = encode_name(hostname, &mut buf[DNS_HEADER_LEN..])?;
    let q_start = DNS_HEADER_LEN + name_len;
    if q_start + 4 > buf.len() {
        return None;
    }
    buf[q_start..q_start + 2].copy_from_slice(&TYPE_A.to_be_bytes());
    buf[q_start + 2..q_start + 4].copy_from_slice(&CLASS_IN.to_be_bytes());

    Some(q_start + 4)
}

/// Skip a DNS name in wire format, returning the offset after it.
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    let mut labels = 0usize;
    loop {
        let b = *packet.get(pos)?;
        if b == 0 {
            return Some(pos + 1);
        }
        if (b & 0xC0) == 0xC0 {
            // Compression pointer ends the name in place
            if pos + 1 >= packet.len() {
                return None;
            }
            return Some(pos + 2);
        }
        if (b & 0xC0) != 0 {
            return None;
        }
        pos += 1 + b as usize;
        labels += 1;
        if labels > DNS_NAME_MAX / 2 {
            return None;
        }
    }
}

/// Decode a possibly compressed name at `offset` into dotted form.
/// Returns the decoded length.
pub fn decode_name(packet: &[u8], offset: usize, out: &mut [u8]) -> Option<usize> {
    let mut pos = offset;
    let mut out_pos = 0usize;
    let mut pointer_count = 0usize;

    loop {
        let len_or_ptr = *packet.get(pos)?;
        if len_or_ptr == 0 {
            return Some(out_pos);
        }

        if (len_or_ptr & 0xC0) == 0xC0 {
            let low = *packet.get(pos + 1)?;
            pointer_count += 1;
            if pointer_count > MAX_POINTER_FOLLOWS {
                return None;
            }
            pos = ((len_or_ptr as usize & 0x3F) << 8) | low as usize;
            continue;
        }
        if (len_or_ptr & 0xC0) != 0 {
            return None;
        }

        let label_len = len_or_ptr as usize;
        pos += 1;
        if pos + label_len > packet.len() {
            return None;
        }
        if out_pos > 0 {
            *out.get_mut(out_pos)? = b'.';
            out_pos += 1;
        }
        out.get_mut(out_pos..out_pos + label_len)?
            .copy_from_slice(&packet[pos..pos + label_len]);
        out_pos += label_len;
        pos += label_len;
    }
}

/// Outcome of a reply that matched our query id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsReply {
    Address { addr: Ipv4Addr, ttl: u32 },
    Failed(DnsError),
}

/// Parse a response to query `expected_id`.  Returns `None` for anything
/// that is not a well-formed response to that query; such datagrams are
/// dropped and the query keeps waiting.
pub fn parse_response(packet: &[u8], expected_id: u16) -> Option<DnsReply> {
    let header = DnsHeader::from_bytes(packet)?;
    if !header.qr() || header.id != expected_id {
        return None;
    }
    if header.rcode() != 0 {
        return Some(DnsReply::Failed(DnsError::ServerError(header.rcode())));
    }
    if header.truncated() {
        return Some(DnsReply::Failed(DnsError::Truncated));
    }

    let mut pos = DNS_HEADER_LEN;
    for _ in 0..header.qdcount {
        pos = skip_name(packet, pos)?;
        if pos + 4 > packet.len() {
            return None;
        }
        pos += 4;
    }

    for _ in 0..header.ancount {
        pos = skip_name(packet, pos)?;
        if pos + 10 > packet.len() {
            return None;
        }
        let rr_type = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rr_class = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);
        let ttl = u32::from_be_bytes([
            packet[pos + 4],
            packet[pos + 5],
            packet[pos + 6],
            packet[pos + 7],
        ]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > packet.len() {
            return None;
        }

        // CNAME records are skipped; the target's A record follows them
        if rr_type == TYPE_A && rr_class == CLASS_IN && rdlength == 4 {
            let addr = Ipv4Addr([
                packet[pos],
                packet[pos + 1],
                packet[pos + 2],
                packet[pos + 3],
            ]);
            return Some(DnsReply::Address { addr, ttl });
        }
        pos += rdlength;
    }

    Some(DnsReply::Failed(DnsError::NoAddress))
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Clone, Debug)]
struct DnsCacheEntry {
    /// FNV-1a hash of `hostname`, checked first.
    hostname_hash: u32,
    /// Lowercased.
    hostname: Vec<u8>,
    addr: Ipv4Addr,
    expiry_ms: u32,
    last_used_ms: u32,
}

/// Fixed-capacity hostname cache with LRU replacement.
pub struct DnsCache {
    entries: Vec<DnsCacheEntry>,
    capacity: usize,
    min_ttl_secs: u32,
}

impl DnsCacheEntry {
    fn matches(&self, hash: u32, hostname: &[u8]) -> bool {
        self.hostname_hash == hash && self.hostname.eq_ignore_ascii_case(hostname)
    }
}

impl DnsCache {
    pub fn new(capacity: usize, min_ttl_secs: u32) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            min_ttl_secs,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&mut self, hostname: &[u8], now_ms: u32) -> Option<Ipv4Addr> {
        let hash = fnv1a_hash(hostname);
        let idx = self
            .entries
            .iter()
            .position(|e| e.matches(hash, hostname))?;
        if deadline_reached(self.entries[idx].expiry_ms, now_ms) {
            self.entries.swap_remove(idx);
            return None;
        }
        let entry = &mut self.entries[idx];
        entry.last_used_ms = now_ms;
        Some(entry.addr)
    }

    pub fn insert(&mut self, hostname: &[u8], addr: Ipv4Addr, ttl_secs: u32, now_ms: u32) {
        if self.capacity == 0 {
            return;
        }
        let hash = fnv1a_hash(hostname);
        let ttl_ms = ttl_secs
            .max(self.min_ttl_secs)
            .saturating_mul(1000)
            .min(MAX_TTL_MS);
        let entry = DnsCacheEntry {
            hostname_hash: hash,
            hostname: hostname.to_ascii_lowercase(),
            addr,
            expiry_ms: now_ms.wrapping_add(ttl_ms),
            last_used_ms: now_ms,
        };

        if let Some(existing) = self.entries.iter_mut().find(|e| e.matches(hash, hostname)) {
            *existing = entry;
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return;
        }

        // Evict the entry idle the longest
        let lru_idx = self
            .entries
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| now_ms.wrapping_sub(e.last_used_ms))
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.entries[lru_idx] = entry;
    }

    pub fn flush(&mut self) {
        self.entries.clear();
    }
}

/// FNV-1a hash for hostname cache keys.
pub(crate) fn fnv1a_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= byte.to_ascii_lowercase() as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

// =============================================================================
// Resolver state
// =============================================================================

#[derive(Debug)]
struct DnsQuery {
    id: u16,
    hostname: String,
    src_port: Port,
    started_ms: u32,
    timeout_ms: u32,
    last_sent_ms: u32,
    server_index: usize,
    result: Option<Result<Ipv4Addr, DnsError>>,
}

/// What the stack should do after [`DnsClient::poll`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsStatus {
    Idle,
    Pending,
    /// Send the query again, to this server.
    Resend(Ipv4Addr),
    /// The query finished.  `port` is free to release.
    Done {
        port: Port,
        result: Result<Ipv4Addr, DnsError>,
    },
}

pub struct DnsClient {
    servers: DnsServers,
    cache: DnsCache,
    query: Option<DnsQuery>,
}

impl DnsClient {
    pub fn new(cache_size: usize, min_ttl_secs: u32) -> Self {
        Self {
            servers: DnsServers::EMPTY,
            cache: DnsCache::new(cache_size, min_ttl_secs),
            query: None,
        }
    }

    pub fn servers(&self) -> DnsServers {
        self.servers
    }

    pub fn set_servers(&mut self, servers: DnsServers) {
        if servers != self.servers {
            klog_info!("dns: {} server(s) configured", servers.len());
        }
        self.servers = servers;
    }

    pub fn cache(&mut self) -> &mut DnsCache {
        &mut self.cache
    }

    pub fn is_busy(&self) -> bool {
        self.query.is_some()
    }

    /// Answer without the network: `localhost`, dotted literals, cache hits.
    pub fn resolve_local(&mut self, hostname: &str, now_ms: u32) -> Option<Ipv4Addr> {
        if hostname.eq_ignore_ascii_case("localhost") {
            return Some(Ipv4Addr::LOCALHOST);
        }
        if let Some(addr) = Ipv4Addr::parse_bytes(hostname.as_bytes()) {
            return Some(addr);
        }
        let addr = self.cache.lookup(hostname.as_bytes(), now_ms)?;
        klog_debug!("dns: cache hit for {} -> {}", hostname, addr);
        Some(addr)
    }

    /// Start a query, replacing any outstanding one.  Returns the first
    /// server to send to; the message itself comes from [`write_query`].
    ///
    /// [`write_query`]: DnsClient::write_query
    pub fn begin_query(
        &mut self,
        hostname: &str,
        id: u16,
        src_port: Port,
        timeout_ms: u32,
        now_ms: u32,
    ) -> Result<Ipv4Addr, DnsError> {
        let server = *self
            .servers
            .as_slice()
            .first()
            .ok_or(DnsError::Unconfigured)?;
        let mut probe = [0u8; DNS_MAX_MESSAGE];
        build_query(id, hostname.as_bytes(), &mut probe).ok_or(DnsError::InvalidName)?;

        klog_debug!("dns: query {:#06x} for {} via {}", id, hostname, server);
        self.query = Some(DnsQuery {
            id,
            hostname: String::from(hostname),
            src_port,
            started_ms: now_ms,
            timeout_ms,
            last_sent_ms: now_ms,
            server_index: 0,
            result: None,
        });
        Ok(server)
    }

    /// Source port of the outstanding query.
    pub fn query_port(&self) -> Option<Port> {
        self.query.as_ref().map(|q| q.src_port)
    }

    pub fn write_query(&self, out: &mut [u8]) -> Option<usize> {
        let query = self.query.as_ref()?;
        build_query(query.id, query.hostname.as_bytes(), out)
    }

    /// Offer an inbound datagram.  Returns `true` when it was addressed to
    /// the query port, whether or not it answered the query.
    pub fn on_datagram(&mut self, src: SockAddr, dst_port: Port, payload: &[u8], now_ms: u32) -> bool {
        let Some(query) = self.query.as_mut() else {
            return false;
        };
        if dst_port != query.src_port {
            return false;
        }
        if src.port != DNS_PORT || query.result.is_some() {
            return true;
        }

        match parse_response(payload, query.id) {
            None => {
                klog_debug!("dns: discarded reply from {}", src);
            }
            Some(DnsReply::Address { addr, ttl }) => {
                klog_debug!("dns: resolved {} -> {} (ttl={}s)", query.hostname, addr, ttl);
                self.cache.insert(query.hostname.as_bytes(), addr, ttl, now_ms);
                query.result = Some(Ok(addr));
            }
            Some(DnsReply::Failed(err)) => {
                klog_debug!("dns: {} failed: {}", query.hostname, err);
                query.result = Some(Err(err));
            }
        }
        true
    }

    /// Advance the outstanding query.
    pub fn poll(&mut self, now_ms: u32) -> DnsStatus {
        let Some(query) = self.query.as_mut() else {
            return DnsStatus::Idle;
        };

        let result = if let Some(result) = query.result {
            result
        } else if has_elapsed(query.started_ms, query.timeout_ms, now_ms) {
            klog_debug!("dns: query {:#06x} timed out", query.id);
            Err(DnsError::Timeout)
        } else {
            let servers = self.servers.as_slice();
            if servers.len() > 1 {
                let interval = query.timeout_ms / servers.len() as u32;
                if has_elapsed(query.last_sent_ms, interval, now_ms) {
                    query.server_index = (query.server_index + 1) % servers.len();
                    query.last_sent_ms = now_ms;
                    return DnsStatus::Resend(servers[query.server_index]);
                }
            }
            return DnsStatus::Pending;
        };

        let port = query.src_port;
        self.query = None;
        DnsStatus::Done { port, result }
    }

    /// Drop the outstanding query without a result.
    pub fn cancel(&mut self) -> Option<Port> {
        self.query.take().map(|q| q.src_port)
    }
}
