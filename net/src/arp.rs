//! ARP resolver: wire codec and the IP→MAC cache.
//!
//! # Cache model
//!
//! Each entry is either **Pending** (request broadcast, waiting for a reply)
//! or **Resolved**.  There is at most one entry per IP, so a second
//! `resolve()` for an IP already Pending never duplicates the request.
//!
//! - Pending entries re-broadcast every `reply_timeout / max_retries` ms.
//!   Once `max_retries` requests have gone unanswered the entry is dropped
//!   and the IP is remembered as failed: the next `resolve()` for it reports
//!   [`NetError::Unreachable`] exactly once, which is how a blocked sender
//!   learns that its destination is gone.
//! - Resolved entries live for `entry_lifetime_ms` after their last update.
//! - When the table is full, the least recently used Resolved entry is
//!   evicted.  Pending entries are never evicted by table pressure.
//!
//! The cache does no I/O.  Methods return what should be transmitted and the
//! stack builds and sends the frames.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use slopnet_lib::{RingBuffer, klog_debug, klog_info, klog_warn};

use crate::config::ArpParams;
use crate::device::has_elapsed;
use crate::types::{EtherType, Ipv4Addr, MacAddr, NetError};

// =============================================================================
// Wire format
// =============================================================================

pub const ARP_PACKET_LEN: usize = 28;
const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_HLEN_ETHERNET: u8 = 6;
const ARP_PLEN_IPV4: u8 = 4;

/// Remembered failures, consumed by the next `resolve()` of the same IP.
const FAILED_HISTORY: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

/// Ethernet/IPv4 ARP body (RFC 826).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_PACKET_LEN {
            return None;
        }
        let htype = u16::from_be_bytes([data[0], data[1]]);
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        if htype != ARP_HTYPE_ETHERNET
            || ptype != EtherType::Ipv4.as_u16()
            || data[4] != ARP_HLEN_ETHERNET
            || data[5] != ARP_PLEN_IPV4
        {
            return None;
        }
        let op = match u16::from_be_bytes([data[6], data[7]]) {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            _ => return None,
        };
        let mut sender_mac = [0u8; 6];
        let mut sender_ip = [0u8; 4];
        let mut target_mac = [0u8; 6];
        let mut target_ip = [0u8; 4];
        sender_mac.copy_from_slice(&data[8..14]);
        sender_ip.copy_from_slice(&data[14..18]);
        target_mac.copy_from_slice(&data[18..24]);
        target_ip.copy_from_slice(&data[24..28]);
        Some(Self {
            op,
            sender_mac: MacAddr(sender_mac),
            sender_ip: Ipv4Addr(sender_ip),
            target_mac: MacAddr(target_mac),
            target_ip: Ipv4Addr(target_ip),
        })
    }

    pub fn write(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < ARP_PACKET_LEN {
            return None;
        }
        out[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
        out[2..4].copy_from_slice(&EtherType::Ipv4.as_u16().to_be_bytes());
        out[4] = ARP_HLEN_ETHERNET;
        out[5] = ARP_PLEN_IPV4;
        out[6..8].copy_from_slice(&(self.op as u16).to_be_bytes());
        out[8..14].copy_from_slice(&self.sender_mac.0);
        out[14..18].copy_from_slice(&self.sender_ip.0);
        out[18..24].copy_from_slice(&self.target_mac.0);
        out[24..28].copy_from_slice(&self.target_ip.0);
        Some(ARP_PACKET_LEN)
    }

    pub const fn request(our_mac: MacAddr, our_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            op: ArpOp::Request,
            sender_mac: our_mac,
            sender_ip: our_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    /// Gratuitous announcement: a request whose sender and target IP are ours.
    pub const fn announcement(our_mac: MacAddr, our_ip: Ipv4Addr) -> Self {
        Self::request(our_mac, our_ip, our_ip)
    }

    /// Address probe (RFC 5227): a request with a zero sender address.
    pub const fn probe(our_mac: MacAddr, target_ip: Ipv4Addr) -> Self {
        Self::request(our_mac, Ipv4Addr::UNSPECIFIED, target_ip)
    }

    #[inline]
    pub fn is_probe(&self) -> bool {
        self.op == ArpOp::Request && self.sender_ip.is_unspecified()
    }

    /// The reply answering `self` (a request) on behalf of `our_mac`.
    pub const fn reply_to(&self, our_mac: MacAddr) -> Self {
        Self {
            op: ArpOp::Reply,
            sender_mac: our_mac,
            sender_ip: self.target_ip,
            target_mac: self.sender_mac,
            target_ip: self.sender_ip,
        }
    }

    #[inline]
    pub fn is_gratuitous(&self) -> bool {
        self.sender_ip == self.target_ip
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ArpError {
    /// A Resolved entry changed MAC (last writer wins).
    AddressConflict = 1,
    /// Another station claims our IP.
    IpAddressClash = 2,
    /// Request retries exhausted.
    Timeout = 3,
}

impl fmt::Display for ArpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressConflict => write!(f, "MAC changed for a resolved address"),
            Self::IpAddressClash => write!(f, "another station uses our IP"),
            Self::Timeout => write!(f, "no reply to ARP request"),
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpState {
    Pending {
        /// Requests sent so far, including the first.
        requests: u8,
        last_request_ms: u32,
    },
    Resolved {
        mac: MacAddr,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub state: ArpState,
    pub last_update_ms: u32,
    pub last_used_ms: u32,
}

/// Result of [`ArpCache::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpResolve {
    Resolved(MacAddr),
    /// Not available yet.  `send_request` is set only when this call created
    /// the Pending entry; the caller broadcasts the request.
    Pending { send_request: bool },
}

/// Outcome of learning from an inbound ARP packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArpLearn {
    /// A Pending entry flipped to Resolved.
    pub resolved_pending: bool,
    /// Previous MAC when a Resolved entry changed.
    pub conflict: Option<MacAddr>,
}

/// Work produced by [`ArpCache::tick`].
#[derive(Debug, Default)]
pub struct ArpTick {
    /// IPs whose request must be re-broadcast.
    pub retransmit: Vec<Ipv4Addr>,
    /// IPs dropped after exhausting their retries.
    pub failed: Vec<Ipv4Addr>,
}

pub struct ArpCache {
    entries: Vec<ArpEntry>,
    capacity: usize,
    params: ArpParams,
    failed: RingBuffer<Ipv4Addr, FAILED_HISTORY>,
}

impl ArpCache {
    pub fn new(params: ArpParams) -> Self {
        Self {
            entries: Vec::with_capacity(params.cache_size),
            capacity: params.cache_size,
            params,
            failed: RingBuffer::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, ip: Ipv4Addr) -> Option<&ArpEntry> {
        self.entries.iter().find(|e| e.ip == ip)
    }

    /// Cached MAC for `ip`, without creating or touching anything.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        match self.entry(ip)?.state {
            ArpState::Resolved { mac } => Some(mac),
            ArpState::Pending { .. } => None,
        }
    }

    /// Look up `ip`, creating a Pending entry on a miss.
    pub fn resolve(&mut self, ip: Ipv4Addr, now_ms: u32) -> Result<ArpResolve, NetError> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.ip == ip) {
            entry.last_used_ms = now_ms;
            return Ok(match entry.state {
                ArpState::Resolved { mac } => ArpResolve::Resolved(mac),
                ArpState::Pending { .. } => ArpResolve::Pending {
                    send_request: false,
                },
            });
        }

        if self.take_failure(ip) {
            return Err(NetError::Unreachable);
        }

        if self.entries.len() >= self.capacity && !self.evict_one() {
            klog_debug!("arp: table full of pending entries, cannot resolve {}", ip);
            return Err(NetError::ResourceExhausted);
        }

        self.entries.push(ArpEntry {
            ip,
            state: ArpState::Pending {
                requests: 1,
                last_request_ms: now_ms,
            },
            last_update_ms: now_ms,
            last_used_ms: now_ms,
        });
        klog_debug!("arp: new pending entry for {}", ip);
        Ok(ArpResolve::Pending { send_request: true })
    }

    /// Record `ip` → `mac` from an inbound ARP packet.
    ///
    /// Existing entries are always refreshed.  A new entry is created only
    /// when `create` is set (replies, gratuitous packets and requests aimed
    /// at us); a full table of Pending entries silently skips the insert.
    pub fn learn(&mut self, ip: Ipv4Addr, mac: MacAddr, now_ms: u32, create: bool) -> ArpLearn {
        let mut outcome = ArpLearn::default();

        if let Some(entry) = self.entries.iter_mut().find(|e| e.ip == ip) {
            match entry.state {
                ArpState::Pending { .. } => {
                    outcome.resolved_pending = true;
                    klog_debug!("arp: resolved {} -> {}", ip, mac);
                }
                ArpState::Resolved { mac: old } if old != mac => {
                    outcome.conflict = Some(old);
                    klog_warn!("arp: {} moved from {} to {}", ip, old, mac);
                }
                ArpState::Resolved { .. } => {}
            }
            entry.state = ArpState::Resolved { mac };
            entry.last_update_ms = now_ms;
            return outcome;
        }

        if !create {
            return outcome;
        }
        if self.entries.len() >= self.capacity && !self.evict_one() {
            return outcome;
        }
        self.entries.push(ArpEntry {
            ip,
            state: ArpState::Resolved { mac },
            last_update_ms: now_ms,
            last_used_ms: now_ms,
        });
        klog_debug!("arp: learned {} -> {}", ip, mac);
        outcome
    }

    /// Advance retry and expiry timers.
    pub fn tick(&mut self, now_ms: u32) -> ArpTick {
        let mut work = ArpTick::default();
        let interval = self.params.retry_interval_ms();
        let lifetime = self.params.entry_lifetime_ms;
        let max_requests = self.params.max_retries;

        self.entries.retain_mut(|entry| match &mut entry.state {
            ArpState::Pending {
                requests,
                last_request_ms,
            } => {
                if !has_elapsed(*last_request_ms, interval, now_ms) {
                    return true;
                }
                if *requests >= max_requests {
                    work.failed.push(entry.ip);
                    return false;
                }
                *requests += 1;
                *last_request_ms = now_ms;
                work.retransmit.push(entry.ip);
                true
            }
            ArpState::Resolved { .. } => !has_elapsed(entry.last_update_ms, lifetime, now_ms),
        });

        for &ip in &work.failed {
            klog_info!("arp: no reply from {}, giving up", ip);
            self.failed.push_overwrite(ip);
        }
        work
    }

    /// Forget everything (link down, address change).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.failed.reset();
    }

    fn take_failure(&mut self, ip: Ipv4Addr) -> bool {
        let mut found = false;
        for _ in 0..self.failed.len() {
            if let Some(failed_ip) = self.failed.try_pop() {
                if failed_ip == ip && !found {
                    found = true;
                } else {
                    self.failed.try_push(failed_ip);
                }
            }
        }
        found
    }

    /// Drop the least recently used Resolved entry.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e.state, ArpState::Resolved { .. }))
            .min_by_key(|(_, e)| e.last_used_ms)
            .map(|(i, _)| i);
        match victim {
            Some(i) => {
                let evicted = self.entries.swap_remove(i);
                klog_debug!("arp: evicted {}", evicted.ip);
                true
            }
            None => false,
        }
    }
}

/// MAC for destinations that never need a request: limited and subnet
/// broadcast map to the broadcast MAC, multicast to `01:00:5e`.
pub fn special_destination(dst: Ipv4Addr, our_ip: Ipv4Addr, mask: Ipv4Addr) -> Option<MacAddr> {
    if dst.is_broadcast() {
        return Some(MacAddr::BROADCAST);
    }
    if dst.is_multicast() {
        return Some(MacAddr::ipv4_multicast(dst));
    }
    if our_ip.is_valid() && mask.is_valid() && dst == our_ip.subnet_broadcast(mask) {
        return Some(MacAddr::BROADCAST);
    }
    None
}
