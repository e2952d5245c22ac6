//! IPv4 link-local address configuration (RFC 3927).
//!
//! [`LinkLocalClient`] claims an address in 169.254.1.0 - 169.254.254.255
//! when no DHCP server answers.  Like the DHCP client it never touches the
//! wire: the stack calls [`LinkLocalClient::poll`] from its tick path and
//! [`LinkLocalClient::on_arp`] for every ARP packet, then sends the probes
//! and announcements the returned [`LinkLocalStep`] asks for.
//!
//! ```text
//! Idle -> Probing -(3 probes, no conflict)-> Announcing -(2nd)-> Defending
//! Probing -(conflict)-> Probing (new address)
//! Defending -(second conflict within 10 s)-> Probing (new address)
//! Probing -(tries spent)-> Failed
//! ```

use core::fmt;

use slopnet_lib::{klog_debug, klog_info, klog_warn};

use crate::arp::ArpPacket;
use crate::config::LinkLocalParams;
use crate::device::{RandomSource, deadline_reached, has_elapsed};
use crate::types::{Ipv4Addr, MacAddr};

// RFC 3927 §9 timing.
pub const PROBE_WAIT_MS: u32 = 1000;
pub const PROBE_NUM: u8 = 3;
pub const PROBE_MIN_MS: u32 = 1000;
pub const PROBE_MAX_MS: u32 = 2000;
pub const ANNOUNCE_WAIT_MS: u32 = 2000;
pub const ANNOUNCE_NUM: u8 = 2;
pub const ANNOUNCE_INTERVAL_MS: u32 = 2000;
pub const MAX_CONFLICTS: u16 = 10;
pub const RATE_LIMIT_INTERVAL_MS: u32 = 60_000;
pub const DEFEND_INTERVAL_MS: u32 = 10_000;

/// Mask of the 169.254/16 link-local network.
pub const LINK_LOCAL_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 0, 0);

/// `true` for the addresses a host may claim: 169.254/16 less the first and
/// last 256, which are reserved.
pub const fn is_claimable(ip: Ipv4Addr) -> bool {
    ip.is_link_local() && ip.0[2] != 0 && ip.0[2] != 255
}

/// Pick a claimable address from a random value.
pub fn address_from(random: u32) -> Ipv4Addr {
    let host = 256 + random % (65536 - 512);
    Ipv4Addr::new(169, 254, (host >> 8) as u8, host as u8)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkLocalState {
    Idle,
    Probing,
    Announcing,
    Defending,
    /// Every try ran into a conflict.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkLocalError {
    /// No free address found within the configured tries.
    NoAddress = 1,
    /// Another host took our claimed address.
    AddressClash = 2,
}

impl fmt::Display for LinkLocalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAddress => write!(f, "no free link-local address"),
            Self::AddressClash => write!(f, "link-local address taken by another host"),
        }
    }
}

/// Everything one call into the client asks of the stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkLocalStep {
    /// Broadcast an ARP probe (sender IP 0.0.0.0) for this address.
    pub probe: Option<Ipv4Addr>,
    /// Broadcast an ARP announcement of this address.
    pub announce: Option<Ipv4Addr>,
    /// Configure the interface with this address and the /16 mask.
    pub claimed: Option<Ipv4Addr>,
    /// The claimed address was given up; unconfigure the interface.
    pub lost: bool,
    pub failed: Option<LinkLocalError>,
}

pub struct LinkLocalClient {
    params: LinkLocalParams,
    state: LinkLocalState,
    mac: MacAddr,
    candidate: Ipv4Addr,
    probes_sent: u8,
    announcements: u8,
    conflict: bool,
    tries: u16,
    conflicts: u16,
    next_ms: u32,
    last_defence_ms: Option<u32>,
}

impl LinkLocalClient {
    pub fn new(params: LinkLocalParams) -> Self {
        Self {
            params,
            state: LinkLocalState::Idle,
            mac: MacAddr::ZERO,
            candidate: Ipv4Addr::UNSPECIFIED,
            probes_sent: 0,
            announcements: 0,
            conflict: false,
            tries: 0,
            conflicts: 0,
            next_ms: 0,
            last_defence_ms: None,
        }
    }

    pub fn state(&self) -> LinkLocalState {
        self.state
    }

    /// Address being probed or held.
    pub fn candidate(&self) -> Ipv4Addr {
        self.candidate
    }

    /// The claimed address, once probing succeeded.
    pub fn address(&self) -> Option<Ipv4Addr> {
        matches!(
            self.state,
            LinkLocalState::Announcing | LinkLocalState::Defending
        )
        .then_some(self.candidate)
    }

    /// Probing, announcing or defending.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            LinkLocalState::Probing | LinkLocalState::Announcing | LinkLocalState::Defending
        )
    }

    /// Conflicts seen since `start`.
    pub fn conflicts(&self) -> u16 {
        self.conflicts
    }

    /// Begin probing.  The first probe goes out after a random wait of up
    /// to one second.
    pub fn start<R: RandomSource + ?Sized>(&mut self, mac: MacAddr, rng: &R, now_ms: u32) {
        self.mac = mac;
        self.tries = 0;
        self.conflicts = 0;
        self.last_defence_ms = None;
        self.candidate = if self.params.random_start || !is_claimable(self.params.fixed_start) {
            address_from(rng.next_u32())
        } else {
            self.params.fixed_start
        };
        klog_info!("llip: starting with {}", self.candidate);
        self.begin_probing(now_ms.wrapping_add(rng.next_u32() % PROBE_WAIT_MS));
    }

    pub fn stop(&mut self) {
        self.state = LinkLocalState::Idle;
        self.conflict = false;
    }

    fn set_state(&mut self, new: LinkLocalState) {
        klog_debug!("llip: {:?} -> {:?}", self.state, new);
        self.state = new;
    }

    fn begin_probing(&mut self, first_probe_ms: u32) {
        self.set_state(LinkLocalState::Probing);
        self.probes_sent = 0;
        self.announcements = 0;
        self.conflict = false;
        self.next_ms = first_probe_ms;
    }

    /// Run the probe and announce timers.
    pub fn poll<R: RandomSource + ?Sized>(&mut self, rng: &R, now_ms: u32) -> LinkLocalStep {
        let mut step = LinkLocalStep::default();
        if !deadline_reached(self.next_ms, now_ms) {
            return step;
        }
        match self.state {
            LinkLocalState::Idle | LinkLocalState::Defending | LinkLocalState::Failed => {}
            LinkLocalState::Probing if self.conflict => {
                self.tries += 1;
                if self.tries >= self.params.max_tries {
                    klog_warn!("llip: no free address after {} tries", self.tries);
                    self.set_state(LinkLocalState::Failed);
                    step.failed = Some(LinkLocalError::NoAddress);
                    return step;
                }
                self.candidate = address_from(rng.next_u32());
                let wait = if self.conflicts >= MAX_CONFLICTS {
                    RATE_LIMIT_INTERVAL_MS
                } else {
                    rng.next_u32() % PROBE_WAIT_MS
                };
                klog_debug!("llip: trying {} in {} ms", self.candidate, wait);
                self.begin_probing(now_ms.wrapping_add(wait));
            }
            LinkLocalState::Probing if self.probes_sent < PROBE_NUM => {
                step.probe = Some(self.candidate);
                self.probes_sent += 1;
                self.next_ms = now_ms.wrapping_add(if self.probes_sent < PROBE_NUM {
                    PROBE_MIN_MS + rng.next_u32() % (PROBE_MAX_MS - PROBE_MIN_MS + 1)
                } else {
                    ANNOUNCE_WAIT_MS
                });
            }
            LinkLocalState::Probing => {
                klog_info!("llip: claimed {}", self.candidate);
                self.set_state(LinkLocalState::Announcing);
                step.claimed = Some(self.candidate);
                step.announce = Some(self.candidate);
                self.announcements = 1;
                self.next_ms = now_ms.wrapping_add(ANNOUNCE_INTERVAL_MS);
            }
            LinkLocalState::Announcing => {
                step.announce = Some(self.candidate);
                self.announcements += 1;
                self.next_ms = now_ms.wrapping_add(ANNOUNCE_INTERVAL_MS);
                if self.announcements >= ANNOUNCE_NUM {
                    self.set_state(LinkLocalState::Defending);
                }
            }
        }
        step
    }

    /// Check an inbound ARP packet for conflicts with our address.
    pub fn on_arp(&mut self, pkt: &ArpPacket, now_ms: u32) -> LinkLocalStep {
        let mut step = LinkLocalStep::default();
        if pkt.sender_mac == self.mac {
            return step;
        }
        match self.state {
            LinkLocalState::Probing => {
                let in_use = pkt.sender_ip == self.candidate;
                let probed_by_other = pkt.is_probe() && pkt.target_ip == self.candidate;
                if (in_use || probed_by_other) && !self.conflict {
                    klog_debug!("llip: {} wanted by {}", self.candidate, pkt.sender_mac);
                    self.conflict = true;
                    self.conflicts = self.conflicts.saturating_add(1);
                    self.next_ms = now_ms;
                }
            }
            LinkLocalState::Announcing | LinkLocalState::Defending
                if pkt.sender_ip == self.candidate =>
            {
                let recently = self
                    .last_defence_ms
                    .is_some_and(|t| !has_elapsed(t, DEFEND_INTERVAL_MS, now_ms));
                if recently {
                    klog_warn!(
                        "llip: {} taken by {}, choosing another",
                        self.candidate,
                        pkt.sender_mac
                    );
                    step.lost = true;
                    step.failed = Some(LinkLocalError::AddressClash);
                    self.tries = 0;
                    self.last_defence_ms = None;
                    self.begin_probing(now_ms);
                    self.conflict = true;
                    self.conflicts = self.conflicts.saturating_add(1);
                } else {
                    klog_info!("llip: defending {} against {}", self.candidate, pkt.sender_mac);
                    self.last_defence_ms = Some(now_ms);
                    step.announce = Some(self.candidate);
                }
            }
            _ => {}
        }
        step
    }
}
