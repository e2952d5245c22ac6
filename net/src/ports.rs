//! Local port bookkeeping for one transport protocol; the stack keeps one
//! allocator for TCP and one for UDP.
//!
//! Ephemeral ports come from the IANA dynamic range and are handed out
//! round-robin from a random starting point so a rebooted board does not
//! reuse the ports of its previous life.

extern crate alloc;

use alloc::vec::Vec;

use crate::types::{NetError, Port};

pub const EPHEMERAL_FIRST: u16 = 49152;
pub const EPHEMERAL_LAST: u16 = 65535;
const EPHEMERAL_COUNT: u32 = (EPHEMERAL_LAST - EPHEMERAL_FIRST) as u32 + 1;

pub const DNS_PORT: Port = Port(53);
pub const DHCP_SERVER_PORT: Port = Port(67);
pub const DHCP_CLIENT_PORT: Port = Port(68);

pub struct PortAllocator {
    next: u16,
    in_use: Vec<Port>,
}

impl PortAllocator {
    /// `seed` picks the first ephemeral port tried.
    pub fn new(seed: u32) -> Self {
        Self {
            next: EPHEMERAL_FIRST + (seed % EPHEMERAL_COUNT) as u16,
            in_use: Vec::new(),
        }
    }

    pub fn is_in_use(&self, port: Port) -> bool {
        self.in_use.contains(&port)
    }

    /// Take the next free ephemeral port.
    pub fn acquire_ephemeral(&mut self) -> Result<Port, NetError> {
        for _ in 0..EPHEMERAL_COUNT {
            let candidate = Port(self.next);
            self.next = if self.next == EPHEMERAL_LAST {
                EPHEMERAL_FIRST
            } else {
                self.next + 1
            };
            if !self.is_in_use(candidate) {
                self.in_use.push(candidate);
                return Ok(candidate);
            }
        }
        Err(NetError::ResourceExhausted)
    }

    /// Claim a specific port.
    pub fn claim(&mut self, port: Port) -> Result<(), NetError> {
        if port.0 == 0 {
            return Err(NetError::InvalidArgument);
        }
        if self.is_in_use(port) {
            return Err(NetError::PortInUse);
        }
        self.in_use.push(port);
        Ok(())
    }

    pub fn release(&mut self, port: Port) {
        self.in_use.retain(|p| *p != port);
    }
}
