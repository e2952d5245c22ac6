//! Boundary traits for the collaborators the stack consumes: the Ethernet
//! driver, the millisecond tick and the random number source.
//!
//! The driver pushes inbound frames with
//! [`NetStack::on_frame_received`](crate::stack::NetStack::on_frame_received)
//! and link transitions with
//! [`NetStack::on_link_change`](crate::stack::NetStack::on_link_change);
//! both may be called from interrupt context.

use core::fmt;

use crate::types::{MacAddr, NetError};

/// Negotiated link speed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkSpeed {
    Mbps10,
    Mbps100,
    Mbps1000,
}

/// Negotiated duplex mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Duplex {
    Half,
    Full,
}

/// Snapshot of the PHY link state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkStatus {
    pub up: bool,
    pub speed: LinkSpeed,
    pub duplex: Duplex,
}

impl LinkStatus {
    pub const DOWN: Self = Self {
        up: false,
        speed: LinkSpeed::Mbps10,
        duplex: Duplex::Half,
    };
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.up {
            return write!(f, "down");
        }
        let speed = match self.speed {
            LinkSpeed::Mbps10 => 10,
            LinkSpeed::Mbps100 => 100,
            LinkSpeed::Mbps1000 => 1000,
        };
        let duplex = match self.duplex {
            Duplex::Half => "half",
            Duplex::Full => "full",
        };
        write!(f, "up {}Mb/s {}-duplex", speed, duplex)
    }
}

/// Ethernet MAC + PHY driver.
pub trait NetDevice: Send + Sync {
    /// Queue one complete Ethernet II frame (no FCS) for transmission.
    fn send_frame(&self, frame: &[u8]) -> Result<(), NetError>;

    fn link_status(&self) -> LinkStatus;

    /// The station address programmed into the MAC.
    fn mac_addr(&self) -> MacAddr;

    /// Pull one received frame, for drivers without a receive interrupt.
    /// [`NetStack::poll`](crate::stack::NetStack::poll) drains this before
    /// running timers.
    fn receive_frame(&self, _buf: &mut [u8]) -> Option<usize> {
        None
    }
}

/// Monotonic millisecond tick.  Wraps at `u32::MAX`.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u32;

    /// Called on every iteration of a blocking poll loop.  Targets can
    /// `wfi` here; the default just hints a spin.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

pub trait RandomSource: Send + Sync {
    fn next_u32(&self) -> u32;
}

/// `true` once `duration_ms` has passed since `since_ms`, tolerant of tick
/// counter wrap.
#[inline]
pub const fn has_elapsed(since_ms: u32, duration_ms: u32, now_ms: u32) -> bool {
    now_ms.wrapping_sub(since_ms) >= duration_ms
}

/// `true` once `now_ms` has reached `deadline_ms`, tolerant of wrap as long
/// as the two are less than 2^31 ms apart.
#[inline]
pub const fn deadline_reached(deadline_ms: u32, now_ms: u32) -> bool {
    (now_ms.wrapping_sub(deadline_ms) as i32) >= 0
}
