//! UDP: header codec and the port binding table.
//!
//! A port is bound in exactly one of two receive modes.  A
//! [`BindMode::SynchronousWait`] binding holds a one-datagram mailbox that a
//! blocked `udp_receive` drains; a [`BindMode::EventCallback`] binding
//! publishes each datagram on the event bus.  Binding an already bound port
//! fails with [`NetError::PortInUse`] regardless of mode.

extern crate alloc;

use alloc::vec::Vec;

use slopnet_lib::klog_debug;

use crate::checksum::transport_checksum;
use crate::types::{IpProtocol, Ipv4Addr, NetError, Port, SockAddr};

pub const UDP_HEADER_LEN: usize = 8;

// =============================================================================
// Header
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: Port,
    pub dst_port: Port,
    /// Header plus payload, in bytes.
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse the header and return it with the payload it covers.
    pub fn parse(data: &[u8]) -> Option<(Self, &[u8])> {
        if data.len() < UDP_HEADER_LEN {
            return None;
        }
        let length = u16::from_be_bytes([data[4], data[5]]);
        if (length as usize) < UDP_HEADER_LEN || length as usize > data.len() {
            return None;
        }
        let hdr = Self {
            src_port: Port::from_network_bytes([data[0], data[1]]),
            dst_port: Port::from_network_bytes([data[2], data[3]]),
            length,
            checksum: u16::from_be_bytes([data[6], data[7]]),
        };
        Some((hdr, &data[UDP_HEADER_LEN..length as usize]))
    }
}

/// Verify the checksum of a received datagram.  A zero checksum field means
/// the sender did not compute one.
pub fn verify_checksum(src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> bool {
    if datagram.len() < UDP_HEADER_LEN || datagram[6..8] == [0, 0] {
        return true;
    }
    transport_checksum(src, dst, IpProtocol::Udp, datagram) == 0
}

/// Write header and payload into `out` with a pseudo-header checksum.
pub fn write_datagram(
    src: SockAddr,
    dst: SockAddr,
    payload: &[u8],
    out: &mut [u8],
) -> Option<usize> {
    let len = UDP_HEADER_LEN + payload.len();
    if out.len() < len || len > u16::MAX as usize {
        return None;
    }
    out[0..2].copy_from_slice(&src.port.to_network_bytes());
    out[2..4].copy_from_slice(&dst.port.to_network_bytes());
    out[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    out[6..8].copy_from_slice(&[0, 0]);
    out[UDP_HEADER_LEN..len].copy_from_slice(payload);
    let mut sum = transport_checksum(src.ip, dst.ip, IpProtocol::Udp, &out[..len]);
    if sum == 0 {
        sum = 0xffff;
    }
    out[6..8].copy_from_slice(&sum.to_be_bytes());
    Some(len)
}

// =============================================================================
// Bindings
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindMode {
    /// A caller is blocked in `udp_receive` with a buffer of `capacity` bytes.
    SynchronousWait { capacity: usize },
    /// Datagrams are published as [`NetworkEvent::UdpDatagram`].
    ///
    /// [`NetworkEvent::UdpDatagram`]: crate::event::NetworkEvent::UdpDatagram
    EventCallback,
}

/// What a synchronous waiter finds in its mailbox.
#[derive(Debug, PartialEq, Eq)]
pub enum Mailbox {
    Datagram { src: SockAddr, data: Vec<u8> },
    /// A datagram arrived that did not fit the caller's buffer.  It was
    /// discarded.
    TooLarge,
}

/// Where an inbound datagram went.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UdpDelivery {
    /// Stored in a synchronous waiter's mailbox.
    Stored,
    /// The waiter's mailbox was already full; datagram dropped.
    Dropped,
    /// The port is in event mode; the caller publishes it.
    Event,
    /// Nobody is bound to the port.
    Unbound,
}

struct UdpBinding {
    port: Port,
    mode: BindMode,
    mailbox: Option<Mailbox>,
}

pub struct UdpBindings {
    bindings: Vec<UdpBinding>,
    capacity: usize,
}

impl UdpBindings {
    pub fn new(capacity: usize) -> Self {
        Self {
            bindings: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn mode(&self, port: Port) -> Option<BindMode> {
        self.find(port).map(|b| b.mode)
    }

    fn find(&self, port: Port) -> Option<&UdpBinding> {
        self.bindings.iter().find(|b| b.port == port)
    }

    pub fn bind(&mut self, port: Port, mode: BindMode) -> Result<(), NetError> {
        if port.as_u16() == 0 {
            return Err(NetError::InvalidArgument);
        }
        if self.find(port).is_some() {
            return Err(NetError::PortInUse);
        }
        if self.bindings.len() >= self.capacity {
            return Err(NetError::ResourceExhausted);
        }
        klog_debug!("udp: bind port {} {:?}", port, mode);
        self.bindings.push(UdpBinding {
            port,
            mode,
            mailbox: None,
        });
        Ok(())
    }

    /// Release `port`.  Returns `false` if it was not bound.
    pub fn unbind(&mut self, port: Port) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|b| b.port != port);
        before != self.bindings.len()
    }

    /// Route an inbound datagram addressed to `dst_port`.
    pub fn deliver(&mut self, src: SockAddr, dst_port: Port, payload: &[u8]) -> UdpDelivery {
        let Some(binding) = self.bindings.iter_mut().find(|b| b.port == dst_port) else {
            return UdpDelivery::Unbound;
        };
        match binding.mode {
            BindMode::EventCallback => UdpDelivery::Event,
            BindMode::SynchronousWait { .. } if binding.mailbox.is_some() => {
                klog_debug!("udp: port {} mailbox full, drop", dst_port);
                UdpDelivery::Dropped
            }
            BindMode::SynchronousWait { capacity } => {
                binding.mailbox = Some(if payload.len() > capacity {
                    Mailbox::TooLarge
                } else {
                    Mailbox::Datagram {
                        src,
                        data: payload.to_vec(),
                    }
                });
                UdpDelivery::Stored
            }
        }
    }

    /// Take whatever arrived for a synchronous waiter on `port`.
    pub fn take(&mut self, port: Port) -> Option<Mailbox> {
        self.bindings
            .iter_mut()
            .find(|b| b.port == port)
            .and_then(|b| b.mailbox.take())
    }
}
