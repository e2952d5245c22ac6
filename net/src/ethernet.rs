//! Ethernet II framing.

use crate::types::{EtherType, MacAddr};

pub const ETH_HEADER_LEN: usize = 14;
/// Largest payload of an untagged Ethernet II frame.
pub const ETH_MAX_PAYLOAD: usize = 1500;
pub const ETH_MAX_FRAME: usize = ETH_HEADER_LEN + ETH_MAX_PAYLOAD;

/// Parsed Ethernet II header.  `ethertype` is kept raw so unknown types can
/// be counted before they are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn parse(frame: &[u8]) -> Option<(Self, &[u8])> {
        if frame.len() < ETH_HEADER_LEN {
            return None;
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        let hdr = Self {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
        };
        Some((hdr, &frame[ETH_HEADER_LEN..]))
    }

    pub fn ether_type(&self) -> Option<EtherType> {
        EtherType::from_u16(self.ethertype)
    }

    /// Write the 14-byte header into `out`.  Returns `None` if `out` is short.
    pub fn write(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < ETH_HEADER_LEN {
            return None;
        }
        out[0..6].copy_from_slice(&self.dst.0);
        out[6..12].copy_from_slice(&self.src.0);
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        Some(ETH_HEADER_LEN)
    }
}

/// `true` if a frame addressed to `dst` is for a station with address `ours`.
#[inline]
pub fn accepts(dst: MacAddr, ours: MacAddr) -> bool {
    dst == ours || dst.is_broadcast() || dst.is_multicast()
}
