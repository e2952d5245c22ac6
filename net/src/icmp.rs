//! ICMPv4: echo request/reply, destination unreachable, and the single
//! outstanding `ping` tracker.

use slopnet_lib::klog_debug;

use crate::checksum::internet_checksum;
use crate::device::has_elapsed;
use crate::types::Ipv4Addr;

pub const ICMP_HEADER_LEN: usize = 8;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

/// Identifier carried by every echo request we originate.
pub const PING_IDENTIFIER: u16 = 0x55;
/// Echo request payload.
pub const PING_DATA: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
pub const PING_DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Original datagram bytes quoted past its IP header in error messages.
const QUOTED_PAYLOAD_LEN: usize = 8;

// =============================================================================
// Codec
// =============================================================================

/// Inbound ICMP message, borrowed from the packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcmpMessage<'a> {
    EchoRequest { ident: u16, seq: u16, data: &'a [u8] },
    EchoReply { ident: u16, seq: u16, data: &'a [u8] },
    DestUnreachable { code: u8, quoted: &'a [u8] },
    Other { icmp_type: u8, code: u8 },
}

impl<'a> IcmpMessage<'a> {
    /// Parse and checksum-verify an ICMP message.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < ICMP_HEADER_LEN || internet_checksum(data) != 0 {
            return None;
        }
        let ident = u16::from_be_bytes([data[4], data[5]]);
        let seq = u16::from_be_bytes([data[6], data[7]]);
        let body = &data[ICMP_HEADER_LEN..];
        Some(match data[0] {
            ICMP_ECHO_REQUEST => Self::EchoRequest {
                ident,
                seq,
                data: body,
            },
            ICMP_ECHO_REPLY => Self::EchoReply {
                ident,
                seq,
                data: body,
            },
            ICMP_DEST_UNREACHABLE => Self::DestUnreachable {
                code: data[1],
                quoted: body,
            },
            icmp_type => Self::Other {
                icmp_type,
                code: data[1],
            },
        })
    }
}

fn write_echo(icmp_type: u8, ident: u16, seq: u16, data: &[u8], out: &mut [u8]) -> Option<usize> {
    let len = ICMP_HEADER_LEN + data.len();
    if out.len() < len {
        return None;
    }
    out[0] = icmp_type;
    out[1] = 0;
    out[2..4].copy_from_slice(&[0, 0]);
    out[4..6].copy_from_slice(&ident.to_be_bytes());
    out[6..8].copy_from_slice(&seq.to_be_bytes());
    out[ICMP_HEADER_LEN..len].copy_from_slice(data);
    let sum = internet_checksum(&out[..len]);
    out[2..4].copy_from_slice(&sum.to_be_bytes());
    Some(len)
}

pub fn write_echo_request(ident: u16, seq: u16, data: &[u8], out: &mut [u8]) -> Option<usize> {
    write_echo(ICMP_ECHO_REQUEST, ident, seq, data, out)
}

/// Echo reply mirroring a request's identifier, sequence and data.
pub fn write_echo_reply(ident: u16, seq: u16, data: &[u8], out: &mut [u8]) -> Option<usize> {
    write_echo(ICMP_ECHO_REPLY, ident, seq, data, out)
}

/// Destination unreachable quoting the offending datagram's IP header and
/// the first 8 bytes of its payload.
pub fn write_dest_unreachable(
    code: u8,
    original: &[u8],
    ip_header_len: usize,
    out: &mut [u8],
) -> Option<usize> {
    let quoted = original.len().min(ip_header_len + QUOTED_PAYLOAD_LEN);
    let len = ICMP_HEADER_LEN + quoted;
    if out.len() < len {
        return None;
    }
    out[0] = ICMP_DEST_UNREACHABLE;
    out[1] = code;
    out[2..ICMP_HEADER_LEN].fill(0);
    out[ICMP_HEADER_LEN..len].copy_from_slice(&original[..quoted]);
    let sum = internet_checksum(&out[..len]);
    out[2..4].copy_from_slice(&sum.to_be_bytes());
    Some(len)
}

// =============================================================================
// Ping tracker
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OutstandingPing {
    dst: Ipv4Addr,
    seq: u16,
    sent_ms: u32,
}

/// Outcome of polling the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingStatus {
    Idle,
    Waiting,
    /// Reply received; round trip in milliseconds.
    Replied(u32),
    TimedOut,
}

/// Tracks the one echo request `ping` may have in flight.
pub struct PingTracker {
    next_seq: u16,
    outstanding: Option<OutstandingPing>,
    rtt_ms: Option<u32>,
}

impl PingTracker {
    pub const fn new() -> Self {
        Self {
            next_seq: 1,
            outstanding: None,
            rtt_ms: None,
        }
    }

    /// Start tracking a request to `dst`.  Returns the sequence number to put
    /// in it.  A previous request still in flight is forgotten.
    pub fn begin(&mut self, dst: Ipv4Addr, now_ms: u32) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.outstanding = Some(OutstandingPing {
            dst,
            seq,
            sent_ms: now_ms,
        });
        self.rtt_ms = None;
        seq
    }

    /// Record an echo reply.  Returns `true` if it answered the outstanding
    /// request.
    pub fn on_echo_reply(&mut self, src: Ipv4Addr, ident: u16, seq: u16, now_ms: u32) -> bool {
        let Some(ping) = self.outstanding else {
            return false;
        };
        if ident != PING_IDENTIFIER || seq != ping.seq || src != ping.dst {
            klog_debug!("icmp: unmatched echo reply from {} seq={}", src, seq);
            return false;
        }
        self.rtt_ms = Some(now_ms.wrapping_sub(ping.sent_ms));
        self.outstanding = None;
        true
    }

    pub fn status(&mut self, timeout_ms: u32, now_ms: u32) -> PingStatus {
        if let Some(rtt) = self.rtt_ms.take() {
            return PingStatus::Replied(rtt);
        }
        match self.outstanding {
            None => PingStatus::Idle,
            Some(ping) if has_elapsed(ping.sent_ms, timeout_ms, now_ms) => {
                self.outstanding = None;
                PingStatus::TimedOut
            }
            Some(_) => PingStatus::Waiting,
        }
    }

    pub fn cancel(&mut self) {
        self.outstanding = None;
        self.rtt_ms = None;
    }
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}
