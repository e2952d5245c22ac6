//! TCP (RFC 793): header codec, sequence arithmetic and the per-connection
//! state machine.
//!
//! A [`TcpConnection`] never touches the wire.  Inbound segments are fed to
//! [`TcpConnection::on_segment`]; outbound segments are pulled with
//! [`TcpConnection::next_segment`], handed to the IP layer, and confirmed with
//! [`TcpConnection::commit`].  A segment that could not be transmitted (next
//! hop not resolved yet) is simply not committed and comes out again on the
//! next pull, so there is no outbound queue.
//!
//! Congestion control is a fixed window: we never have more than the peer's
//! advertised window in flight, and retransmission resends one segment from
//! `snd_una` with exponential backoff.

use core::fmt;

use bitflags::bitflags;
use slopnet_lib::{RingBuffer, klog_debug, klog_info};

use crate::checksum::transport_checksum;
use crate::config::TcpParams;
use crate::device::{deadline_reached, has_elapsed};
use crate::types::{IpProtocol, Ipv4Addr, Port};

// =============================================================================
// Constants
// =============================================================================

/// Minimum TCP header length (no options).
pub const TCP_HEADER_LEN: usize = 20;

/// Maximum TCP header length (with 40 bytes of options).
pub const TCP_HEADER_MAX_LEN: usize = 60;

/// Size of each connection's send and receive ring.
pub const TCP_BUFFER_SIZE: usize = 2048;

/// MSS assumed when the peer's SYN carries no MSS option (RFC 1122).
pub const DEFAULT_REMOTE_MSS: u16 = 536;

/// Initial sequence numbers are drawn from the low 31 bits.
pub const ISN_MASK: u32 = 0x7fff_ffff;

/// Transitions a connection remembers between drains.  One inbound segment
/// causes at most two.
pub const TRANSITION_LOG_LEN: usize = 4;

pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_MSS_LEN: u8 = 4;

bitflags! {
    /// Control bits in byte 13 of the header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

// =============================================================================
// TCP Header
// =============================================================================

/// Parsed TCP header.  Multi-byte fields are in host order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Data offset in 32-bit words (5-15).
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    #[inline]
    pub const fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    #[inline]
    pub const fn options_len(&self) -> usize {
        self.header_len().saturating_sub(TCP_HEADER_LEN)
    }

    #[inline]
    pub const fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    #[inline]
    pub const fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    #[inline]
    pub const fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    #[inline]
    pub const fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }
}

/// Parse a TCP header from the start of `data`.
///
/// Returns `None` if the slice is too short or the data offset is invalid.
pub fn parse_header(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }

    let data_offset = (data[12] >> 4) & 0x0f;
    if !(5..=15).contains(&data_offset) || data.len() < (data_offset as usize) * 4 {
        return None;
    }

    Some(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: TcpFlags::from_bits_truncate(data[13]),
        window_size: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

/// Parse the MSS option from the options region.
pub fn parse_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            TCP_OPT_END => break,
            TCP_OPT_NOP => i += 1,
            TCP_OPT_MSS => {
                if i + 3 < options.len() && options[i + 1] == TCP_OPT_MSS_LEN {
                    return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
                }
                break;
            }
            _ => {
                if i + 1 >= options.len() {
                    break;
                }
                let opt_len = options[i + 1] as usize;
                if opt_len < 2 || i + opt_len > options.len() {
                    break;
                }
                i += opt_len;
            }
        }
    }
    None
}

/// Write a TCP header into `out[..hdr.header_len()]` with a zero checksum.
pub fn write_header(hdr: &TcpHeader, out: &mut [u8]) -> Option<usize> {
    let header_len = hdr.header_len();
    if out.len() < header_len || header_len < TCP_HEADER_LEN {
        return None;
    }

    out[0..2].copy_from_slice(&hdr.src_port.to_be_bytes());
    out[2..4].copy_from_slice(&hdr.dst_port.to_be_bytes());
    out[4..8].copy_from_slice(&hdr.seq_num.to_be_bytes());
    out[8..12].copy_from_slice(&hdr.ack_num.to_be_bytes());
    out[12] = (hdr.data_offset << 4) & 0xf0;
    out[13] = hdr.flags.bits();
    out[14..16].copy_from_slice(&hdr.window_size.to_be_bytes());
    out[16..18].copy_from_slice(&[0, 0]);
    out[18..20].copy_from_slice(&hdr.urgent_ptr.to_be_bytes());
    out[TCP_HEADER_LEN..header_len].fill(0);

    Some(header_len)
}

pub fn write_mss_option(mss: u16, out: &mut [u8]) -> Option<usize> {
    if out.len() < 4 {
        return None;
    }
    out[0] = TCP_OPT_MSS;
    out[1] = TCP_OPT_MSS_LEN;
    out[2..4].copy_from_slice(&mss.to_be_bytes());
    Some(4)
}

/// A received segment borrowed from the packet.
#[derive(Clone, Copy, Debug)]
pub struct TcpSegment<'a> {
    pub header: TcpHeader,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let header = parse_header(data)?;
        let header_len = header.header_len();
        Some(Self {
            header,
            options: &data[TCP_HEADER_LEN..header_len],
            payload: &data[header_len..],
        })
    }

    /// Sequence space the segment occupies: payload plus SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.header.is_syn() {
            len += 1;
        }
        if self.header.is_fin() {
            len += 1;
        }
        len
    }
}

/// `true` if the segment's checksum over the IPv4 pseudo-header is valid.
pub fn verify_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    transport_checksum(src, dst, IpProtocol::Tcp, segment) == 0
}

// =============================================================================
// Sequence number arithmetic (RFC 793 §3.3)
// =============================================================================

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

// =============================================================================
// States and errors
// =============================================================================

/// TCP connection state per RFC 793 §3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }

    /// Capable of data transfer in at least one direction.
    pub const fn is_open(self) -> bool {
        matches!(
            self,
            Self::Established | Self::FinWait1 | Self::FinWait2 | Self::CloseWait
        )
    }

    pub const fn is_closing(self) -> bool {
        matches!(
            self,
            Self::FinWait1
                | Self::FinWait2
                | Self::CloseWait
                | Self::Closing
                | Self::LastAck
                | Self::TimeWait
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a connection failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TcpError {
    /// RST in answer to our SYN.
    Refused = 1,
    /// RST on an established connection.
    Reset = 2,
    /// SYN retries, data retransmissions or the idle timer ran out.
    Timeout = 3,
    /// The operation is not valid in the connection's state.
    InvalidState = 4,
    /// The connection is closed.
    Closed = 5,
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused => write!(f, "connection refused"),
            Self::Reset => write!(f, "connection reset by peer"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::InvalidState => write!(f, "invalid state for operation"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

// =============================================================================
// Outbound segments
// =============================================================================

/// Four-tuple identifying a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpTuple {
    pub local_ip: Ipv4Addr,
    pub local_port: Port,
    pub remote_ip: Ipv4Addr,
    pub remote_port: Port,
}

impl fmt::Display for TcpTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

/// What an outbound segment is for; drives [`TcpConnection::commit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Syn,
    SynAck,
    /// New data from the send ring.
    Data,
    /// Oldest unacknowledged data, or our FIN, sent again.
    Retransmit,
    /// One byte past a zero window (RFC 1122 §4.2.2.17).
    WindowProbe,
    Fin,
    Ack,
    Rst,
}

/// Outgoing segment produced by the state machine.
///
/// Payload bytes are not copied here: they live in the connection's send
/// ring at `payload_offset` past `snd_una` and are fetched with
/// [`TcpConnection::copy_payload`] when the frame is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpOutSegment {
    pub tuple: TcpTuple,
    pub seq_num: u32,
    pub ack_num: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    /// MSS option to include (0 = none).
    pub mss: u16,
    pub payload_offset: usize,
    pub payload_len: usize,
    pub kind: SegmentKind,
}

impl TcpOutSegment {
    pub const fn header_len(&self) -> usize {
        if self.mss != 0 {
            TCP_HEADER_LEN + TCP_OPT_MSS_LEN as usize
        } else {
            TCP_HEADER_LEN
        }
    }

    /// Header and payload length on the wire.
    pub const fn wire_len(&self) -> usize {
        self.header_len() + self.payload_len
    }

    /// Write the header and options in front of a payload the caller has
    /// already placed at `out[self.header_len()..]`, then fill in the
    /// checksum.  Returns the segment length.
    pub fn finish(&self, out: &mut [u8]) -> Option<usize> {
        let header_len = self.header_len();
        let total = header_len + self.payload_len;
        if out.len() < total {
            return None;
        }
        let hdr = TcpHeader {
            src_port: self.tuple.local_port.as_u16(),
            dst_port: self.tuple.remote_port.as_u16(),
            seq_num: self.seq_num,
            ack_num: self.ack_num,
            data_offset: (header_len / 4) as u8,
            flags: self.flags,
            window_size: self.window_size,
            checksum: 0,
            urgent_ptr: 0,
        };
        write_header(&hdr, out)?;
        if self.mss != 0 {
            write_mss_option(self.mss, &mut out[TCP_HEADER_LEN..header_len])?;
        }
        let sum = transport_checksum(
            self.tuple.local_ip,
            self.tuple.remote_ip,
            IpProtocol::Tcp,
            &out[..total],
        );
        out[16..18].copy_from_slice(&sum.to_be_bytes());
        Some(total)
    }

    /// Copy `payload` behind the header and finish the segment.
    pub fn write(&self, payload: &[u8], out: &mut [u8]) -> Option<usize> {
        let header_len = self.header_len();
        if payload.len() != self.payload_len || out.len() < header_len + payload.len() {
            return None;
        }
        out[header_len..header_len + payload.len()].copy_from_slice(payload);
        self.finish(out)
    }
}

/// RST answering a segment that matches no connection.
pub fn build_rst_for(
    seg: &TcpSegment<'_>,
    local_ip: Ipv4Addr,
    remote_ip: Ipv4Addr,
) -> TcpOutSegment {
    let hdr = &seg.header;
    let (seq_num, ack_num, flags) = if hdr.is_ack() {
        (hdr.ack_num, 0, TcpFlags::RST)
    } else {
        (
            0,
            hdr.seq_num.wrapping_add(seg.seq_len()),
            TcpFlags::RST | TcpFlags::ACK,
        )
    };
    TcpOutSegment {
        tuple: TcpTuple {
            local_ip,
            local_port: Port(hdr.dst_port),
            remote_ip,
            remote_port: Port(hdr.src_port),
        },
        seq_num,
        ack_num,
        flags,
        window_size: 0,
        mss: 0,
        payload_offset: 0,
        payload_len: 0,
        kind: SegmentKind::Rst,
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Iterator returned by [`TcpConnection::take_transitions`].
pub type Transitions =
    core::iter::Take<core::array::IntoIter<(TcpState, TcpState), TRANSITION_LOG_LEN>>;

/// State transitions not yet collected by the owner, oldest first.
#[derive(Clone, Copy, Debug)]
struct TransitionLog {
    entries: [(TcpState, TcpState); TRANSITION_LOG_LEN],
    len: usize,
}

impl TransitionLog {
    const fn new() -> Self {
        Self {
            entries: [(TcpState::Closed, TcpState::Closed); TRANSITION_LOG_LEN],
            len: 0,
        }
    }

    fn push(&mut self, old: TcpState, new: TcpState) {
        if self.len == TRANSITION_LOG_LEN {
            // Nobody is draining; keep the most recent history.
            self.entries.copy_within(1.., 0);
            self.len -= 1;
        }
        self.entries[self.len] = (old, new);
        self.len += 1;
    }

    fn take(&mut self) -> ([(TcpState, TcpState); TRANSITION_LOG_LEN], usize) {
        let taken = (self.entries, self.len);
        self.len = 0;
        taken
    }
}

/// Per-connection state: sequence variables, rings and timers.
pub struct TcpConnection {
    tuple: TcpTuple,
    state: TcpState,
    params: TcpParams,
    passive: bool,

    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    irs: u32,
    rcv_nxt: u32,
    peer_mss: u16,

    /// Bytes from `snd_una` onward: in flight first, then not yet sent.
    send_buf: RingBuffer<u8, TCP_BUFFER_SIZE>,
    recv_buf: RingBuffer<u8, TCP_BUFFER_SIZE>,
    in_flight: usize,

    syn_pending: bool,
    ack_pending: bool,
    retransmit_pending: bool,
    probe_pending: bool,
    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,
    remote_closed: bool,

    rto_ms: u32,
    retransmits: u8,
    syn_retries: u8,
    retransmit_deadline: Option<u32>,
    last_activity_ms: u32,
    time_wait_start_ms: u32,

    error: Option<TcpError>,
    transitions: TransitionLog,
}

impl TcpConnection {
    fn blank(tuple: TcpTuple, state: TcpState, iss: u32, now_ms: u32, params: TcpParams) -> Self {
        let iss = iss & ISN_MASK;
        Self {
            tuple,
            state,
            params,
            passive: false,
            iss,
            snd_una: iss,
            snd_nxt: iss.wrapping_add(1),
            snd_wnd: 0,
            irs: 0,
            rcv_nxt: 0,
            peer_mss: DEFAULT_REMOTE_MSS,
            send_buf: RingBuffer::new(),
            recv_buf: RingBuffer::new(),
            in_flight: 0,
            syn_pending: true,
            ack_pending: false,
            retransmit_pending: false,
            probe_pending: false,
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            remote_closed: false,
            rto_ms: params.initial_resend_delay_ms,
            retransmits: 0,
            syn_retries: 0,
            retransmit_deadline: None,
            last_activity_ms: now_ms,
            time_wait_start_ms: 0,
            error: None,
            transitions: TransitionLog::new(),
        }
    }

    /// Active open: the connection starts in SYN_SENT with its SYN pending.
    pub fn connect(tuple: TcpTuple, iss: u32, now_ms: u32, params: TcpParams) -> Self {
        klog_debug!("tcp: CONNECT {} ISS={}", tuple, iss & ISN_MASK);
        let mut conn = Self::blank(tuple, TcpState::SynSent, iss, now_ms, params);
        conn.transitions.push(TcpState::Closed, TcpState::SynSent);
        conn
    }

    /// Passive open from a SYN that hit a listening port.  Starts in
    /// SYN_RECEIVED with the SYN-ACK pending.
    pub fn accept(
        tuple: TcpTuple,
        syn: &TcpSegment<'_>,
        iss: u32,
        now_ms: u32,
        params: TcpParams,
    ) -> Self {
        let mut conn = Self::blank(tuple, TcpState::SynReceived, iss, now_ms, params);
        conn.passive = true;
        conn.transitions.push(TcpState::Listen, TcpState::SynReceived);
        conn.irs = syn.header.seq_num;
        conn.rcv_nxt = syn.header.seq_num.wrapping_add(1);
        conn.snd_wnd = syn.header.window_size;
        conn.peer_mss = parse_mss_option(syn.options)
            .unwrap_or(DEFAULT_REMOTE_MSS)
            .min(params.mss);
        klog_debug!(
            "tcp: LISTEN -> SYN_RECEIVED {} ISS={} IRS={}",
            tuple,
            conn.iss,
            conn.irs
        );
        conn
    }

    // --- Accessors ----------------------------------------------------------

    pub fn tuple(&self) -> TcpTuple {
        self.tuple
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Why the connection reached CLOSED, if it did so abnormally.
    pub fn error(&self) -> Option<TcpError> {
        self.error
    }

    /// Created from a SYN on a listening port.
    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn iss(&self) -> u32 {
        self.iss
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    pub fn peer_mss(&self) -> u16 {
        self.peer_mss
    }

    pub fn rto_ms(&self) -> u32 {
        self.rto_ms
    }

    /// Received bytes waiting for the application.
    pub fn available(&self) -> usize {
        self.recv_buf.len() as usize
    }

    /// Room left in the send ring.
    pub fn send_space(&self) -> usize {
        self.send_buf.space() as usize
    }

    /// Bytes accepted by `send` that the peer has not acknowledged.
    pub fn unacked(&self) -> usize {
        self.send_buf.len() as usize
    }

    /// The peer sent FIN, or the connection is gone.
    pub fn is_remote_end_closed(&self) -> bool {
        self.remote_closed || self.state == TcpState::Closed
    }

    /// We queued our FIN, or the connection is gone.
    pub fn is_local_end_closed(&self) -> bool {
        self.fin_queued || self.state == TcpState::Closed
    }

    /// The application may queue more data.
    pub fn can_send(&self) -> bool {
        !self.fin_queued && matches!(self.state, TcpState::Established | TcpState::CloseWait)
    }

    fn recv_window(&self) -> u16 {
        self.recv_buf.space().min(u16::MAX as u32) as u16
    }

    /// Transitions since the last call, oldest first.  Includes the
    /// implicit CLOSED -> SYN_SENT or LISTEN -> SYN_RECEIVED of creation.
    pub fn take_transitions(&mut self) -> Transitions {
        let (entries, len) = self.transitions.take();
        entries.into_iter().take(len)
    }

    fn set_state(&mut self, new: TcpState) {
        klog_debug!("tcp: {} -> {} {}", self.state, new, self.tuple);
        self.transitions.push(self.state, new);
        self.state = new;
    }

    fn enter_closed(&mut self, error: Option<TcpError>) {
        if let Some(err) = error {
            klog_info!("tcp: {} closed: {}", self.tuple, err);
        }
        self.set_state(TcpState::Closed);
        self.error = error;
        self.retransmit_deadline = None;
        self.syn_pending = false;
        self.ack_pending = false;
        self.retransmit_pending = false;
        self.probe_pending = false;
    }

    fn enter_time_wait(&mut self, now_ms: u32) {
        self.set_state(TcpState::TimeWait);
        self.time_wait_start_ms = now_ms;
        self.retransmit_deadline = None;
        self.retransmit_pending = false;
        self.probe_pending = false;
    }

    fn segment(&self, kind: SegmentKind, seq_num: u32, flags: TcpFlags) -> TcpOutSegment {
        TcpOutSegment {
            tuple: self.tuple,
            seq_num,
            ack_num: if flags.contains(TcpFlags::ACK) {
                self.rcv_nxt
            } else {
                0
            },
            flags,
            window_size: self.recv_window(),
            mss: 0,
            payload_offset: 0,
            payload_len: 0,
            kind,
        }
    }

    fn rst_segment(&self) -> TcpOutSegment {
        let mut seg = self.segment(SegmentKind::Rst, self.snd_nxt, TcpFlags::RST | TcpFlags::ACK);
        seg.window_size = 0;
        seg
    }

    fn rst_with_seq(&self, seq_num: u32) -> TcpOutSegment {
        let mut seg = self.segment(SegmentKind::Rst, seq_num, TcpFlags::RST);
        seg.window_size = 0;
        seg
    }

    // --- Application operations ---------------------------------------------

    /// Queue as much of `data` as fits in the send ring.
    pub fn send(&mut self, data: &[u8], now_ms: u32) -> Result<usize, TcpError> {
        if !self.can_send() {
            return Err(match self.state {
                TcpState::Closed => self.error.unwrap_or(TcpError::Closed),
                _ => TcpError::InvalidState,
            });
        }
        let n = self.send_buf.push_slice(data);
        if n > 0 {
            self.last_activity_ms = now_ms;
        }
        Ok(n)
    }

    /// Move received bytes into `buf`.
    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let before = self.recv_buf.space() as usize;
        let n = self.recv_buf.pop_into(buf);
        // Window was nearly shut; tell the peer it opened.
        if n > 0 && before < (self.peer_mss as usize).min(TCP_BUFFER_SIZE / 2) {
            self.ack_pending = true;
        }
        n
    }

    /// Graceful close.  Queues our FIN behind any unsent data.
    pub fn close(&mut self) -> Result<(), TcpError> {
        match self.state {
            TcpState::Closed => Err(self.error.unwrap_or(TcpError::Closed)),
            TcpState::Listen | TcpState::SynSent => {
                self.enter_closed(None);
                Ok(())
            }
            TcpState::SynReceived | TcpState::Established => {
                self.fin_queued = true;
                self.set_state(TcpState::FinWait1);
                Ok(())
            }
            TcpState::CloseWait => {
                self.fin_queued = true;
                self.set_state(TcpState::LastAck);
                Ok(())
            }
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait => {
                klog_debug!("tcp: close {} already closing ({})", self.tuple, self.state);
                Ok(())
            }
        }
    }

    /// Abortive close.  Returns the RST to transmit, if the peer knows about
    /// the connection.
    pub fn abort(&mut self) -> Result<Option<TcpOutSegment>, TcpError> {
        match self.state {
            TcpState::SynSent => {
                self.enter_closed(None);
                Ok(None)
            }
            TcpState::SynReceived | TcpState::Established | TcpState::CloseWait => {
                let rst = self.rst_segment();
                klog_debug!("tcp: ABORT {} from {}", self.tuple, self.state);
                self.enter_closed(None);
                Ok(Some(rst))
            }
            _ => Err(TcpError::InvalidState),
        }
    }

    /// Copy the payload of `seg` out of the send ring.
    pub fn copy_payload(&self, seg: &TcpOutSegment, out: &mut [u8]) -> usize {
        let len = seg.payload_len.min(out.len());
        self.send_buf.copy_at(seg.payload_offset, &mut out[..len])
    }

    // --- Output -------------------------------------------------------------

    fn can_send_data(&self) -> bool {
        !self.fin_sent
            && matches!(
                self.state,
                TcpState::Established | TcpState::CloseWait | TcpState::FinWait1 | TcpState::LastAck
            )
    }

    /// Next segment the connection wants to transmit, if any.  Nothing
    /// changes until the segment is [committed](Self::commit).
    pub fn next_segment(&mut self) -> Option<TcpOutSegment> {
        if matches!(self.state, TcpState::Closed | TcpState::Listen | TcpState::TimeWait)
            && !self.ack_pending
        {
            return None;
        }

        if self.syn_pending {
            let (kind, flags) = match self.state {
                TcpState::SynSent => (SegmentKind::Syn, TcpFlags::SYN),
                TcpState::SynReceived => (SegmentKind::SynAck, TcpFlags::SYN | TcpFlags::ACK),
                _ => {
                    self.syn_pending = false;
                    return self.next_segment();
                }
            };
            let mut seg = self.segment(kind, self.iss, flags);
            seg.mss = self.params.mss;
            return Some(seg);
        }

        if self.retransmit_pending {
            if self.in_flight > 0 {
                let mut seg = self.segment(
                    SegmentKind::Retransmit,
                    self.snd_una,
                    TcpFlags::ACK | TcpFlags::PSH,
                );
                seg.payload_len = self.in_flight.min(self.peer_mss as usize);
                return Some(seg);
            }
            if self.fin_sent && !self.fin_acked {
                return Some(self.segment(
                    SegmentKind::Retransmit,
                    self.snd_nxt.wrapping_sub(1),
                    TcpFlags::FIN | TcpFlags::ACK,
                ));
            }
            self.retransmit_pending = false;
        }

        let unsent = self.send_buf.len() as usize - self.in_flight;
        if self.probe_pending {
            if self.can_send_data() && unsent > 0 && self.snd_wnd == 0 {
                let mut seg = self.segment(
                    SegmentKind::WindowProbe,
                    self.snd_nxt,
                    TcpFlags::ACK | TcpFlags::PSH,
                );
                seg.payload_offset = self.in_flight;
                seg.payload_len = 1;
                return Some(seg);
            }
            self.probe_pending = false;
        }

        if self.can_send_data() && unsent > 0 {
            let window = (self.snd_wnd as usize).saturating_sub(self.in_flight);
            let len = unsent.min(window).min(self.peer_mss as usize);
            if len > 0 {
                let mut seg =
                    self.segment(SegmentKind::Data, self.snd_nxt, TcpFlags::ACK | TcpFlags::PSH);
                seg.payload_offset = self.in_flight;
                seg.payload_len = len;
                return Some(seg);
            }
        }

        if self.fin_queued && !self.fin_sent && unsent == 0 {
            return Some(self.segment(
                SegmentKind::Fin,
                self.snd_nxt,
                TcpFlags::FIN | TcpFlags::ACK,
            ));
        }

        if self.ack_pending {
            return Some(self.segment(SegmentKind::Ack, self.snd_nxt, TcpFlags::ACK));
        }

        None
    }

    /// Record that `seg` (from [`next_segment`](Self::next_segment)) went out.
    pub fn commit(&mut self, seg: &TcpOutSegment, now_ms: u32) {
        match seg.kind {
            SegmentKind::Syn | SegmentKind::SynAck => {
                self.syn_pending = false;
                self.retransmit_deadline =
                    Some(now_ms.wrapping_add(self.params.connect_retry_interval_ms));
            }
            SegmentKind::Data | SegmentKind::WindowProbe => {
                self.probe_pending = false;
                self.snd_nxt = self.snd_nxt.wrapping_add(seg.payload_len as u32);
                self.in_flight += seg.payload_len;
                self.arm_retransmit(now_ms);
            }
            SegmentKind::Retransmit => {
                self.retransmit_pending = false;
            }
            SegmentKind::Fin => {
                self.snd_nxt = self.snd_nxt.wrapping_add(1);
                self.fin_sent = true;
                self.arm_retransmit(now_ms);
            }
            SegmentKind::Ack | SegmentKind::Rst => {}
        }
        if seg.flags.contains(TcpFlags::ACK) {
            self.ack_pending = false;
        }
    }

    fn arm_retransmit(&mut self, now_ms: u32) {
        if self.retransmit_deadline.is_none() {
            self.retransmit_deadline = Some(now_ms.wrapping_add(self.rto_ms));
        }
    }

    // --- Timers -------------------------------------------------------------

    /// Run the connection's timers.  Returns an RST to transmit when the
    /// connection is torn down unilaterally.
    pub fn on_timer(&mut self, now_ms: u32) -> Option<TcpOutSegment> {
        match self.state {
            TcpState::Closed | TcpState::Listen => return None,
            TcpState::TimeWait => {
                if has_elapsed(
                    self.time_wait_start_ms,
                    self.params.msl_ms.saturating_mul(2),
                    now_ms,
                ) {
                    klog_debug!("tcp: TIME_WAIT expired {}", self.tuple);
                    self.enter_closed(None);
                }
                return None;
            }
            _ => {}
        }

        if self.params.idle_timeout_ms != 0
            && has_elapsed(self.last_activity_ms, self.params.idle_timeout_ms, now_ms)
        {
            klog_info!(
                "tcp: {} idle for {} ms, resetting",
                self.tuple,
                self.params.idle_timeout_ms
            );
            let rst = (self.state != TcpState::SynSent).then(|| self.rst_segment());
            self.enter_closed(Some(TcpError::Timeout));
            return rst;
        }

        let Some(deadline) = self.retransmit_deadline else {
            // Zero window with data waiting: arm the persist timer.
            let unsent = self.send_buf.len() as usize - self.in_flight;
            if self.snd_wnd == 0 && unsent > 0 && self.can_send_data() {
                self.retransmit_deadline = Some(now_ms.wrapping_add(self.rto_ms));
            }
            return None;
        };
        if !deadline_reached(deadline, now_ms) {
            return None;
        }

        match self.state {
            TcpState::SynSent | TcpState::SynReceived => {
                if self.syn_retries >= self.params.connect_max_retries {
                    let rst = (self.state == TcpState::SynReceived).then(|| self.rst_segment());
                    self.enter_closed(Some(TcpError::Timeout));
                    return rst;
                }
                self.syn_retries += 1;
                self.syn_pending = true;
                self.retransmit_deadline = None;
                klog_debug!("tcp: {} SYN retry {}", self.tuple, self.syn_retries);
                None
            }
            _ if self.snd_una == self.snd_nxt => {
                // Persist timer: push one byte past the closed window.  A
                // bare ACK need not be answered, a byte of data must be.
                let unsent = self.send_buf.len() as usize - self.in_flight;
                if self.snd_wnd == 0 && unsent > 0 && self.can_send_data() {
                    klog_debug!("tcp: {} zero window, probing", self.tuple);
                    self.probe_pending = true;
                    self.retransmit_deadline = None;
                } else {
                    self.ack_pending = true;
                    self.retransmit_deadline = Some(now_ms.wrapping_add(self.rto_ms));
                }
                None
            }
            _ => {
                // A peer that keeps its window shut is still answering our
                // probes; only count retransmissions into an open window.
                let persisting = self.snd_wnd == 0;
                if !persisting && self.retransmits >= self.params.max_retransmits {
                    let rst = self.rst_segment();
                    self.enter_closed(Some(TcpError::Timeout));
                    return Some(rst);
                }
                if !persisting {
                    self.retransmits += 1;
                }
                self.rto_ms = self
                    .rto_ms
                    .saturating_mul(2)
                    .min(self.params.max_resend_delay_ms);
                self.retransmit_pending = true;
                self.retransmit_deadline = Some(now_ms.wrapping_add(self.rto_ms));
                klog_debug!(
                    "tcp: {} retransmit {} rto={}ms",
                    self.tuple,
                    self.retransmits,
                    self.rto_ms
                );
                None
            }
        }
    }

    // --- Input --------------------------------------------------------------

    /// Process an inbound segment addressed to this connection.  Returns an
    /// RST to transmit immediately, if the segment calls for one; ACKs and
    /// data come out of [`next_segment`](Self::next_segment).
    pub fn on_segment(&mut self, seg: &TcpSegment<'_>, now_ms: u32) -> Option<TcpOutSegment> {
        self.last_activity_ms = now_ms;
        match self.state {
            TcpState::Closed | TcpState::Listen => None,
            TcpState::SynSent => self.process_syn_sent(seg),
            TcpState::SynReceived => self.process_syn_received(seg, now_ms),
            TcpState::TimeWait => self.process_time_wait(seg, now_ms),
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait
            | TcpState::Closing
            | TcpState::LastAck => self.process_established_and_closing(seg, now_ms),
        }
    }

    /// SYN_SENT: expecting SYN+ACK (or a simultaneous-open SYN).
    fn process_syn_sent(&mut self, seg: &TcpSegment<'_>) -> Option<TcpOutSegment> {
        let hdr = &seg.header;

        if hdr.is_ack() && (seq_le(hdr.ack_num, self.iss) || seq_gt(hdr.ack_num, self.snd_nxt)) {
            if hdr.is_rst() {
                return None;
            }
            return Some(self.rst_with_seq(hdr.ack_num));
        }

        if hdr.is_rst() {
            if hdr.is_ack() {
                klog_debug!("tcp: SYN_SENT {} RST received, connection refused", self.tuple);
                self.enter_closed(Some(TcpError::Refused));
            }
            return None;
        }

        if !hdr.is_syn() {
            return None;
        }

        self.irs = hdr.seq_num;
        self.rcv_nxt = hdr.seq_num.wrapping_add(1);
        self.snd_wnd = hdr.window_size;
        self.peer_mss = parse_mss_option(seg.options)
            .unwrap_or(DEFAULT_REMOTE_MSS)
            .min(self.params.mss);
        self.retransmit_deadline = None;
        self.ack_pending = true;

        if hdr.is_ack() {
            self.snd_una = hdr.ack_num;
            self.syn_retries = 0;
            self.set_state(TcpState::Established);
        } else {
            // Simultaneous open.
            self.syn_pending = true;
            self.set_state(TcpState::SynReceived);
        }
        None
    }

    /// SYN_RECEIVED: expecting the ACK that completes the handshake.
    fn process_syn_received(
        &mut self,
        seg: &TcpSegment<'_>,
        now_ms: u32,
    ) -> Option<TcpOutSegment> {
        let hdr = &seg.header;

        if hdr.is_rst() {
            klog_debug!("tcp: SYN_RECEIVED {} RST, closing", self.tuple);
            self.enter_closed(Some(TcpError::Reset));
            return None;
        }

        if hdr.is_syn() && !hdr.is_ack() {
            // Peer missed our SYN-ACK.
            self.syn_pending = true;
            return None;
        }

        if !hdr.is_ack() {
            return None;
        }

        if seq_le(hdr.ack_num, self.snd_una) || seq_gt(hdr.ack_num, self.snd_nxt) {
            return Some(self.rst_with_seq(hdr.ack_num));
        }

        self.snd_una = hdr.ack_num;
        self.snd_wnd = hdr.window_size;
        self.retransmit_deadline = None;
        self.syn_retries = 0;
        self.set_state(TcpState::Established);

        self.process_payload_and_fin(seg, now_ms);
        None
    }

    /// ESTABLISHED and the closing states.
    fn process_established_and_closing(
        &mut self,
        seg: &TcpSegment<'_>,
        now_ms: u32,
    ) -> Option<TcpOutSegment> {
        let hdr = &seg.header;

        if hdr.is_rst() {
            if self.seq_in_window(hdr.seq_num) {
                klog_debug!("tcp: {} {} RST received", self.state, self.tuple);
                self.enter_closed(Some(TcpError::Reset));
            }
            return None;
        }

        if hdr.is_syn() {
            if hdr.seq_num == self.irs {
                // Retransmitted SYN-ACK: our handshake ACK was lost.
                self.ack_pending = true;
                return None;
            }
            klog_debug!("tcp: {} {} unexpected SYN, sending RST", self.state, self.tuple);
            let rst = self.rst_segment();
            self.enter_closed(Some(TcpError::Reset));
            return Some(rst);
        }

        if !hdr.is_ack() {
            return None;
        }

        self.process_ack(hdr, now_ms);

        if self.fin_acked {
            match self.state {
                TcpState::FinWait1 => self.set_state(TcpState::FinWait2),
                TcpState::Closing => {
                    self.enter_time_wait(now_ms);
                    return None;
                }
                TcpState::LastAck => {
                    self.enter_closed(None);
                    return None;
                }
                _ => {}
            }
        }

        self.process_payload_and_fin(seg, now_ms);
        None
    }

    /// TIME_WAIT: re-ACK a retransmitted FIN and restart the timer.
    fn process_time_wait(&mut self, seg: &TcpSegment<'_>, now_ms: u32) -> Option<TcpOutSegment> {
        let hdr = &seg.header;
        if hdr.is_rst() {
            self.enter_closed(None);
            return None;
        }
        if hdr.is_fin() {
            self.ack_pending = true;
            self.time_wait_start_ms = now_ms;
        }
        None
    }

    fn seq_in_window(&self, seq: u32) -> bool {
        let window = (self.recv_window() as u32).max(1);
        seq_ge(seq, self.rcv_nxt) && seq_lt(seq, self.rcv_nxt.wrapping_add(window))
    }

    fn process_ack(&mut self, hdr: &TcpHeader, now_ms: u32) {
        let ack = hdr.ack_num;
        if seq_gt(ack, self.snd_nxt) {
            // Acknowledges something we never sent.
            self.ack_pending = true;
            return;
        }
        if seq_gt(ack, self.snd_una) {
            let mut acked = ack.wrapping_sub(self.snd_una) as usize;
            let data = acked.min(self.in_flight);
            self.send_buf.discard(data);
            self.in_flight -= data;
            acked -= data;
            if acked > 0 && self.fin_sent {
                self.fin_acked = true;
            }
            self.snd_una = ack;
            self.retransmits = 0;
            self.rto_ms = self.params.initial_resend_delay_ms;
            self.retransmit_deadline = if self.snd_una == self.snd_nxt {
                None
            } else {
                Some(now_ms.wrapping_add(self.rto_ms))
            };
        }
        if seq_ge(ack, self.snd_una) {
            self.snd_wnd = hdr.window_size;
        }
    }

    /// Accept in-order data and a FIN that follows it.  Anything else is
    /// dropped and answered with a duplicate ACK.
    fn process_payload_and_fin(&mut self, seg: &TcpSegment<'_>, now_ms: u32) {
        let hdr = &seg.header;
        let mut payload = seg.payload;
        let mut seq = hdr.seq_num;

        if !payload.is_empty() {
            if matches!(
                self.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            ) {
                if seq_lt(seq, self.rcv_nxt) {
                    let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
                    payload = payload.get(skip..).unwrap_or(&[]);
                    seq = self.rcv_nxt;
                }
                if seq == self.rcv_nxt && !payload.is_empty() {
                    let accepted = self.recv_buf.push_slice(payload);
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(accepted as u32);
                    if accepted < payload.len() {
                        klog_debug!(
                            "tcp: {} receive ring full, dropped {} bytes",
                            self.tuple,
                            payload.len() - accepted
                        );
                    }
                } else if seq != self.rcv_nxt {
                    klog_debug!(
                        "tcp: {} out-of-order seq={} expected={}",
                        self.tuple,
                        seq,
                        self.rcv_nxt
                    );
                }
            }
            self.ack_pending = true;
        }

        if !hdr.is_fin() {
            return;
        }

        self.ack_pending = true;
        let fin_seq = hdr.seq_num.wrapping_add(seg.payload.len() as u32);
        if fin_seq != self.rcv_nxt {
            return;
        }
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.remote_closed = true;

        match self.state {
            TcpState::Established => self.set_state(TcpState::CloseWait),
            TcpState::FinWait1 => self.set_state(TcpState::Closing),
            TcpState::FinWait2 => self.enter_time_wait(now_ms),
            _ => {}
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("tuple", &self.tuple)
            .field("state", &self.state)
            .field("snd_una", &self.snd_una)
            .field("snd_nxt", &self.snd_nxt)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
