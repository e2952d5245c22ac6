//! TCP header codec and the connection state machine: handshakes, data
//! transfer, both close sequences, resets and timers.

use slopnet_lib::testing::TestResult;
use slopnet_lib::{assert_eq_test, assert_ok, assert_some, assert_test, pass};

use crate::config::TcpParams;
use crate::tcp::{
    DEFAULT_REMOTE_MSS, SegmentKind, TCP_HEADER_LEN, TcpConnection, TcpError, TcpFlags,
    TcpHeader, TcpOutSegment, TcpSegment, TcpState, TcpTuple, build_rst_for, parse_header,
    parse_mss_option, seq_ge, seq_gt, seq_le, seq_lt, verify_checksum, write_header,
};
use crate::types::{Ipv4Addr, Port};

const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

const TUPLE: TcpTuple = TcpTuple {
    local_ip: LOCAL_IP,
    local_port: Port(49152),
    remote_ip: REMOTE_IP,
    remote_port: Port(80),
};

/// The same connection seen from the peer.
const PEER_TUPLE: TcpTuple = TcpTuple {
    local_ip: REMOTE_IP,
    local_port: Port(80),
    remote_ip: LOCAL_IP,
    remote_port: Port(49152),
};

const ISS: u32 = 1000;
const PEER_ISS: u32 = 5000;

/// Segment sent by the peer, serialized to wire bytes.
fn peer_bytes(flags: TcpFlags, seq: u32, ack: u32, mss: u16, payload: &[u8]) -> Vec<u8> {
    let seg = TcpOutSegment {
        tuple: PEER_TUPLE,
        seq_num: seq,
        ack_num: ack,
        flags,
        window_size: 4096,
        mss,
        payload_offset: 0,
        payload_len: payload.len(),
        kind: SegmentKind::Data,
    };
    let mut buf = vec![0u8; seg.wire_len()];
    seg.write(payload, &mut buf).unwrap();
    buf
}

fn deliver(
    conn: &mut TcpConnection,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    payload: &[u8],
    now: u32,
) -> Option<TcpOutSegment> {
    let bytes = peer_bytes(flags, seq, ack, 0, payload);
    let seg = TcpSegment::parse(&bytes).unwrap();
    conn.on_segment(&seg, now)
}

/// Pure ACK from the peer advertising `window`.
fn window_update(conn: &mut TcpConnection, ack: u32, window: u16, now: u32) {
    let seg = TcpOutSegment {
        tuple: PEER_TUPLE,
        seq_num: PEER_ISS + 1,
        ack_num: ack,
        flags: TcpFlags::ACK,
        window_size: window,
        mss: 0,
        payload_offset: 0,
        payload_len: 0,
        kind: SegmentKind::Ack,
    };
    let mut buf = vec![0u8; seg.wire_len()];
    seg.finish(&mut buf).unwrap();
    conn.on_segment(&TcpSegment::parse(&buf).unwrap(), now);
}

/// Pull and commit the next outbound segment.
fn transmit(conn: &mut TcpConnection, now: u32) -> Option<TcpOutSegment> {
    let seg = conn.next_segment()?;
    conn.commit(&seg, now);
    Some(seg)
}

/// Active open completed at t=0 with the handshake ACK already sent.
fn established() -> TcpConnection {
    let mut conn = TcpConnection::connect(TUPLE, ISS, 0, TcpParams::default());
    transmit(&mut conn, 0);
    let bytes = peer_bytes(TcpFlags::SYN | TcpFlags::ACK, PEER_ISS, ISS + 1, 1460, &[]);
    conn.on_segment(&TcpSegment::parse(&bytes).unwrap(), 0);
    transmit(&mut conn, 0);
    conn
}

// =============================================================================
// Codec
// =============================================================================

pub fn test_header_round_trip() -> TestResult {
    let hdr = TcpHeader {
        src_port: 1234,
        dst_port: 80,
        seq_num: 0xdead_beef,
        ack_num: 42,
        data_offset: 5,
        flags: TcpFlags::SYN | TcpFlags::ACK,
        window_size: 2048,
        checksum: 0,
        urgent_ptr: 0,
    };
    let mut buf = [0u8; TCP_HEADER_LEN];
    assert_eq_test!(write_header(&hdr, &mut buf), Some(TCP_HEADER_LEN));
    assert_eq_test!(buf[12], 0x50);
    assert_eq_test!(parse_header(&buf), Some(hdr));

    buf[12] = 0x40;
    assert_test!(parse_header(&buf).is_none(), "data offset below 5");
    assert_test!(parse_header(&buf[..19]).is_none());
    pass!()
}

pub fn test_mss_option_parsing() -> TestResult {
    assert_eq_test!(parse_mss_option(&[2, 4, 0x05, 0xb4]), Some(1460));
    assert_eq_test!(parse_mss_option(&[1, 1, 2, 4, 0x02, 0x18]), Some(536));
    assert_eq_test!(
        parse_mss_option(&[8, 10, 0, 0, 0, 0, 0, 0, 0, 0, 2, 4, 0x01, 0x00]),
        Some(256)
    );
    assert_eq_test!(parse_mss_option(&[0, 2, 4, 0x05, 0xb4]), None, "END stops the scan");
    assert_eq_test!(parse_mss_option(&[2, 4, 0x05]), None, "truncated option");
    pass!()
}

pub fn test_out_segment_checksum() -> TestResult {
    let bytes = peer_bytes(TcpFlags::ACK | TcpFlags::PSH, 7, 9, 0, b"payload");
    assert_test!(verify_checksum(REMOTE_IP, LOCAL_IP, &bytes));
    assert_test!(!verify_checksum(LOCAL_IP, Ipv4Addr::new(10, 0, 0, 3), &bytes));

    let seg = assert_some!(TcpSegment::parse(&bytes));
    assert_eq_test!(seg.payload, &b"payload"[..]);
    assert_eq_test!(seg.seq_len(), 7);

    let syn = peer_bytes(TcpFlags::SYN, 7, 0, 1460, &[]);
    let seg = assert_some!(TcpSegment::parse(&syn));
    assert_eq_test!(seg.header.header_len(), TCP_HEADER_LEN + 4);
    assert_eq_test!(parse_mss_option(seg.options), Some(1460));
    assert_eq_test!(seg.seq_len(), 1);
    pass!()
}

pub fn test_sequence_arithmetic_wraps() -> TestResult {
    assert_test!(seq_lt(0xffff_fff0, 0x10));
    assert_test!(seq_gt(0x10, 0xffff_fff0));
    assert_test!(seq_le(5, 5) && seq_ge(5, 5));
    assert_test!(!seq_lt(5, 5));
    pass!()
}

pub fn test_rst_for_stray_segments() -> TestResult {
    let syn = peer_bytes(TcpFlags::SYN, 100, 0, 0, &[]);
    let rst = build_rst_for(&TcpSegment::parse(&syn).unwrap(), LOCAL_IP, REMOTE_IP);
    assert_eq_test!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq_test!(rst.seq_num, 0);
    assert_eq_test!(rst.ack_num, 101);
    assert_eq_test!(rst.tuple, TUPLE);

    let ack = peer_bytes(TcpFlags::ACK, 100, 555, 0, b"xy");
    let rst = build_rst_for(&TcpSegment::parse(&ack).unwrap(), LOCAL_IP, REMOTE_IP);
    assert_eq_test!(rst.flags, TcpFlags::RST);
    assert_eq_test!(rst.seq_num, 555);
    pass!()
}

// =============================================================================
// Handshake
// =============================================================================

pub fn test_active_open() -> TestResult {
    let mut conn = TcpConnection::connect(TUPLE, ISS, 0, TcpParams::default());
    assert_eq_test!(conn.state(), TcpState::SynSent);

    let syn = assert_some!(transmit(&mut conn, 0));
    assert_eq_test!(syn.kind, SegmentKind::Syn);
    assert_eq_test!(syn.flags, TcpFlags::SYN);
    assert_eq_test!(syn.seq_num, ISS);
    assert_eq_test!(syn.mss, 1460);
    assert_test!(conn.next_segment().is_none(), "SYN sent once");

    let reply = deliver(&mut conn, TcpFlags::SYN | TcpFlags::ACK, PEER_ISS, ISS + 1, &[], 10);
    assert_test!(reply.is_none());
    assert_eq_test!(conn.state(), TcpState::Established);
    assert_eq_test!(conn.rcv_nxt(), PEER_ISS + 1);
    assert_eq_test!(conn.snd_una(), ISS + 1);
    assert_eq_test!(conn.peer_mss(), DEFAULT_REMOTE_MSS, "no MSS option in the SYN-ACK");

    let ack = assert_some!(transmit(&mut conn, 10));
    assert_eq_test!(ack.kind, SegmentKind::Ack);
    assert_eq_test!(ack.ack_num, PEER_ISS + 1);
    assert_test!(conn.next_segment().is_none());
    pass!()
}

pub fn test_passive_open_clamps_mss() -> TestResult {
    let syn = peer_bytes(TcpFlags::SYN, 7000, 0, 9000, &[]);
    let seg = TcpSegment::parse(&syn).unwrap();
    let mut conn = TcpConnection::accept(TUPLE, &seg, 2000, 0, TcpParams::default());
    assert_eq_test!(conn.state(), TcpState::SynReceived);
    assert_test!(conn.is_passive());
    assert_eq_test!(conn.peer_mss(), 1460, "clamped to our MSS");

    let syn_ack = assert_some!(transmit(&mut conn, 0));
    assert_eq_test!(syn_ack.kind, SegmentKind::SynAck);
    assert_eq_test!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq_test!(syn_ack.ack_num, 7001);

    deliver(&mut conn, TcpFlags::ACK, 7001, 2001, &[], 5);
    assert_eq_test!(conn.state(), TcpState::Established);
    pass!()
}

pub fn test_refused_connection() -> TestResult {
    let mut conn = TcpConnection::connect(TUPLE, ISS, 0, TcpParams::default());
    transmit(&mut conn, 0);
    deliver(&mut conn, TcpFlags::RST | TcpFlags::ACK, 0, ISS + 1, &[], 10);
    assert_eq_test!(conn.state(), TcpState::Closed);
    assert_eq_test!(conn.error(), Some(TcpError::Refused));
    pass!()
}

pub fn test_syn_retries_then_timeout() -> TestResult {
    let params = TcpParams::default();
    let interval = params.connect_retry_interval_ms;
    let mut conn = TcpConnection::connect(TUPLE, ISS, 0, params);
    transmit(&mut conn, 0);

    assert_test!(conn.on_timer(interval - 1).is_none());
    assert_test!(conn.next_segment().is_none());

    for attempt in 1..=params.connect_max_retries as u32 {
        let now = attempt * interval;
        assert_test!(conn.on_timer(now).is_none());
        let syn = assert_some!(transmit(&mut conn, now));
        assert_eq_test!(syn.kind, SegmentKind::Syn);
    }

    let now = (params.connect_max_retries as u32 + 1) * interval;
    assert_test!(conn.on_timer(now).is_none(), "no RST from SYN_SENT");
    assert_eq_test!(conn.state(), TcpState::Closed);
    assert_eq_test!(conn.error(), Some(TcpError::Timeout));
    pass!()
}

// =============================================================================
// Data transfer
// =============================================================================

pub fn test_send_and_acknowledge() -> TestResult {
    let mut conn = established();
    assert_eq_test!(assert_ok!(conn.send(b"hello", 10)), 5);
    assert_eq_test!(conn.unacked(), 5);

    let seg = assert_some!(transmit(&mut conn, 10));
    assert_eq_test!(seg.kind, SegmentKind::Data);
    assert_eq_test!(seg.seq_num, ISS + 1);
    assert_eq_test!(seg.payload_len, 5);
    let mut out = [0u8; 8];
    assert_eq_test!(conn.copy_payload(&seg, &mut out), 5);
    assert_eq_test!(&out[..5], b"hello");
    assert_test!(conn.next_segment().is_none(), "nothing more to send");

    deliver(&mut conn, TcpFlags::ACK, PEER_ISS + 1, ISS + 6, &[], 20);
    assert_eq_test!(conn.unacked(), 0);
    assert_eq_test!(conn.snd_una(), ISS + 6);
    pass!()
}

pub fn test_segments_respect_peer_mss() -> TestResult {
    let mut conn = established();
    assert_eq_test!(conn.peer_mss(), 1460);
    let data = vec![0x5au8; 2000];
    assert_eq_test!(assert_ok!(conn.send(&data, 0)), 2000);
    let first = assert_some!(transmit(&mut conn, 0));
    assert_eq_test!(first.payload_len, 1460);
    let second = assert_some!(transmit(&mut conn, 0));
    assert_eq_test!(second.payload_len, 540);
    assert_eq_test!(second.seq_num, ISS + 1 + 1460);
    assert_eq_test!(second.payload_offset, 1460);
    pass!()
}

pub fn test_receive_in_order_only() -> TestResult {
    let mut conn = established();
    deliver(&mut conn, TcpFlags::ACK | TcpFlags::PSH, PEER_ISS + 1, ISS + 1, b"world", 10);
    assert_eq_test!(conn.available(), 5);

    let ack = assert_some!(transmit(&mut conn, 10));
    assert_eq_test!(ack.ack_num, PEER_ISS + 6);

    deliver(&mut conn, TcpFlags::ACK, PEER_ISS + 20, ISS + 1, b"gap", 20);
    assert_eq_test!(conn.available(), 5, "out-of-order data dropped");
    let dup = assert_some!(transmit(&mut conn, 20));
    assert_eq_test!(dup.ack_num, PEER_ISS + 6, "duplicate ACK");

    let mut buf = [0u8; 16];
    assert_eq_test!(conn.recv(&mut buf), 5);
    assert_eq_test!(&buf[..5], b"world");
    assert_eq_test!(conn.recv(&mut buf), 0);
    pass!()
}

pub fn test_retransmit_backs_off() -> TestResult {
    let params = TcpParams::default();
    let mut conn = established();
    assert_ok!(conn.send(b"abc", 100));
    transmit(&mut conn, 100);

    let deadline = 100 + params.initial_resend_delay_ms;
    assert_test!(conn.on_timer(deadline - 1).is_none());
    assert_test!(conn.next_segment().is_none());

    assert_test!(conn.on_timer(deadline).is_none());
    assert_eq_test!(conn.rto_ms(), params.initial_resend_delay_ms * 2);
    let again = assert_some!(transmit(&mut conn, deadline));
    assert_eq_test!(again.kind, SegmentKind::Retransmit);
    assert_eq_test!(again.seq_num, ISS + 1);
    assert_eq_test!(again.payload_len, 3);

    deliver(&mut conn, TcpFlags::ACK, PEER_ISS + 1, ISS + 4, &[], deadline + 5);
    assert_eq_test!(conn.rto_ms(), params.initial_resend_delay_ms, "ACK resets the backoff");
    pass!()
}

pub fn test_zero_window_probe_reopens() -> TestResult {
    let params = TcpParams::default();
    let mut conn = established();
    window_update(&mut conn, ISS + 1, 0, 10);
    assert_ok!(conn.send(b"hello", 10));
    assert_test!(conn.next_segment().is_none(), "window is shut");

    assert_test!(conn.on_timer(20).is_none());
    let due = 20 + params.initial_resend_delay_ms;
    conn.on_timer(due);
    let probe = assert_some!(transmit(&mut conn, due));
    assert_eq_test!(probe.kind, SegmentKind::WindowProbe);
    assert_eq_test!(probe.seq_num, ISS + 1);
    assert_eq_test!(probe.payload_len, 1);
    let mut byte = [0u8; 1];
    assert_eq_test!(conn.copy_payload(&probe, &mut byte), 1);
    assert_eq_test!(byte, *b"h");

    // The window opens only in the answer to the probe.
    window_update(&mut conn, ISS + 2, 4096, due + 5);
    let rest = assert_some!(transmit(&mut conn, due + 5));
    assert_eq_test!(rest.kind, SegmentKind::Data);
    assert_eq_test!(rest.seq_num, ISS + 2);
    assert_eq_test!(rest.payload_len, 4);
    let mut buf = [0u8; 4];
    conn.copy_payload(&rest, &mut buf);
    assert_eq_test!(buf, *b"ello");
    pass!()
}

pub fn test_persist_outlasts_retransmit_limit() -> TestResult {
    let params = TcpParams::default();
    let mut conn = established();
    window_update(&mut conn, ISS + 1, 0, 0);
    assert_ok!(conn.send(b"data", 0));
    conn.on_timer(0);
    let mut now = params.initial_resend_delay_ms;
    conn.on_timer(now);
    let probe = assert_some!(transmit(&mut conn, now));
    assert_eq_test!(probe.kind, SegmentKind::WindowProbe);

    for _ in 0..params.max_retransmits as u32 + 3 {
        // Peer drops the byte and repeats its zero window.
        window_update(&mut conn, ISS + 1, 0, now + 1);
        now += conn.rto_ms();
        assert_test!(conn.on_timer(now).is_none());
        let again = assert_some!(transmit(&mut conn, now));
        assert_eq_test!(again.kind, SegmentKind::Retransmit);
        assert_eq_test!(again.payload_len, 1);
    }
    assert_eq_test!(conn.state(), TcpState::Established);
    assert_eq_test!(conn.rto_ms(), params.max_resend_delay_ms);
    pass!()
}

pub fn test_transitions_logged_in_order() -> TestResult {
    let mut conn = established();
    let log: Vec<_> = conn.take_transitions().collect();
    assert_eq_test!(
        log,
        vec![
            (TcpState::Closed, TcpState::SynSent),
            (TcpState::SynSent, TcpState::Established),
        ]
    );
    assert_eq_test!(conn.take_transitions().count(), 0);

    assert_ok!(conn.close());
    transmit(&mut conn, 10);
    deliver(&mut conn, TcpFlags::FIN | TcpFlags::ACK, PEER_ISS + 1, ISS + 2, &[], 20);
    let log: Vec<_> = conn.take_transitions().collect();
    assert_eq_test!(
        log,
        vec![
            (TcpState::Established, TcpState::FinWait1),
            (TcpState::FinWait1, TcpState::FinWait2),
            (TcpState::FinWait2, TcpState::TimeWait),
        ]
    );
    pass!()
}

// =============================================================================
// Close and reset
// =============================================================================

pub fn test_active_close_through_time_wait() -> TestResult {
    let params = TcpParams::default();
    let mut conn = established();
    assert_ok!(conn.close());
    assert_eq_test!(conn.state(), TcpState::FinWait1);
    assert_test!(conn.is_local_end_closed());

    let fin = assert_some!(transmit(&mut conn, 10));
    assert_eq_test!(fin.kind, SegmentKind::Fin);
    assert_eq_test!(fin.flags, TcpFlags::FIN | TcpFlags::ACK);

    deliver(&mut conn, TcpFlags::ACK, PEER_ISS + 1, ISS + 2, &[], 20);
    assert_eq_test!(conn.state(), TcpState::FinWait2);

    deliver(&mut conn, TcpFlags::FIN | TcpFlags::ACK, PEER_ISS + 1, ISS + 2, &[], 30);
    assert_eq_test!(conn.state(), TcpState::TimeWait);
    let ack = assert_some!(transmit(&mut conn, 30));
    assert_eq_test!(ack.ack_num, PEER_ISS + 2);

    conn.on_timer(30 + 2 * params.msl_ms - 1);
    assert_eq_test!(conn.state(), TcpState::TimeWait);
    conn.on_timer(30 + 2 * params.msl_ms);
    assert_eq_test!(conn.state(), TcpState::Closed);
    assert_eq_test!(conn.error(), None);
    pass!()
}

pub fn test_passive_close() -> TestResult {
    let mut conn = established();
    deliver(&mut conn, TcpFlags::FIN | TcpFlags::ACK, PEER_ISS + 1, ISS + 1, &[], 10);
    assert_eq_test!(conn.state(), TcpState::CloseWait);
    assert_test!(conn.is_remote_end_closed());
    assert_test!(conn.can_send(), "half-closed: we may still send");

    assert_ok!(conn.close());
    assert_eq_test!(conn.state(), TcpState::LastAck);
    let fin = assert_some!(transmit(&mut conn, 20));
    assert_eq_test!(fin.kind, SegmentKind::Fin);
    assert_eq_test!(fin.ack_num, PEER_ISS + 2);

    deliver(&mut conn, TcpFlags::ACK, PEER_ISS + 2, ISS + 2, &[], 30);
    assert_eq_test!(conn.state(), TcpState::Closed);
    assert_eq_test!(conn.error(), None);
    pass!()
}

pub fn test_reset_by_peer() -> TestResult {
    let mut conn = established();
    deliver(&mut conn, TcpFlags::RST, PEER_ISS + 10_000, 0, &[], 10);
    assert_eq_test!(conn.state(), TcpState::Established, "RST outside the window ignored");

    deliver(&mut conn, TcpFlags::RST, PEER_ISS + 1, 0, &[], 20);
    assert_eq_test!(conn.state(), TcpState::Closed);
    assert_eq_test!(conn.error(), Some(TcpError::Reset));
    assert_eq_test!(conn.send(b"x", 30), Err(TcpError::Reset));
    pass!()
}

pub fn test_abort_sends_rst() -> TestResult {
    let mut conn = established();
    let rst = assert_some!(assert_ok!(conn.abort()));
    assert_test!(rst.flags.contains(TcpFlags::RST));
    assert_eq_test!(rst.seq_num, ISS + 1);
    assert_eq_test!(conn.state(), TcpState::Closed);
    assert_eq_test!(conn.send(b"x", 0), Err(TcpError::Closed));
    assert_eq_test!(conn.abort(), Err(TcpError::InvalidState));

    let mut pending = TcpConnection::connect(TUPLE, ISS, 0, TcpParams::default());
    assert_eq_test!(pending.send(b"early", 0), Err(TcpError::InvalidState));
    assert_eq_test!(pending.abort(), Ok(None), "peer never saw the SYN-ACK");
    pass!()
}

pub fn test_idle_connection_reset() -> TestResult {
    let params = TcpParams::default();
    let mut conn = established();
    assert_test!(conn.on_timer(params.idle_timeout_ms - 1).is_none());
    assert_eq_test!(conn.state(), TcpState::Established);

    let rst = assert_some!(conn.on_timer(params.idle_timeout_ms));
    assert_eq_test!(rst.kind, SegmentKind::Rst);
    assert_eq_test!(conn.state(), TcpState::Closed);
    assert_eq_test!(conn.error(), Some(TcpError::Timeout));
    pass!()
}

slopnet_lib::define_test_suite!(
    tcp,
    [
        // Codec (5)
        test_header_round_trip,
        test_mss_option_parsing,
        test_out_segment_checksum,
        test_sequence_arithmetic_wraps,
        test_rst_for_stray_segments,
        // Handshake (4)
        test_active_open,
        test_passive_open_clamps_mss,
        test_refused_connection,
        test_syn_retries_then_timeout,
        // Data transfer (7)
        test_send_and_acknowledge,
        test_segments_respect_peer_mss,
        test_receive_in_order_only,
        test_retransmit_backs_off,
        test_zero_window_probe_reopens,
        test_persist_outlasts_retransmit_limit,
        test_transitions_logged_in_order,
        // Close and reset (5)
        test_active_close_through_time_wait,
        test_passive_close,
        test_reset_by_peer,
        test_abort_sends_rst,
        test_idle_connection_reset,
    ]
);
