//! ICMP codec and the ping tracker.

use slopnet_lib::testing::TestResult;
use slopnet_lib::{assert_eq_test, assert_some, assert_test, fail, pass};

use crate::icmp::{
    ICMP_CODE_PORT_UNREACHABLE, ICMP_HEADER_LEN, IcmpMessage, PING_DATA, PING_IDENTIFIER,
    PingStatus, PingTracker, write_dest_unreachable, write_echo_reply, write_echo_request,
};
use crate::types::Ipv4Addr;

const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

pub fn test_echo_request_round_trip() -> TestResult {
    let mut buf = [0u8; 64];
    let len = assert_some!(write_echo_request(PING_IDENTIFIER, 9, PING_DATA, &mut buf));
    assert_eq_test!(len, ICMP_HEADER_LEN + PING_DATA.len());
    match IcmpMessage::parse(&buf[..len]) {
        Some(IcmpMessage::EchoRequest { ident, seq, data }) => {
            assert_eq_test!(ident, PING_IDENTIFIER);
            assert_eq_test!(seq, 9);
            assert_eq_test!(data, PING_DATA);
        }
        other => return fail!("unexpected parse {:?}", other),
    }
    pass!()
}

pub fn test_echo_reply_mirrors_request() -> TestResult {
    let mut buf = [0u8; 64];
    let len = assert_some!(write_echo_reply(0x1111, 42, b"xyz", &mut buf));
    assert_eq_test!(buf[0], 0, "type 0");
    assert_eq_test!(
        IcmpMessage::parse(&buf[..len]),
        Some(IcmpMessage::EchoReply {
            ident: 0x1111,
            seq: 42,
            data: &b"xyz"[..],
        })
    );
    pass!()
}

pub fn test_bad_checksum_rejected() -> TestResult {
    let mut buf = [0u8; 64];
    let len = assert_some!(write_echo_request(1, 1, b"data", &mut buf));
    buf[ICMP_HEADER_LEN] ^= 0x01;
    assert_test!(IcmpMessage::parse(&buf[..len]).is_none());
    assert_test!(IcmpMessage::parse(&buf[..4]).is_none());
    pass!()
}

pub fn test_port_unreachable_quotes_header_and_eight_bytes() -> TestResult {
    let original: Vec<u8> = (0..40u8).collect();
    let mut buf = [0u8; 128];
    let len = assert_some!(write_dest_unreachable(
        ICMP_CODE_PORT_UNREACHABLE,
        &original,
        20,
        &mut buf
    ));
    assert_eq_test!(len, ICMP_HEADER_LEN + 28);
    match IcmpMessage::parse(&buf[..len]) {
        Some(IcmpMessage::DestUnreachable { code, quoted }) => {
            assert_eq_test!(code, ICMP_CODE_PORT_UNREACHABLE);
            assert_eq_test!(quoted, &original[..28]);
        }
        other => return fail!("unexpected parse {:?}", other),
    }
    pass!()
}

pub fn test_ping_reply_reports_rtt() -> TestResult {
    let mut tracker = PingTracker::new();
    let seq = tracker.begin(PEER, 1000);
    assert_eq_test!(tracker.status(500, 1100), PingStatus::Waiting);
    assert_test!(tracker.on_echo_reply(PEER, PING_IDENTIFIER, seq, 1042));
    assert_eq_test!(tracker.status(500, 1050), PingStatus::Replied(42));
    assert_eq_test!(tracker.status(500, 1060), PingStatus::Idle);
    pass!()
}

pub fn test_ping_ignores_stray_replies() -> TestResult {
    let mut tracker = PingTracker::new();
    let seq = tracker.begin(PEER, 0);
    assert_test!(!tracker.on_echo_reply(PEER, 0x99, seq, 5), "foreign identifier");
    assert_test!(!tracker.on_echo_reply(PEER, PING_IDENTIFIER, seq.wrapping_add(1), 5));
    assert_test!(!tracker.on_echo_reply(Ipv4Addr::new(10, 0, 0, 3), PING_IDENTIFIER, seq, 5));
    assert_eq_test!(tracker.status(1000, 10), PingStatus::Waiting);
    pass!()
}

pub fn test_ping_timeout_and_sequence() -> TestResult {
    let mut tracker = PingTracker::new();
    let first = tracker.begin(PEER, 0);
    assert_eq_test!(tracker.status(1000, 999), PingStatus::Waiting);
    assert_eq_test!(tracker.status(1000, 1000), PingStatus::TimedOut);
    let second = tracker.begin(PEER, 2000);
    assert_eq_test!(second, first.wrapping_add(1));
    tracker.cancel();
    assert_eq_test!(tracker.status(1000, 2001), PingStatus::Idle);
    pass!()
}

slopnet_lib::define_test_suite!(
    icmp,
    [
        // Codec (4)
        test_echo_request_round_trip,
        test_echo_reply_mirrors_request,
        test_bad_checksum_rejected,
        test_port_unreachable_quotes_header_and_eight_bytes,
        // Ping tracker (3)
        test_ping_reply_reports_rtt,
        test_ping_ignores_stray_replies,
        test_ping_timeout_and_sequence,
    ]
);
