//! DNS wire format, the hostname cache and the resolver state machine.

use slopnet_lib::testing::TestResult;
use slopnet_lib::{assert_eq_test, assert_ok, assert_some, assert_test, pass};

use crate::dns::{
    DNS_HEADER_LEN, DNS_MAX_MESSAGE, DnsCache, DnsClient, DnsError, DnsHeader, DnsReply,
    DnsStatus, build_query, decode_name, encode_name, fnv1a_hash, parse_response,
};
use crate::event::DnsServers;
use crate::ports::DNS_PORT;
use crate::test_support::dns_answer;
use crate::types::{Ipv4Addr, Port, SockAddr};

const SERVER_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 53);
const SERVER_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 54);
const ADDR: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
const QUERY_PORT: Port = Port(50000);

fn query(id: u16, name: &str) -> Vec<u8> {
    let mut buf = [0u8; DNS_MAX_MESSAGE];
    let len = build_query(id, name.as_bytes(), &mut buf).unwrap();
    buf[..len].to_vec()
}

fn servers(list: &[Ipv4Addr]) -> DnsServers {
    let mut servers = DnsServers::EMPTY;
    for server in list {
        servers.push(*server);
    }
    servers
}

fn client_with(list: &[Ipv4Addr]) -> DnsClient {
    let mut client = DnsClient::new(20, 60);
    client.set_servers(servers(list));
    client
}

// =============================================================================
// Wire format
// =============================================================================

pub fn test_query_layout() -> TestResult {
    let msg = query(0xbeef, "example.com");
    let header = assert_some!(DnsHeader::from_bytes(&msg));
    assert_eq_test!(header.id, 0xbeef);
    assert_eq_test!(header.flags, 0x0100, "recursion desired");
    assert_eq_test!(header.qdcount, 1);
    assert_test!(!header.qr());
    assert_eq_test!(&msg[DNS_HEADER_LEN..DNS_HEADER_LEN + 13], b"\x07example\x03com\x00");
    assert_eq_test!(&msg[msg.len() - 4..], &[0, 1, 0, 1][..], "QTYPE A, QCLASS IN");
    assert_eq_test!(query(1, "example.com."), query(1, "example.com"));
    pass!()
}

pub fn test_invalid_names_rejected() -> TestResult {
    let mut buf = [0u8; DNS_MAX_MESSAGE];
    assert_test!(encode_name(b"a..b", &mut buf).is_none(), "empty label");
    let long_label = "x".repeat(64);
    assert_test!(encode_name(long_label.as_bytes(), &mut buf).is_none());
    let long_name = ["abcdefghi"; 26].join(".");
    assert_test!(encode_name(long_name.as_bytes(), &mut buf).is_none());
    assert_test!(encode_name(b"example.com", &mut buf[..5]).is_none(), "buffer too small");
    pass!()
}

pub fn test_decode_compressed_name() -> TestResult {
    let mut packet = vec![0u8; DNS_HEADER_LEN];
    packet.extend_from_slice(b"\x07example\x03com\x00");
    let www = packet.len();
    packet.extend_from_slice(b"\x03www\xc0\x0c");

    let mut out = [0u8; 64];
    let len = assert_some!(decode_name(&packet, www, &mut out));
    assert_eq_test!(&out[..len], b"www.example.com");
    let len = assert_some!(decode_name(&packet, DNS_HEADER_LEN, &mut out));
    assert_eq_test!(&out[..len], b"example.com");

    let looping = [0u8, 0, 0xc0, 0x02];
    assert_test!(decode_name(&looping, 2, &mut out).is_none(), "pointer loop");
    assert_test!(decode_name(&packet, www, &mut out[..5]).is_none(), "output too small");
    pass!()
}

pub fn test_parse_answers() -> TestResult {
    let q = query(7, "example.com");
    assert_eq_test!(
        parse_response(&dns_answer(&q, 0x8180, ADDR, 300), 7),
        Some(DnsReply::Address { addr: ADDR, ttl: 300 })
    );
    assert_eq_test!(
        parse_response(&dns_answer(&q, 0x8183, ADDR, 300), 7),
        Some(DnsReply::Failed(DnsError::ServerError(3)))
    );
    assert_eq_test!(
        parse_response(&dns_answer(&q, 0x8380, ADDR, 300), 7),
        Some(DnsReply::Failed(DnsError::Truncated))
    );
    assert_eq_test!(parse_response(&dns_answer(&q, 0x8180, ADDR, 300), 8), None, "id mismatch");
    assert_eq_test!(parse_response(&q, 7), None, "a query is not a response");

    let mut empty = q.clone();
    empty[2..4].copy_from_slice(&0x8180u16.to_be_bytes());
    assert_eq_test!(
        parse_response(&empty, 7),
        Some(DnsReply::Failed(DnsError::NoAddress))
    );
    pass!()
}

pub fn test_cname_then_address() -> TestResult {
    let mut msg = query(9, "www.example.com");
    msg[2..4].copy_from_slice(&0x8180u16.to_be_bytes());
    msg[6..8].copy_from_slice(&2u16.to_be_bytes());
    // CNAME pointing back at the question name
    msg.extend_from_slice(&[0xc0, 0x0c, 0, 5, 0, 1, 0, 0, 0, 60, 0, 2, 0xc0, 0x10]);
    msg.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
    msg.extend_from_slice(&ADDR.0);
    assert_eq_test!(
        parse_response(&msg, 9),
        Some(DnsReply::Address { addr: ADDR, ttl: 60 })
    );
    pass!()
}

// =============================================================================
// Cache
// =============================================================================

pub fn test_cache_ttl_floor_and_expiry() -> TestResult {
    let mut cache = DnsCache::new(4, 60);
    cache.insert(b"example.com", ADDR, 5, 1000);
    assert_eq_test!(cache.lookup(b"EXAMPLE.com", 1000 + 59_999), Some(ADDR));
    assert_eq_test!(cache.lookup(b"example.com", 1000 + 60_000), None);
    assert_test!(cache.is_empty(), "expired entry removed");
    pass!()
}

pub fn test_cache_lru_replacement() -> TestResult {
    let mut cache = DnsCache::new(2, 0);
    cache.insert(b"a.test", Ipv4Addr::new(1, 1, 1, 1), 600, 0);
    cache.insert(b"b.test", Ipv4Addr::new(2, 2, 2, 2), 600, 10);
    assert_test!(cache.lookup(b"a.test", 20).is_some());
    cache.insert(b"c.test", Ipv4Addr::new(3, 3, 3, 3), 600, 30);

    assert_eq_test!(cache.len(), 2);
    assert_eq_test!(cache.lookup(b"b.test", 40), None, "least recently used evicted");
    assert_test!(cache.lookup(b"a.test", 40).is_some());
    assert_test!(cache.lookup(b"c.test", 40).is_some());

    cache.flush();
    assert_test!(cache.is_empty());
    pass!()
}

pub fn test_cache_keeps_colliding_names_apart() -> TestResult {
    assert_eq_test!(fnv1a_hash(b"costarring"), fnv1a_hash(b"LIQUID"));
    let mut cache = DnsCache::new(4, 0);
    cache.insert(b"costarring", ADDR, 600, 0);
    assert_eq_test!(cache.lookup(b"liquid", 10), None);

    let other = Ipv4Addr::new(10, 9, 8, 7);
    cache.insert(b"liquid", other, 600, 20);
    assert_eq_test!(cache.len(), 2, "separate entries");
    assert_eq_test!(cache.lookup(b"Costarring", 30), Some(ADDR));
    assert_eq_test!(cache.lookup(b"liquid", 30), Some(other));
    pass!()
}

// =============================================================================
// Resolver
// =============================================================================

pub fn test_query_requires_server_and_valid_name() -> TestResult {
    let mut client = DnsClient::new(20, 60);
    assert_eq_test!(
        client.begin_query("example.com", 1, QUERY_PORT, 5000, 0),
        Err(DnsError::Unconfigured)
    );
    client.set_servers(servers(&[SERVER_A]));
    assert_eq_test!(
        client.begin_query("bad..name", 1, QUERY_PORT, 5000, 0),
        Err(DnsError::InvalidName)
    );
    assert_test!(!client.is_busy());
    pass!()
}

pub fn test_resolve_through_reply() -> TestResult {
    let mut client = client_with(&[SERVER_A]);
    assert_eq_test!(
        client.begin_query("example.com", 0x4242, QUERY_PORT, 5000, 0),
        Ok(SERVER_A)
    );
    assert_eq_test!(client.query_port(), Some(QUERY_PORT));
    let mut buf = [0u8; DNS_MAX_MESSAGE];
    let len = assert_some!(client.write_query(&mut buf));
    let sent = buf[..len].to_vec();

    let from_server = SockAddr::new(SERVER_A, DNS_PORT);
    assert_test!(!client.on_datagram(from_server, Port(1234), &sent, 10), "other port");
    assert_test!(client.on_datagram(
        SockAddr::new(SERVER_A, Port(5353)),
        QUERY_PORT,
        &dns_answer(&sent, 0x8180, ADDR, 300),
        10
    ));
    assert_eq_test!(client.poll(20), DnsStatus::Pending, "reply not from port 53");

    let mut wrong_id = dns_answer(&sent, 0x8180, ADDR, 300);
    wrong_id[0] ^= 0xff;
    client.on_datagram(from_server, QUERY_PORT, &wrong_id, 30);
    assert_eq_test!(client.poll(30), DnsStatus::Pending, "mismatched id ignored");

    client.on_datagram(from_server, QUERY_PORT, &dns_answer(&sent, 0x8180, ADDR, 300), 40);
    assert_eq_test!(
        client.poll(40),
        DnsStatus::Done {
            port: QUERY_PORT,
            result: Ok(ADDR),
        }
    );
    assert_eq_test!(client.poll(50), DnsStatus::Idle);
    assert_eq_test!(client.resolve_local("example.com", 50), Some(ADDR), "cached");
    pass!()
}

pub fn test_query_times_out() -> TestResult {
    let mut client = client_with(&[SERVER_A]);
    assert_ok!(client.begin_query("example.com", 1, QUERY_PORT, 5000, 0));
    assert_eq_test!(client.poll(4999), DnsStatus::Pending);
    assert_eq_test!(
        client.poll(5000),
        DnsStatus::Done {
            port: QUERY_PORT,
            result: Err(DnsError::Timeout),
        }
    );
    assert_test!(!client.is_busy());
    pass!()
}

pub fn test_resend_rotates_servers() -> TestResult {
    let mut client = client_with(&[SERVER_A, SERVER_B]);
    assert_ok!(client.begin_query("example.com", 1, QUERY_PORT, 6000, 0));
    assert_eq_test!(client.poll(2999), DnsStatus::Pending);
    assert_eq_test!(client.poll(3000), DnsStatus::Resend(SERVER_B));
    assert_eq_test!(client.poll(3001), DnsStatus::Pending);
    assert_test!(matches!(
        client.poll(6000),
        DnsStatus::Done {
            result: Err(DnsError::Timeout),
            ..
        }
    ));
    pass!()
}

pub fn test_resolve_local_and_cancel() -> TestResult {
    let mut client = client_with(&[SERVER_A]);
    assert_eq_test!(client.resolve_local("LocalHost", 0), Some(Ipv4Addr::LOCALHOST));
    assert_eq_test!(
        client.resolve_local("10.1.2.3", 0),
        Some(Ipv4Addr::new(10, 1, 2, 3))
    );
    assert_eq_test!(client.resolve_local("example.com", 0), None);

    assert_ok!(client.begin_query("example.com", 1, QUERY_PORT, 5000, 0));
    assert_eq_test!(client.cancel(), Some(QUERY_PORT));
    assert_eq_test!(client.cancel(), None);
    assert_eq_test!(client.poll(10), DnsStatus::Idle);
    pass!()
}

slopnet_lib::define_test_suite!(
    dns,
    [
        // Wire format (5)
        test_query_layout,
        test_invalid_names_rejected,
        test_decode_compressed_name,
        test_parse_answers,
        test_cname_then_address,
        // Cache (3)
        test_cache_ttl_floor_and_expiry,
        test_cache_lru_replacement,
        test_cache_keeps_colliding_names_apart,
        // Resolver (5)
        test_query_requires_server_and_valid_name,
        test_resolve_through_reply,
        test_query_times_out,
        test_resend_rotates_servers,
        test_resolve_local_and_cancel,
    ]
);
