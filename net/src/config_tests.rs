//! Configuration builder and validation.

use slopnet_lib::testing::TestResult;
use slopnet_lib::{assert_eq_test, assert_ok, assert_test, pass};

use crate::config::{Addressing, ArpParams, IpParams, Layers, StackConfig, TcpParams, UdpParams};
use crate::types::{Ipv4Addr, MacAddr, NetError};

const IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
const GW: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

pub fn test_defaults() -> TestResult {
    let config = assert_ok!(StackConfig::builder().build());
    assert_eq_test!(config.addressing, Addressing::Dhcp);
    assert_eq_test!(config.layers, Layers::all());
    assert_eq_test!(config.mac, None);
    assert_eq_test!(config.arp.cache_size, 10);
    assert_eq_test!(config.arp.retry_interval_ms(), 1000);
    assert_eq_test!(config.ip.mtu, 1500);
    assert_eq_test!(config.tcp.max_connections, 4);
    assert_eq_test!(config.tcp.mss, 1460);
    assert_eq_test!(config.dhcp.response_timeout_ms, 6000);
    assert_eq_test!(config.dns.cache_size, 20);
    pass!()
}

pub fn test_static_addressing() -> TestResult {
    let mac = MacAddr([0x02, 0, 0, 0, 0, 0x42]);
    let config = assert_ok!(
        StackConfig::builder()
            .mac(mac)
            .static_ipv4(IP, MASK, GW)
            .layers(Layers::ICMP)
            .dns_server(GW)
            .build()
    );
    assert_eq_test!(
        config.addressing,
        Addressing::Static {
            ip: IP,
            subnet_mask: MASK,
            gateway: GW,
        }
    );
    assert_eq_test!(config.mac, Some(mac));
    assert_test!(config.has(Layers::ICMP));
    assert_test!(!config.has(Layers::DHCP) && !config.has(Layers::DNS));
    assert_eq_test!(config.dns_servers, [Some(GW), None, None]);
    pass!()
}

pub fn test_dns_servers_capped_at_three() -> TestResult {
    let config = assert_ok!(
        StackConfig::builder()
            .dns_server(Ipv4Addr::new(1, 1, 1, 1))
            .dns_server(Ipv4Addr::new(8, 8, 8, 8))
            .dns_server(Ipv4Addr::new(9, 9, 9, 9))
            .dns_server(Ipv4Addr::new(4, 4, 4, 4))
            .build()
    );
    assert_eq_test!(config.dns_servers[2], Some(Ipv4Addr::new(9, 9, 9, 9)));
    pass!()
}

pub fn test_dhcp_requires_layer() -> TestResult {
    assert_eq_test!(
        StackConfig::builder().layers(Layers::ICMP).build().err(),
        Some(NetError::LayerDisabled)
    );
    let config = assert_ok!(StackConfig::builder().layers(Layers::ICMP).dhcp().build());
    assert_test!(config.has(Layers::DHCP), "dhcp() enables the layer");
    pass!()
}

pub fn test_rejects_bad_sizes() -> TestResult {
    let base = || StackConfig::builder().static_ipv4(IP, MASK, GW);

    let zero_arp = ArpParams {
        cache_size: 0,
        ..ArpParams::default()
    };
    assert_eq_test!(base().arp(zero_arp).build().err(), Some(NetError::InvalidArgument));

    let zero_udp = UdpParams { max_bindings: 0 };
    assert_eq_test!(base().udp(zero_udp).build().err(), Some(NetError::InvalidArgument));

    let zero_tcp = TcpParams {
        max_connections: 0,
        ..TcpParams::default()
    };
    assert_eq_test!(base().tcp(zero_tcp).build().err(), Some(NetError::InvalidArgument));

    for mtu in [575u16, 1501] {
        let ip = IpParams {
            mtu,
            ..IpParams::default()
        };
        assert_eq_test!(base().ip(ip).build().err(), Some(NetError::InvalidArgument));
    }
    pass!()
}

pub fn test_mss_must_fit_mtu() -> TestResult {
    let ip = IpParams {
        mtu: 576,
        ..IpParams::default()
    };
    let tcp = TcpParams {
        mss: 536,
        ..TcpParams::default()
    };
    assert_ok!(StackConfig::builder().ip(ip).tcp(tcp).build());

    let tcp = TcpParams {
        mss: 537,
        ..TcpParams::default()
    };
    assert_eq_test!(
        StackConfig::builder().ip(ip).tcp(tcp).build().err(),
        Some(NetError::InvalidArgument)
    );
    assert_eq_test!(
        StackConfig::builder().ip(ip).build().err(),
        Some(NetError::InvalidArgument),
        "default MSS exceeds a 576-byte MTU"
    );
    pass!()
}

slopnet_lib::define_test_suite!(
    config,
    [
        test_defaults,
        test_static_addressing,
        test_dns_servers_capped_at_three,
        test_dhcp_requires_layer,
        test_rejects_bad_sizes,
        test_mss_must_fit_mtu,
    ]
);
