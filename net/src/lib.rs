//! IPv4 network stack for a single Ethernet interface.
//!
//! Protocol layers are sans-IO state machines ([`arp::ArpCache`],
//! [`reassembly::Reassembler`], [`tcp::TcpConnection`],
//! [`dhcp::DhcpClient`], [`llip::LinkLocalClient`], [`dns::DnsClient`], ...)
//! driven by [`stack::NetStack`], which owns the driver, the clock and the
//! random source and exposes the blocking application calls.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arp;
pub mod checksum;
pub mod config;
pub mod device;
pub mod dhcp;
pub mod dns;
pub mod ethernet;
pub mod event;
pub mod icmp;
pub mod ipv4;
pub mod llip;
pub mod ports;
pub mod reassembly;
pub mod stack;
pub mod tcp;
pub mod tcp_pool;
pub mod types;
pub mod udp;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod config_tests;
#[cfg(test)]
mod dns_tests;
#[cfg(test)]
mod icmp_tests;
#[cfg(test)]
mod tcp_tests;

pub use config::{Addressing, Layers, StackConfig, StackConfigBuilder};
pub use device::{Clock, Duplex, LinkSpeed, LinkStatus, NetDevice, RandomSource};
pub use event::{
    DnsServers, ErrorEvent, ErrorProvider, EventBus, NetworkEvent, SubscriberId, UdpDatagramEvent,
};
pub use stack::{IfaceConfig, NetStack};
pub use tcp::{TcpError, TcpState};
pub use tcp_pool::{ConnHandle, PoolHandler};
pub use types::{EtherType, IpProtocol, Ipv4Addr, MacAddr, NetError, Port, SockAddr};
