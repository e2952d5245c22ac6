//! Notification and error bus.
//!
//! Two independent channels: **notifications** ([`NetworkEvent`]) for
//! informational state changes and **errors** ([`ErrorEvent`]) for
//! `(provider, code, cause)` triples.  Dispatch is synchronous and nothing is
//! queued: a subscriber added after an event fires never sees it.
//!
//! # Concurrency
//!
//! Events may be published from the frame-receive interrupt or from the main
//! loop, so subscribers must be short and must not block.  The subscriber
//! lists are snapshotted under an [`IrqMutex`] and the lock is dropped before
//! any handler runs; a handler may therefore call back into the stack,
//! including subscribing or publishing.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use slopnet_lib::{IrqMutex, klog_debug, klog_warn};

use crate::device::LinkStatus;
use crate::tcp::TcpState;
use crate::tcp_pool::ConnHandle;
use crate::types::{Ipv4Addr, NetError, SockAddr};

/// Subscribers per channel.
pub const MAX_SUBSCRIBERS: usize = 8;

// =============================================================================
// Event payloads
// =============================================================================

/// Up to three DNS servers, in preference order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DnsServers {
    servers: [Ipv4Addr; 3],
    count: u8,
}

impl DnsServers {
    pub const EMPTY: Self = Self {
        servers: [Ipv4Addr::UNSPECIFIED; 3],
        count: 0,
    };

    /// Append a server.  Unspecified addresses and a fourth server are ignored.
    pub fn push(&mut self, server: Ipv4Addr) {
        if server.is_valid() && (self.count as usize) < self.servers.len() {
            self.servers[self.count as usize] = server;
            self.count += 1;
        }
    }

    pub fn as_slice(&self) -> &[Ipv4Addr] {
        &self.servers[..self.count as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }
}

/// An inbound datagram on a port bound in event mode.
///
/// A subscriber that consumes the datagram calls [`set_handled`]; if nobody
/// does, the stack answers with ICMP port unreachable.
///
/// [`set_handled`]: UdpDatagramEvent::set_handled
pub struct UdpDatagramEvent<'a> {
    pub src: SockAddr,
    pub dst: SockAddr,
    pub payload: &'a [u8],
    handled: Cell<bool>,
}

impl<'a> UdpDatagramEvent<'a> {
    pub fn new(src: SockAddr, dst: SockAddr, payload: &'a [u8]) -> Self {
        Self {
            src,
            dst,
            payload,
            handled: Cell::new(false),
        }
    }

    pub fn set_handled(&self) {
        self.handled.set(true);
    }

    pub fn is_handled(&self) -> bool {
        self.handled.get()
    }
}

impl fmt::Debug for UdpDatagramEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UdpDatagram({} -> {}, {} bytes)",
            self.src,
            self.dst,
            self.payload.len()
        )
    }
}

/// Informational notification.
#[derive(Debug)]
pub enum NetworkEvent<'a> {
    IpAddressAnnounced(Ipv4Addr),
    SubnetMaskAnnounced(Ipv4Addr),
    DefaultGatewayAnnounced(Ipv4Addr),
    DnsServersAnnounced(DnsServers),
    /// The DHCP client entered RENEWING; connectivity may blip.
    DhcpRenewalDue { lease_secs: u32 },
    /// The lease ran out without renewal; the interface is unconfigured.
    DhcpLeaseExpired,
    TcpStateChanged {
        conn: ConnHandle,
        old: TcpState,
        new: TcpState,
    },
    LinkChanged(LinkStatus),
    UdpDatagram(UdpDatagramEvent<'a>),
}

/// Layer that raised an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorProvider {
    Link,
    Arp,
    Ip,
    Icmp,
    Udp,
    Tcp,
    Dhcp,
    Dns,
    LinkLocal,
}

/// Error notification.  `code` is [`NetError::code`]; `cause` carries an
/// extra value such as a connection slot or DNS rcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorEvent {
    pub provider: ErrorProvider,
    pub code: u16,
    pub cause: u32,
}

impl ErrorEvent {
    pub fn new(provider: ErrorProvider, error: NetError, cause: u32) -> Self {
        Self {
            provider,
            code: error.code(),
            cause,
        }
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Handle returned by the `subscribe_*` calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u32);

type NotificationFn = dyn for<'a> Fn(&NetworkEvent<'a>) + Send + Sync;
type ErrorFn = dyn Fn(&ErrorEvent) + Send + Sync;

struct Channel<F: ?Sized> {
    subscribers: IrqMutex<Vec<(SubscriberId, Arc<F>)>>,
}

impl<F: ?Sized> Channel<F> {
    const fn new() -> Self {
        Self {
            subscribers: IrqMutex::new(Vec::new()),
        }
    }

    fn add(&self, id: SubscriberId, handler: Arc<F>) -> Result<SubscriberId, NetError> {
        let mut subs = self.subscribers.lock();
        if subs.len() >= MAX_SUBSCRIBERS {
            return Err(NetError::ResourceExhausted);
        }
        subs.push((id, handler));
        Ok(id)
    }

    fn remove(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// Copy the handler list so no lock is held while handlers run.
    fn snapshot(&self) -> [Option<Arc<F>>; MAX_SUBSCRIBERS] {
        let subs = self.subscribers.lock();
        core::array::from_fn(|i| subs.get(i).map(|(_, h)| Arc::clone(h)))
    }

    fn len(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Synchronous publish/subscribe bus shared by every layer.
pub struct EventBus {
    notifications: Channel<NotificationFn>,
    errors: Channel<ErrorFn>,
    next_id: AtomicU32,
}

impl EventBus {
    pub const fn new() -> Self {
        Self {
            notifications: Channel::new(),
            errors: Channel::new(),
            next_id: AtomicU32::new(1),
        }
    }

    fn alloc_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe_notifications<F>(&self, handler: F) -> Result<SubscriberId, NetError>
    where
        F: for<'a> Fn(&NetworkEvent<'a>) + Send + Sync + 'static,
    {
        let handler: Box<NotificationFn> = Box::new(handler);
        self.notifications.add(self.alloc_id(), Arc::from(handler))
    }

    pub fn subscribe_errors<F>(&self, handler: F) -> Result<SubscriberId, NetError>
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        let handler: Box<ErrorFn> = Box::new(handler);
        self.errors.add(self.alloc_id(), Arc::from(handler))
    }

    /// Remove a subscriber from whichever channel holds it.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.notifications.remove(id) || self.errors.remove(id)
    }

    pub fn notification_subscribers(&self) -> usize {
        self.notifications.len()
    }

    /// Deliver `event` to every notification subscriber in insertion order.
    pub fn publish(&self, event: &NetworkEvent<'_>) {
        klog_debug!("event: {:?}", event);
        for handler in self.notifications.snapshot().iter().flatten() {
            handler(event);
        }
    }

    /// Deliver `error` to every error subscriber in insertion order.
    pub fn publish_error(&self, error: ErrorEvent) {
        klog_warn!(
            "event: error from {:?} code={:#06x} cause={}",
            error.provider,
            error.code,
            error.cause
        );
        for handler in self.errors.snapshot().iter().flatten() {
            handler(&error);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// An event raised while stack state was locked, published once the lock is
/// released.
#[derive(Debug)]
pub enum Deferred {
    Notify(NetworkEvent<'static>),
    Error(ErrorEvent),
}

impl EventBus {
    pub fn publish_deferred(&self, events: Vec<Deferred>) {
        for event in events {
            match event {
                Deferred::Notify(ev) => self.publish(&ev),
                Deferred::Error(err) => self.publish_error(err),
            }
        }
    }
}
