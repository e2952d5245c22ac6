//! Fixed-capacity TCP connection pool.
//!
//! Each slot owns at most one [`TcpConnection`].  A slot whose connection has
//! reached CLOSED still counts as free: the next `connect` or accepted SYN
//! reclaims it and bumps the slot generation, so a stale [`ConnHandle`] to
//! the old connection stops resolving instead of aliasing the new one.
//!
//! Every state transition is recorded as a [`StateChange`], including each
//! hop when one segment moves a connection twice; the stack drains them
//! after releasing its lock and publishes them on the event bus.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use slopnet_lib::{klog_debug, klog_warn};

use crate::config::TcpParams;
use crate::tcp::{
    TcpConnection, TcpError, TcpOutSegment, TcpSegment, TcpState, TcpTuple, build_rst_for,
};
use crate::types::{Ipv4Addr, NetError, Port};

/// Reference to a pooled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    slot: u8,
    generation: u16,
}

impl ConnHandle {
    pub const fn slot(&self) -> usize {
        self.slot as usize
    }

    pub const fn generation(&self) -> u16 {
        self.generation
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp#{}.{}", self.slot, self.generation)
    }
}

/// One recorded state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub conn: ConnHandle,
    pub local_port: Port,
    /// Accepted from a listening port rather than opened with `connect`.
    pub passive: bool,
    pub old: TcpState,
    pub new: TcpState,
    /// Set when `new` is CLOSED because something went wrong.
    pub error: Option<TcpError>,
}

/// Callbacks for [`ConnectionPool::service`].  Every method has an empty
/// default.  Handlers run with the pool borrowed and must not block.
pub trait PoolHandler {
    /// A passive connection completed its handshake.
    fn on_accepted(&mut self, _conn: ConnHandle, _tcp: &mut TcpConnection) {}

    /// Received data is waiting.
    fn on_readable(&mut self, _conn: ConnHandle, _tcp: &mut TcpConnection) {}

    /// The send ring has room.
    fn on_writable(&mut self, _conn: ConnHandle, _tcp: &mut TcpConnection) {}

    /// The connection reached CLOSED.  Called once per connection.
    fn on_closed(&mut self, _conn: ConnHandle, _error: Option<TcpError>) {}

    /// Called for every live connection on every pass.
    fn on_poll(&mut self, _conn: ConnHandle, _tcp: &mut TcpConnection) {}
}

struct Slot {
    generation: u16,
    conn: Option<TcpConnection>,
    closed_reported: bool,
    accepted_reported: bool,
}

impl Slot {
    fn is_free(&self) -> bool {
        self.conn
            .as_ref()
            .is_none_or(|c| c.state() == TcpState::Closed)
    }
}

pub struct ConnectionPool {
    slots: Vec<Slot>,
    listeners: Vec<Port>,
    params: TcpParams,
    changes: Vec<StateChange>,
    next_service: usize,
}

impl ConnectionPool {
    pub fn new(params: TcpParams) -> Self {
        let capacity = params.max_connections.min(u8::MAX as usize);
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                generation: 0,
                conn: None,
                closed_reported: true,
                accepted_reported: true,
            });
        }
        Self {
            slots,
            listeners: Vec::new(),
            params,
            changes: Vec::new(),
            next_service: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Connections not yet CLOSED.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    fn handle_of(&self, idx: usize) -> ConnHandle {
        ConnHandle {
            slot: idx as u8,
            generation: self.slots[idx].generation,
        }
    }

    /// Claim a free slot for `conn`.  The caller has checked capacity.
    fn install(&mut self, conn: TcpConnection) -> Result<usize, NetError> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.conn.is_none())
            .or_else(|| {
                self.slots
                    .iter()
                    .position(|s| s.is_free() && s.closed_reported)
            })
            .or_else(|| self.slots.iter().position(Slot::is_free))
            .ok_or(NetError::PoolExhausted)?;
        let slot = &mut self.slots[idx];
        slot.generation = slot.generation.wrapping_add(1);
        slot.closed_reported = false;
        slot.accepted_reported = !conn.is_passive();
        slot.conn = Some(conn);
        Ok(idx)
    }

    /// Move the transitions logged by the connection in slot `idx` into
    /// the change list, one entry per hop.
    fn record(&mut self, idx: usize) {
        let handle = self.handle_of(idx);
        let Some(conn) = self.slots[idx].conn.as_mut() else {
            return;
        };
        let local_port = conn.tuple().local_port;
        let passive = conn.is_passive();
        let error = conn.error();
        for (old, new) in conn.take_transitions() {
            self.changes.push(StateChange {
                conn: handle,
                local_port,
                passive,
                old,
                new,
                error: if new == TcpState::Closed { error } else { None },
            });
        }
    }

    /// Run `f` on the connection in slot `idx`, recording its transitions.
    fn track<R>(&mut self, idx: usize, f: impl FnOnce(&mut TcpConnection) -> R) -> Option<R> {
        let result = f(self.slots.get_mut(idx)?.conn.as_mut()?);
        self.record(idx);
        Some(result)
    }

    // --- Lifecycle ----------------------------------------------------------

    /// Active open.  The SYN goes out on the next output pass.
    pub fn connect(
        &mut self,
        tuple: TcpTuple,
        iss: u32,
        now_ms: u32,
    ) -> Result<ConnHandle, NetError> {
        if self.live_count() >= self.capacity() {
            klog_warn!("tcp: pool exhausted ({} connections)", self.capacity());
            return Err(NetError::PoolExhausted);
        }
        let idx = self.install(TcpConnection::connect(tuple, iss, now_ms, self.params))?;
        self.record(idx);
        Ok(self.handle_of(idx))
    }

    pub fn listen(&mut self, port: Port) -> Result<(), NetError> {
        if self.listeners.contains(&port) {
            return Err(NetError::PortInUse);
        }
        if self.listeners.len() >= self.params.max_listeners {
            return Err(NetError::ResourceExhausted);
        }
        klog_debug!("tcp: LISTEN on port {}", port);
        self.listeners.push(port);
        Ok(())
    }

    pub fn unlisten(&mut self, port: Port) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|p| *p != port);
        before != self.listeners.len()
    }

    pub fn is_listening(&self, port: Port) -> bool {
        self.listeners.contains(&port)
    }

    fn slot_index(&self, handle: ConnHandle) -> Result<usize, NetError> {
        let idx = handle.slot();
        match self.slots.get(idx) {
            Some(slot) if slot.generation == handle.generation && slot.conn.is_some() => Ok(idx),
            _ => Err(NetError::NotConnected),
        }
    }

    pub fn get(&self, handle: ConnHandle) -> Result<&TcpConnection, NetError> {
        let idx = self.slot_index(handle)?;
        self.slots[idx].conn.as_ref().ok_or(NetError::NotConnected)
    }

    /// Run `f` on a connection by handle, recording any state change.
    pub fn with<R>(
        &mut self,
        handle: ConnHandle,
        f: impl FnOnce(&mut TcpConnection) -> R,
    ) -> Result<R, NetError> {
        let idx = self.slot_index(handle)?;
        self.track(idx, f).ok_or(NetError::NotConnected)
    }

    pub fn close(&mut self, handle: ConnHandle) -> Result<(), NetError> {
        self.with(handle, |c| c.close())?.map_err(NetError::from)
    }

    pub fn abort(&mut self, handle: ConnHandle) -> Result<Option<TcpOutSegment>, NetError> {
        self.with(handle, |c| c.abort())?.map_err(NetError::from)
    }

    // --- Input and timers ---------------------------------------------------

    fn find(&self, tuple: &TcpTuple) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.conn
                .as_ref()
                .is_some_and(|c| c.state() != TcpState::Closed && c.tuple() == *tuple)
        })
    }

    /// Dispatch an inbound segment.  Returns a segment to send immediately
    /// (an RST); ACKs and data come out of the output pass.
    pub fn on_segment(
        &mut self,
        local_ip: Ipv4Addr,
        remote_ip: Ipv4Addr,
        seg: &TcpSegment<'_>,
        now_ms: u32,
        isn: impl FnOnce() -> u32,
    ) -> Option<TcpOutSegment> {
        let hdr = &seg.header;
        let tuple = TcpTuple {
            local_ip,
            local_port: Port(hdr.dst_port),
            remote_ip,
            remote_port: Port(hdr.src_port),
        };

        if let Some(idx) = self.find(&tuple) {
            return self.track(idx, |c| c.on_segment(seg, now_ms)).flatten();
        }

        if hdr.is_rst() {
            return None;
        }

        if hdr.is_syn() && !hdr.is_ack() && self.is_listening(tuple.local_port) {
            if self.live_count() >= self.capacity() {
                klog_debug!("tcp: SYN to {} dropped, pool full", tuple.local_port);
                return None;
            }
            let conn = TcpConnection::accept(tuple, seg, isn(), now_ms, self.params);
            let idx = self.install(conn).ok()?;
            self.record(idx);
            return None;
        }

        klog_debug!("tcp: no connection for {}, sending RST", tuple);
        Some(build_rst_for(seg, local_ip, remote_ip))
    }

    /// Run every connection's timers.  Returns RSTs to transmit.
    pub fn on_timer(&mut self, now_ms: u32) -> Vec<TcpOutSegment> {
        let mut resets = Vec::new();
        for idx in 0..self.slots.len() {
            if let Some(Some(rst)) = self.track(idx, |c| c.on_timer(now_ms)) {
                resets.push(rst);
            }
        }
        resets
    }

    // --- Output -------------------------------------------------------------

    pub fn next_segment(&mut self, idx: usize) -> Option<TcpOutSegment> {
        self.slots.get_mut(idx)?.conn.as_mut()?.next_segment()
    }

    pub fn commit(&mut self, idx: usize, seg: &TcpOutSegment, now_ms: u32) {
        if let Some(conn) = self.slots.get_mut(idx).and_then(|s| s.conn.as_mut()) {
            conn.commit(seg, now_ms);
        }
    }

    pub fn copy_payload(&self, idx: usize, seg: &TcpOutSegment, out: &mut [u8]) -> usize {
        self.slots
            .get(idx)
            .and_then(|s| s.conn.as_ref())
            .map_or(0, |c| c.copy_payload(seg, out))
    }

    /// Take the state changes recorded since the last call.
    pub fn drain_changes(&mut self) -> Vec<StateChange> {
        core::mem::take(&mut self.changes)
    }

    // --- Service loop -------------------------------------------------------

    /// Visit every connection once, starting one slot further along each
    /// call, and report its readiness to `handler`.  Never blocks.
    pub fn service<H: PoolHandler + ?Sized>(&mut self, handler: &mut H) {
        let count = self.slots.len();
        if count == 0 {
            return;
        }
        let start = self.next_service % count;
        self.next_service = (start + 1) % count;

        for step in 0..count {
            let idx = (start + step) % count;
            let handle = self.handle_of(idx);
            let slot = &mut self.slots[idx];
            let Some(conn) = slot.conn.as_ref() else {
                continue;
            };

            if conn.state() == TcpState::Closed {
                if !slot.closed_reported {
                    slot.closed_reported = true;
                    handler.on_closed(handle, conn.error());
                }
                continue;
            }

            if !slot.accepted_reported && conn.state().is_open() {
                slot.accepted_reported = true;
                self.track(idx, |c| handler.on_accepted(handle, c));
            }
            if self.slots[idx].conn.as_ref().is_some_and(|c| c.available() > 0) {
                self.track(idx, |c| handler.on_readable(handle, c));
            }
            if self.slots[idx]
                .conn
                .as_ref()
                .is_some_and(|c| c.can_send() && c.send_space() > 0)
            {
                self.track(idx, |c| handler.on_writable(handle, c));
            }
            self.track(idx, |c| handler.on_poll(handle, c));
        }
    }
}
