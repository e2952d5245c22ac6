//! IPv4 fragment reassembly.
//!
//! Partial datagrams are keyed by (source, destination, identification,
//! protocol).  A datagram is released only once every byte from offset zero
//! up to the end marked by the last fragment (MF clear) has arrived.
//! Partials older than `reassembly_timeout_ms` are discarded, and both the
//! number of partials and the bytes they hold are capped.

extern crate alloc;

use alloc::vec::Vec;

use slopnet_lib::klog_debug;

use crate::config::IpParams;
use crate::device::has_elapsed;
use crate::ipv4::{IpDrop, IpPacketView, Ipv4Header};
use crate::types::Ipv4Addr;

/// Disjoint received ranges kept per partial datagram.
const MAX_RANGES: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    identification: u16,
    protocol: u8,
}

impl FragmentKey {
    fn of(header: &Ipv4Header) -> Self {
        Self {
            src: header.src,
            dst: header.dst,
            identification: header.identification,
            protocol: header.protocol,
        }
    }
}

struct Partial {
    key: FragmentKey,
    /// Header of the first fragment (offset zero) once seen.
    first_header: Option<Ipv4Header>,
    data: Vec<u8>,
    /// Sorted, merged `[start, end)` ranges already received.
    ranges: Vec<(usize, usize)>,
    /// Payload length, known once the last fragment has arrived.
    total_len: Option<usize>,
    started_ms: u32,
}

impl Partial {
    fn add_range(&mut self, start: usize, end: usize) -> bool {
        self.ranges.push((start, end));
        self.ranges.sort_unstable_by_key(|r| r.0);
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
        self.ranges.len() <= MAX_RANGES
    }

    fn is_complete(&self) -> bool {
        match self.total_len {
            Some(total) => self.ranges.len() == 1 && self.ranges[0] == (0, total),
            None => false,
        }
    }
}

pub struct Reassembler {
    partials: Vec<Partial>,
    params: IpParams,
}

impl Reassembler {
    pub fn new(params: IpParams) -> Self {
        Self {
            partials: Vec::with_capacity(params.max_reassembly_packets),
            params,
        }
    }

    pub fn in_progress(&self) -> usize {
        self.partials.len()
    }

    fn bytes_held(&self) -> usize {
        self.partials.iter().map(|p| p.data.len()).sum()
    }

    /// Add one fragment.  Returns the rebuilt header and payload when this
    /// fragment completes its datagram.
    pub fn insert(
        &mut self,
        packet: &IpPacketView<'_>,
        now_ms: u32,
    ) -> Result<Option<(Ipv4Header, Vec<u8>)>, IpDrop> {
        let header = packet.header;
        let key = FragmentKey::of(&header);
        let start = header.fragment_offset();
        let end = start + packet.payload.len();
        if end > self.params.max_datagram_len {
            return Err(IpDrop::Fragment);
        }

        let idx = match self.partials.iter().position(|p| p.key == key) {
            Some(i) => i,
            None => {
                if self.partials.len() >= self.params.max_reassembly_packets {
                    klog_debug!("reassembly: too many partial datagrams");
                    return Err(IpDrop::Fragment);
                }
                self.partials.push(Partial {
                    key,
                    first_header: None,
                    data: Vec::new(),
                    ranges: Vec::new(),
                    total_len: None,
                    started_ms: now_ms,
                });
                self.partials.len() - 1
            }
        };

        let growth = end.saturating_sub(self.partials[idx].data.len());
        if self.bytes_held() + growth > self.params.max_reassembly_bytes {
            klog_debug!("reassembly: memory limit, dropping datagram {}", key.identification);
            self.partials.swap_remove(idx);
            return Err(IpDrop::Fragment);
        }

        let partial = &mut self.partials[idx];
        if partial.data.len() < end {
            partial.data.resize(end, 0);
        }
        partial.data[start..end].copy_from_slice(packet.payload);
        if start == 0 {
            partial.first_header = Some(header);
        }
        if !header.more_fragments() {
            partial.total_len = Some(end);
        }
        if !partial.add_range(start, end) {
            self.partials.swap_remove(idx);
            return Err(IpDrop::Fragment);
        }

        if !partial.is_complete() {
            return Ok(None);
        }

        let done = self.partials.swap_remove(idx);
        let total = done.total_len.unwrap_or(done.data.len());
        let mut rebuilt = done.first_header.unwrap_or(header);
        rebuilt.flags_fragment = 0;
        rebuilt.total_len = (rebuilt.header_len as usize + total) as u16;
        let mut data = done.data;
        data.truncate(total);
        klog_debug!(
            "reassembly: datagram {} from {} complete ({} bytes)",
            key.identification,
            key.src,
            total
        );
        Ok(Some((rebuilt, data)))
    }

    /// Drop partials older than the timeout.  Returns how many were dropped.
    pub fn expire(&mut self, now_ms: u32) -> usize {
        let timeout = self.params.reassembly_timeout_ms;
        let before = self.partials.len();
        self.partials
            .retain(|p| !has_elapsed(p.started_ms, timeout, now_ms));
        before - self.partials.len()
    }
}
