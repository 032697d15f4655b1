//! Per-(peer, channel) reassembly: arriving packets are sorted into a queue by packet id, and
//!  every insertion checks whether the new packet completes a contiguous run from a
//!  START_OF_MESSAGE packet to an END_OF_MESSAGE packet. Such a run is recorded as a
//!  [`MessageSpan`]; packets that are not (yet) part of a complete run stay in the queue without
//!  a span.
//!
//! A [`ReceiveWindow`] tracks which packet ids were delivered to the application (or given up
//!  on). It serves two purposes: retransmitted duplicates are recognized and dropped, and an
//!  IN_ORDER message becomes available only once every packet before its first one is done.
//!  Messages without IN_ORDER are available as soon as they are complete, provided the window
//!  can record their ids as delivered. Otherwise they wait until the window catches up.
//!
//! Ids are given up on only by [`Channel::evict_stale`], never because later ids were delivered.

use crate::buffers::list::List;
use crate::buffers::slab::{Slab, SlabHandle};
use crate::packet::{ChannelId, Packet, PacketFlags, PacketHeader, PacketId};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// sequence number comparison that is robust against wrap-around
fn seq_lt(a: PacketId, b: PacketId) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

const WINDOW_BITS: u16 = u128::BITS as u16;

/// Tracks delivered packet ids: everything before `base` is delivered or skipped, and bit `i`
///  of `delivered` stands for `base + i`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveWindow {
    base: PacketId,
    delivered: u128,
}

impl ReceiveWindow {
    pub fn starting_at(base: PacketId) -> ReceiveWindow {
        ReceiveWindow {
            base,
            delivered: 0,
        }
    }

    pub fn base(&self) -> PacketId {
        self.base
    }

    fn offset(&self, id: PacketId) -> u16 {
        id.wrapping_sub(self.base)
    }

    pub fn is_behind(&self, id: PacketId) -> bool {
        seq_lt(id, self.base)
    }

    pub fn is_delivered(&self, id: PacketId) -> bool {
        if self.is_behind(id) {
            return true;
        }
        let offset = self.offset(id);
        offset < WINDOW_BITS && self.delivered & (1u128 << offset) != 0
    }

    /// `true` if delivery of `id` can be recorded without giving up on earlier ids
    pub fn covers(&self, id: PacketId) -> bool {
        self.is_behind(id) || self.offset(id) < WINDOW_BITS
    }

    /// NB: ids beyond the window are not recorded, so callers deliver only ids it [covers](Self::covers)
    pub fn mark_delivered(&mut self, id: PacketId) {
        if self.is_behind(id) {
            return;
        }
        let offset = self.offset(id);
        if offset >= WINDOW_BITS {
            debug_assert!(false, "packet id {} is beyond the receive window at {}", id, self.base);
            return;
        }
        self.delivered |= 1u128 << offset;
        self.advance();
    }

    /// Give up on all ids before `id`
    pub fn skip_to(&mut self, id: PacketId) {
        if self.is_behind(id) {
            return;
        }
        let offset = self.offset(id);
        if offset == 0 {
            return;
        }
        if offset >= WINDOW_BITS {
            self.delivered = 0;
        }
        else {
            self.delivered >>= offset;
        }
        self.base = id;
        self.advance();
    }

    fn advance(&mut self) {
        let n = self.delivered.trailing_ones();
        if n == u128::BITS {
            self.delivered = 0;
        }
        else {
            self.delivered >>= n;
        }
        self.base = self.base.wrapping_add(n as u16);
    }
}

/// A detected, complete message: the run of queued packets from `first` to `last`
#[derive(Debug, Default)]
pub struct MessageSpan {
    first: SlabHandle,
    last: SlabHandle,
    first_id: PacketId,
    last_id: PacketId,
    in_order: bool,
    is_available: bool,
    len: usize,
    detected_at: Option<Instant>,
}

impl MessageSpan {
    pub fn first_id(&self) -> PacketId {
        self.first_id
    }

    pub fn last_id(&self) -> PacketId {
        self.last_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_available(&self) -> bool {
        self.is_available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Queued,
    /// already queued, delivered or skipped - the packet was not taken over
    Duplicate,
    /// the packet completed a message, but there is no span capacity left to record it. The
    ///  packet was not taken over so it can be retransmitted later.
    NoSpanCapacity,
}

pub struct Channel {
    channel_id: ChannelId,
    packets: List<Packet>,
    messages: List<MessageSpan>,
    window: ReceiveWindow,
    /// set while the channel is registered in its peer's ready queue
    pub(crate) is_ready_queued: bool,
}

impl Channel {
    pub fn new(channel_id: ChannelId) -> Channel {
        Channel {
            channel_id,
            packets: List::new(),
            messages: List::new(),
            window: ReceiveWindow::default(),
            is_ready_queued: false,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn window(&self) -> &ReceiveWindow {
        &self.window
    }

    pub fn num_queued_packets(&self) -> usize {
        self.packets.len()
    }

    pub fn num_pending_messages(&self) -> usize {
        self.messages.len()
    }

    fn header_of(packets: &Slab<Packet>, handle: SlabHandle) -> Option<PacketHeader> {
        packets.get(handle).map(|p| p.header())
    }

    /// Take over a received packet: sort it into the queue and run message detection. If the
    ///  outcome is anything but [`InsertOutcome::Queued`], the caller still owns the packet.
    pub fn insert(&mut self, packets: &mut Slab<Packet>, spans: &mut Slab<MessageSpan>, handle: SlabHandle, now: Instant) -> InsertOutcome {
        let Some(header) = Self::header_of(packets, handle) else {
            return InsertOutcome::Duplicate;
        };
        let id = header.packet_id;

        if self.window.is_delivered(id) {
            trace!("channel {}: packet {} was delivered already", self.channel_id, id);
            return InsertOutcome::Duplicate;
        }

        if !self.insert_sorted(packets, handle, id) {
            trace!("channel {}: packet {} is queued already", self.channel_id, id);
            return InsertOutcome::Duplicate;
        }
        if let Some(p) = packets.get_mut(handle) {
            p.timestamp = Some(now);
        }

        let Some((first, last)) = self.detect_message(packets, handle, header.flags) else {
            return InsertOutcome::Queued;
        };

        let Some(span) = spans.secure() else {
            debug!("channel {}: no capacity for another pending message - dropping packet {}", self.channel_id, id);
            self.packets.remove(packets, handle);
            return InsertOutcome::NoSpanCapacity;
        };

        let (first_id, first_flags) = match Self::header_of(packets, first) {
            Some(h) => (h.packet_id, h.flags),
            None => (id, header.flags),
        };
        let last_id = Self::header_of(packets, last)
            .map(|h| h.packet_id)
            .unwrap_or(id);
        let len = self.payload_len(packets, first, last);

        if let Some(s) = spans.get_mut(span) {
            *s = MessageSpan {
                first,
                last,
                first_id,
                last_id,
                in_order: first_flags.contains(PacketFlags::IN_ORDER),
                is_available: false,
                len,
                detected_at: Some(now),
            };
        }
        trace!("channel {}: detected message {}..={} ({} bytes)", self.channel_id, first_id, last_id, len);

        self.insert_span_sorted(spans, span, first_id);
        self.refresh_availability(spans);
        InsertOutcome::Queued
    }

    /// scan backward from the tail - arrival is mostly in order
    fn insert_sorted(&mut self, packets: &mut Slab<Packet>, handle: SlabHandle, id: PacketId) -> bool {
        let mut cursor = self.packets.peek_end();
        while let Some(c) = cursor {
            let Some(cid) = Self::header_of(packets, c).map(|h| h.packet_id) else {
                break;
            };
            if cid == id {
                return false;
            }
            if seq_lt(cid, id) {
                return self.packets.push_after(packets, c, handle);
            }
            cursor = self.packets.prev(packets, c);
        }
        self.packets.push_front(packets, handle)
    }

    fn insert_span_sorted(&mut self, spans: &mut Slab<MessageSpan>, span: SlabHandle, first_id: PacketId) {
        let mut cursor = self.messages.peek_end();
        while let Some(c) = cursor {
            if spans.get(c).map(|s| seq_lt(s.first_id, first_id)).unwrap_or(false) {
                self.messages.push_after(spans, c, span);
                return;
            }
            cursor = self.messages.prev(spans, c);
        }
        self.messages.push_front(spans, span);
    }

    fn detect_message(&self, packets: &Slab<Packet>, handle: SlabHandle, flags: PacketFlags) -> Option<(SlabHandle, SlabHandle)> {
        let is_start = flags.contains(PacketFlags::START_OF_MESSAGE);
        let is_end = flags.contains(PacketFlags::END_OF_MESSAGE);

        match (is_start, is_end) {
            (true, true) => Some((handle, handle)),
            (true, false) => self.find_message_end(packets, handle).map(|last| (handle, last)),
            (false, true) => self.find_message_start(packets, handle).map(|first| (first, handle)),
            (false, false) => {
                let first = self.find_message_start(packets, handle)?;
                let last = self.find_message_end(packets, handle)?;
                Some((first, last))
            }
        }
    }

    /// Follow the queue forward from `from` through consecutive ids up to an END_OF_MESSAGE
    ///  packet. A gap or another START_OF_MESSAGE on the way means there is no complete message.
    fn find_message_end(&self, packets: &Slab<Packet>, from: SlabHandle) -> Option<SlabHandle> {
        let mut cursor = from;
        let mut id = Self::header_of(packets, from)?.packet_id;
        loop {
            let next = self.packets.next(packets, cursor)?;
            let header = Self::header_of(packets, next)?;
            if header.packet_id != id.wrapping_add(1) || header.flags.contains(PacketFlags::START_OF_MESSAGE) {
                return None;
            }
            if header.flags.contains(PacketFlags::END_OF_MESSAGE) {
                return Some(next);
            }
            cursor = next;
            id = header.packet_id;
        }
    }

    fn find_message_start(&self, packets: &Slab<Packet>, from: SlabHandle) -> Option<SlabHandle> {
        let mut cursor = from;
        let mut id = Self::header_of(packets, from)?.packet_id;
        loop {
            let prev = self.packets.prev(packets, cursor)?;
            let header = Self::header_of(packets, prev)?;
            if header.packet_id != id.wrapping_sub(1) || header.flags.contains(PacketFlags::END_OF_MESSAGE) {
                return None;
            }
            if header.flags.contains(PacketFlags::START_OF_MESSAGE) {
                return Some(prev);
            }
            cursor = prev;
            id = header.packet_id;
        }
    }

    fn payload_len(&self, packets: &Slab<Packet>, first: SlabHandle, last: SlabHandle) -> usize {
        let mut len = 0;
        let mut cursor = Some(first);
        while let Some(c) = cursor {
            len += packets.get(c).map(|p| p.payload_len()).unwrap_or(0);
            if c == last {
                break;
            }
            cursor = self.packets.next(packets, c);
        }
        len
    }

    fn refresh_availability(&mut self, spans: &mut Slab<MessageSpan>) {
        let mut cursor = self.messages.peek();
        while let Some(c) = cursor {
            let next = self.messages.next(spans, c);
            if let Some(span) = spans.get_mut(c) {
                // a span starting at the window base is recorded packet by packet as the base advances
                let is_next = !seq_lt(self.window.base, span.first_id);
                span.is_available = is_next || (!span.in_order && self.window.covers(span.last_id));
            }
            cursor = next;
        }
    }

    fn first_available(&self, spans: &Slab<MessageSpan>) -> Option<SlabHandle> {
        self.messages.iter(spans)
            .find(|&h| spans.get(h).map(|s| s.is_available).unwrap_or(false))
    }

    pub fn has_available_message(&self, spans: &Slab<MessageSpan>) -> bool {
        self.first_available(spans).is_some()
    }

    /// size of the next deliverable message, without consuming it
    pub fn peek_message(&self, spans: &Slab<MessageSpan>) -> Option<usize> {
        let span = self.first_available(spans)?;
        spans.get(span).map(|s| s.len)
    }

    /// Copy the next deliverable message into `out`, truncating if it does not fit, and release
    ///  its packets. Returns the number of bytes copied.
    pub fn receive_message(&mut self, packets: &mut Slab<Packet>, spans: &mut Slab<MessageSpan>, out: &mut [u8]) -> Option<usize> {
        let span_handle = self.first_available(spans)?;
        let (first, last) = spans.get(span_handle).map(|s| (s.first, s.last))?;

        let mut copied = 0;
        let mut cursor = Some(first);
        while let Some(c) = cursor {
            let next = self.packets.next(packets, c);
            if let Some(packet) = packets.get(c) {
                let payload = packet.payload();
                let len = payload.len().min(out.len() - copied);
                out[copied..copied + len].copy_from_slice(&payload[..len]);
                copied += len;
                self.window.mark_delivered(packet.header().packet_id);
            }
            self.packets.remove(packets, c);
            packets.free(c);

            if c == last {
                break;
            }
            cursor = next;
        }

        self.messages.remove(spans, span_handle);
        spans.free(span_handle);
        self.refresh_availability(spans);

        trace!("channel {}: delivered message of {} bytes, window base is now {}", self.channel_id, copied, self.window.base);
        Some(copied)
    }

    /// Give up on messages that cannot complete: a message that waited for a gap for longer than
    ///  `timeout` skips the gap, and queued packets that are not part of a detected message and
    ///  are older than `timeout` are released. Returns the number of released packets.
    pub fn evict_stale(&mut self, packets: &mut Slab<Packet>, spans: &mut Slab<MessageSpan>, now: Instant, timeout: Duration) -> usize {
        let first_blocked = self.messages.iter(spans)
            .filter_map(|h| spans.get(h))
            .find(|span| !span.is_available)
            .map(|span| (span.first_id, span.detected_at));
        if let Some((first_id, detected_at)) = first_blocked {
            let is_blocked_too_long = detected_at.map(|t| now.saturating_duration_since(t) > timeout).unwrap_or(false);
            if is_blocked_too_long {
                debug!("channel {}: skipping missing packets {}..{} after timeout", self.channel_id, self.window.base, first_id);
                self.window.skip_to(first_id);
                self.refresh_availability(spans);
            }
        }

        let mut num_evicted = 0;
        let mut span_cursor = self.messages.peek();
        let mut cursor = self.packets.peek();
        while let Some(c) = cursor {
            let next = self.packets.next(packets, c);
            let Some((id, timestamp)) = packets.get(c).map(|p| (p.header().packet_id, p.timestamp)) else {
                break;
            };

            while let Some(s) = span_cursor {
                if spans.get(s).map(|span| seq_lt(span.last_id, id)).unwrap_or(false) {
                    span_cursor = self.messages.next(spans, s);
                }
                else {
                    break;
                }
            }
            let is_covered = span_cursor
                .and_then(|s| spans.get(s))
                .map(|span| !seq_lt(id, span.first_id))
                .unwrap_or(false);

            let is_stale = timestamp.map(|t| now.saturating_duration_since(t) > timeout).unwrap_or(true);
            if !is_covered && is_stale {
                trace!("channel {}: evicting stale fragment {}", self.channel_id, id);
                self.packets.remove(packets, c);
                packets.free(c);
                num_evicted += 1;
            }
            cursor = next;
        }

        if num_evicted > 0 {
            debug!("channel {}: evicted {} stale fragments", self.channel_id, num_evicted);
        }
        num_evicted
    }

    /// release everything this channel holds
    pub fn clear(&mut self, packets: &mut Slab<Packet>, spans: &mut Slab<MessageSpan>) {
        self.messages.free_all(spans);
        self.packets.free_all(packets);
    }
}
