use crate::buffers::fingerprint_map::{fingerprint_bytes, Fingerprint};
use crate::buffers::slab::{Slab, SlabHandle};
use crate::channel::{Channel, InsertOutcome, MessageSpan};
use crate::config::RudpConfig;
use crate::packet::{ChannelId, Packet, PacketId, MAX_CHANNELS};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Instant;
use tracing::trace;

/// A peer's identity: its socket address, with the fingerprint calculated once
#[derive(Clone, Eq)]
pub struct PeerAddr {
    addr: SocketAddr,
    fingerprint: u32,
}

impl PeerAddr {
    pub fn new(addr: SocketAddr) -> PeerAddr {
        // family tag, ip, port
        let mut image = [0u8; 19];
        let len = match addr {
            SocketAddr::V4(a) => {
                image[0] = 4;
                image[1..5].copy_from_slice(&a.ip().octets());
                image[5..7].copy_from_slice(&a.port().to_be_bytes());
                7
            }
            SocketAddr::V6(a) => {
                image[0] = 6;
                image[1..17].copy_from_slice(&a.ip().octets());
                image[17..19].copy_from_slice(&a.port().to_be_bytes());
                19
            }
        };

        PeerAddr {
            addr,
            fingerprint: fingerprint_bytes(&image[..len]),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl PartialEq for PeerAddr {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint && self.addr == other.addr
    }
}

impl Fingerprint for PeerAddr {
    fn fingerprint(&self) -> u32 {
        self.fingerprint
    }
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Everything a peer needs for receiving. It is behind a single lock that the pump takes for
///  routing incoming packets and the application takes for consuming messages.
pub struct PeerInbound {
    channels: Vec<Channel>,
    spans: Slab<MessageSpan>,
    /// channels with at least one deliverable message, in round-robin order
    ready_channels: VecDeque<ChannelId>,
}

impl PeerInbound {
    fn new(max_pending_messages: usize) -> PeerInbound {
        PeerInbound {
            channels: (0..MAX_CHANNELS)
                .map(|id| Channel::new(id as ChannelId))
                .collect(),
            spans: Slab::with_capacity(max_pending_messages),
            ready_channels: VecDeque::with_capacity(MAX_CHANNELS),
        }
    }

    /// Hand a received packet to its channel. Returns the channel's verdict; for anything but
    ///  [`InsertOutcome::Queued`] the caller keeps ownership of the packet.
    pub fn route(&mut self, packets: &mut Slab<Packet>, handle: SlabHandle, channel_id: ChannelId, now: Instant) -> InsertOutcome {
        let Some(channel) = self.channels.get_mut(channel_id as usize) else {
            return InsertOutcome::Duplicate;
        };
        let outcome = channel.insert(packets, &mut self.spans, handle, now);
        self.register_if_ready(channel_id);
        outcome
    }

    fn register_if_ready(&mut self, channel_id: ChannelId) {
        let Some(channel) = self.channels.get_mut(channel_id as usize) else {
            return;
        };
        if !channel.is_ready_queued && channel.has_available_message(&self.spans) {
            trace!("channel {} has a deliverable message", channel_id);
            channel.is_ready_queued = true;
            self.ready_channels.push_back(channel_id);
        }
    }

    pub fn has_ready_channels(&self) -> bool {
        !self.ready_channels.is_empty()
    }

    pub fn peek_message(&self) -> Option<usize> {
        let channel_id = *self.ready_channels.front()?;
        self.channels.get(channel_id as usize)?
            .peek_message(&self.spans)
    }

    /// Deliver the next message of the head ready channel, moving that channel to the back of the
    ///  ready queue if it has more messages
    pub fn receive_message(&mut self, packets: &mut Slab<Packet>, out: &mut [u8]) -> Option<(usize, ChannelId)> {
        while let Some(channel_id) = self.ready_channels.pop_front() {
            let Some(channel) = self.channels.get_mut(channel_id as usize) else {
                continue;
            };
            channel.is_ready_queued = false;

            let received = channel.receive_message(packets, &mut self.spans, out);
            self.register_if_ready(channel_id);

            if let Some(len) = received {
                return Some((len, channel_id));
            }
        }
        None
    }

    /// Apply stale message eviction to all channels with queued packets. Returns the number
    ///  of released packets.
    pub fn evict_stale(&mut self, packets: &mut Slab<Packet>, now: Instant, config: &RudpConfig) -> usize {
        let mut num_evicted = 0;
        for idx in 0..self.channels.len() {
            let channel = &mut self.channels[idx];
            if channel.num_queued_packets() == 0 {
                continue;
            }
            let channel_id = channel.channel_id();
            if let Some(timeout) = config.get_effective_channel_config(channel_id).stale_message_timeout {
                num_evicted += channel.evict_stale(packets, &mut self.spans, now, timeout);
                self.register_if_ready(channel_id);
            }
        }
        num_evicted
    }

    pub fn num_queued_packets(&self) -> usize {
        self.channels.iter()
            .map(|c| c.num_queued_packets())
            .sum()
    }

    pub fn num_pending_messages(&self) -> usize {
        self.spans.num_secured()
    }

    /// release all packets held by this peer's channels
    pub fn clear(&mut self, packets: &mut Slab<Packet>) {
        for channel in self.channels.iter_mut() {
            channel.clear(packets, &mut self.spans);
            channel.is_ready_queued = false;
        }
        self.ready_channels.clear();
    }
}

/// A remote end point, created on first contact. It owns the outgoing packet id counters (one per
///  channel) and all receive-side state.
pub struct Peer {
    addr: PeerAddr,
    next_packet_ids: Box<[AtomicU16]>,
    inbound: Mutex<PeerInbound>,
    /// set while the peer is registered in its end point's ready queue
    pub(crate) is_ready_queued: AtomicBool,
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer({:?})", self.addr)
    }
}

impl Peer {
    pub fn new(addr: PeerAddr, max_pending_messages: usize) -> Peer {
        Peer {
            addr,
            next_packet_ids: (0..MAX_CHANNELS)
                .map(|_| AtomicU16::new(0))
                .collect(),
            inbound: Mutex::new(PeerInbound::new(max_pending_messages)),
            is_ready_queued: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr.addr()
    }

    /// Reserve `num_packets` consecutive packet ids on a channel, returning the first one.
    ///  Concurrent reservations on the same channel never overlap.
    pub fn reserve_packet_ids(&self, channel_id: ChannelId, num_packets: u16) -> Option<PacketId> {
        let counter = self.next_packet_ids.get(channel_id as usize)?;
        Some(counter.fetch_add(num_packets, Ordering::Relaxed))
    }

    pub fn lock_inbound(&self) -> MutexGuard<'_, PeerInbound> {
        self.inbound.lock()
    }
}
