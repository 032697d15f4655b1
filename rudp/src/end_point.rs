use crate::buffers::fingerprint_map::FingerprintMap;
use crate::buffers::list::{List, SharedQueue};
use crate::buffers::slab::{SlabHandle, SlabPool};
use crate::channel::InsertOutcome;
use crate::config::RudpConfig;
use crate::error::EnqueueError;
use crate::packet::{ChannelId, Packet, PacketFlags, PacketHeader, MAX_CHANNELS, MAX_PAYLOAD, PACKET_SIZE};
use crate::peer::{Peer, PeerAddr};
use crate::safe_converter::PrecheckedCast;
use crate::transport::{Transport, UdpTransport};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::{task, time};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

/// minimum time between two scans for stale messages
const EVICTION_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryOptions {
    /// the receiver acknowledges every packet, and unacknowledged packets are re-sent
    pub confirm_delivery: bool,
    /// the message is delivered only after all messages sent before it on the same channel
    pub in_order: bool,
}

impl DeliveryOptions {
    pub fn reliable_ordered() -> DeliveryOptions {
        DeliveryOptions {
            confirm_delivery: true,
            in_order: true,
        }
    }

    fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        if self.confirm_delivery {
            flags |= PacketFlags::CONFIRM_DELIVERY;
        }
        if self.in_order {
            flags |= PacketFlags::IN_ORDER;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// number of bytes copied into the caller's buffer
    pub len: usize,
    pub from: SocketAddr,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub secured: usize,
    pub capacity: usize,
}

/// what a single pump cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub num_received: usize,
    pub num_resent: usize,
    pub num_sent: usize,
    pub num_evicted: usize,
}

impl CycleStats {
    pub fn did_work(&self) -> bool {
        self.num_received + self.num_resent + self.num_sent + self.num_evicted > 0
    }
}

/// State that only the pump touches
struct PumpState {
    /// sent packets with CONFIRM_DELIVERY, waiting for their ack
    ack_pending: List<Packet>,
    /// packets taken from the shared outbound queue that could not be sent yet
    outbound_backlog: List<Packet>,
    receive_buf: Box<[u8; PACKET_SIZE]>,
    last_eviction: Option<Instant>,
}

/// EndPoint is the place where all other parts of the protocol come together: it owns the
///  packet pool and the peer table, fragments outgoing messages into packets, and runs the pump
///  that moves packets between the transport and the peers' channels.
///
/// Application threads call [`EndPoint::enqueue_message`], [`EndPoint::peek_message`] and
///  [`EndPoint::receive_message`] while a pump thread (or task, see [`crate::pump`]) calls
///  [`EndPoint::update`]. Nothing blocks for longer than a non-blocking socket call.
///
/// Locks are acquired in this order: pump state, peer table, a peer's inbound state, packet
///  pool, outbound queue. The ready-peer queue is only ever locked on its own.
pub struct EndPoint {
    config: Arc<RudpConfig>,
    transport: Arc<dyn Transport>,
    packet_pool: SlabPool<Packet>,
    outbound: SharedQueue<Packet>,
    pump: Mutex<PumpState>,
    peers: Mutex<FingerprintMap<PeerAddr, Arc<Peer>>>,
    ready_peers: Mutex<VecDeque<Arc<Peer>>>,
}

impl EndPoint {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<RudpConfig>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        info!("initializing end point with {} packet buffers for up to {} peers", config.packet_pool_size, config.max_peers);

        Ok(EndPoint {
            transport,
            packet_pool: SlabPool::new(config.packet_pool_size),
            outbound: SharedQueue::new(),
            pump: Mutex::new(PumpState {
                ack_pending: List::new(),
                outbound_backlog: List::new(),
                receive_buf: Box::new([0; PACKET_SIZE]),
                last_eviction: None,
            }),
            peers: Mutex::new(FingerprintMap::with_capacity(config.max_peers)),
            ready_peers: Mutex::new(VecDeque::with_capacity(config.max_peers)),
            config,
        })
    }

    /// convenience for an end point on a tokio UDP socket
    pub async fn bind(addr: SocketAddr, config: Arc<RudpConfig>) -> anyhow::Result<EndPoint> {
        let transport = UdpTransport::bind(addr).await?;
        Self::new(Arc::new(transport), config)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    fn get_or_create_peer(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        let key = PeerAddr::new(addr);
        let mut peers = self.peers.lock();
        let capacity = peers.capacity();

        let peer = peers.find_or_insert_with(key.clone(), || {
            debug!("new peer {:?}", addr);
            Arc::new(Peer::new(key, self.config.max_pending_messages_per_peer))
        });
        if peer.is_none() {
            warn!("peer table is full ({} peers) - ignoring {:?}", capacity, addr);
        }
        peer.map(|p| p.clone())
    }

    /// Split a message into packets and queue them for sending. The message is either queued
    ///  completely or not at all.
    pub fn enqueue_message(&self, data: &[u8], to: SocketAddr, channel_id: ChannelId, options: DeliveryOptions) -> Result<(), EnqueueError> {
        if channel_id as usize >= MAX_CHANNELS {
            return Err(EnqueueError::InvalidChannel(channel_id));
        }
        if data.len() > self.config.max_message_size {
            return Err(EnqueueError::MessageTooLarge { len: data.len(), max: self.config.max_message_size });
        }

        // an empty message still needs a packet to carry its START / END flags
        let num_packets = data.len().div_ceil(MAX_PAYLOAD).max(1);

        let peer = self.get_or_create_peer(to)
            .ok_or(EnqueueError::PeerTableFull)?;

        let mut slab = self.packet_pool.lock();
        if slab.num_free() < num_packets {
            debug!("not enough free packet buffers for a message of {} bytes ({} free, {} required)", data.len(), slab.num_free(), num_packets);
            return Err(EnqueueError::OutQueueFull);
        }

        let mut batch = List::new();
        for _ in 0..num_packets {
            match slab.secure() {
                Some(handle) => {
                    batch.push(&mut slab, handle);
                }
                None => {
                    batch.free_all(&mut slab);
                    return Err(EnqueueError::OutQueueFull);
                }
            }
        }

        // ids are reserved only after all buffers are secured, so a failed enqueue leaves no gap
        let Some(first_id) = peer.reserve_packet_ids(channel_id, num_packets.prechecked_cast()) else {
            batch.free_all(&mut slab);
            return Err(EnqueueError::InvalidChannel(channel_id));
        };

        let base_flags = options.flags();
        let mut chunks = data.chunks(MAX_PAYLOAD);
        let mut cursor = batch.peek();
        let mut i: usize = 0;
        while let Some(handle) = cursor {
            cursor = batch.next(&slab, handle);

            let mut flags = base_flags;
            if i == 0 {
                flags |= PacketFlags::START_OF_MESSAGE;
            }
            if i + 1 == num_packets {
                flags |= PacketFlags::END_OF_MESSAGE;
            }

            if let Some(packet) = slab.get_mut(handle) {
                packet.set_header(&PacketHeader {
                    packet_id: first_id.wrapping_add(i.prechecked_cast()),
                    channel_id,
                    flags,
                });
                packet.write(chunks.next().unwrap_or(&[]));
                packet.target_addr = Some(to);
            }
            i += 1;
        }

        trace!("enqueued message of {} bytes for {:?} on channel {} as packets {}..{}", data.len(), to, channel_id, first_id, first_id.wrapping_add(num_packets.prechecked_cast()));
        self.outbound.append(&mut slab, &mut batch);
        Ok(())
    }

    /// The size of the next message that [`EndPoint::receive_message`] would return
    pub fn peek_message(&self) -> Option<usize> {
        loop {
            let peer = self.ready_peers.lock().front().cloned()?;
            let inbound = peer.lock_inbound();
            if let Some(len) = inbound.peek_message() {
                return Some(len);
            }

            // no longer ready: unregister
            let mut ready_peers = self.ready_peers.lock();
            if ready_peers.front().map(|p| Arc::ptr_eq(p, &peer)).unwrap_or(false) {
                ready_peers.pop_front();
                peer.is_ready_queued.store(false, Ordering::Release);
            }
        }
    }

    /// Copy the next complete message into `buf`, truncating it if `buf` is too small. Peers and
    ///  their channels take turns.
    pub fn receive_message(&self, buf: &mut [u8]) -> Option<ReceivedMessage> {
        loop {
            let peer = self.ready_peers.lock().pop_front()?;

            let mut inbound = peer.lock_inbound();
            let received = {
                let mut slab = self.packet_pool.lock();
                inbound.receive_message(&mut slab, buf)
            };

            if inbound.has_ready_channels() {
                self.ready_peers.lock().push_back(peer.clone());
            }
            else {
                peer.is_ready_queued.store(false, Ordering::Release);
            }
            drop(inbound);

            if let Some((len, channel_id)) = received {
                trace!("delivering message of {} bytes from {:?} on channel {}", len, peer.addr(), channel_id);
                return Some(ReceivedMessage {
                    len,
                    from: peer.addr(),
                    channel_id,
                });
            }
        }
    }

    /// NB: must be called while holding the peer's inbound lock, so it cannot race with
    ///  `receive_message` unregistering the peer
    fn register_ready_peer(&self, peer: &Arc<Peer>) {
        if !peer.is_ready_queued.swap(true, Ordering::AcqRel) {
            self.ready_peers.lock().push_back(peer.clone());
        }
    }

    /// Run pump cycles until `budget` is used up, returning what remains of it. A zero budget runs
    ///  exactly one cycle.
    ///
    /// Between cycles, control goes back to the runtime so its I/O driver can pick up socket
    ///  readiness: a yield after a busy cycle, a sleep of `idle_poll_interval` after an idle one.
    pub async fn update(&self, budget: Duration) -> Duration {
        let start = Instant::now();
        loop {
            let stats = self.pump_cycle(Instant::now());

            let elapsed = start.elapsed();
            if elapsed >= budget {
                return budget.saturating_sub(elapsed);
            }
            if stats.did_work() {
                task::yield_now().await;
            }
            else {
                time::sleep(self.config.idle_poll_interval.min(budget - elapsed)).await;
            }
        }
    }

    /// listen, acknowledge, flush, evict
    pub(crate) fn pump_cycle(&self, now: Instant) -> CycleStats {
        let mut pump = self.pump.lock();

        let num_received = self.listen(&mut pump, now);
        let num_resent = self.acknowledge(&mut pump, now);
        let num_sent = self.flush(&mut pump, now);
        let num_evicted = self.evict_stale(&mut pump, now);

        CycleStats {
            num_received,
            num_resent,
            num_sent,
            num_evicted,
        }
    }

    fn listen(&self, pump: &mut PumpState, now: Instant) -> usize {
        let mut num_received = 0;

        for _ in 0..self.config.listen_attempts {
            let Some(handle) = self.packet_pool.secure() else {
                debug!("packet pool is exhausted - leaving incoming datagrams in the socket buffer");
                break;
            };

            let (len, from) = match self.transport.receive(pump.receive_buf.as_mut_slice()) {
                Ok(Some(x)) => x,
                Ok(None) => {
                    self.packet_pool.free(handle);
                    break;
                }
                Err(e) => {
                    error!("socket error: {}", e);
                    self.packet_pool.free(handle);
                    continue;
                }
            };
            num_received += 1;

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            let _entered = span.enter();

            trace!("received {} bytes from {:?}", len, from);

            let Some(header) = self.fill_received_packet(handle, &pump.receive_buf[..len], from) else {
                debug!("datagram of {} bytes is too short for a packet header - dropping", len);
                self.packet_pool.free(handle);
                continue;
            };

            if header.is_ack() {
                self.on_ack(pump, &header, from);
                self.packet_pool.free(handle);
            }
            else {
                self.on_packet(handle, &header, from, now);
            }
        }

        num_received
    }

    fn fill_received_packet(&self, handle: SlabHandle, datagram: &[u8], from: SocketAddr) -> Option<PacketHeader> {
        let mut slab = self.packet_pool.lock();
        let packet = slab.get_mut(handle)?;
        packet.receive_buffer()[..datagram.len()].copy_from_slice(datagram);
        if !packet.set_received_len(datagram.len()) {
            return None;
        }
        packet.target_addr = Some(from);
        Some(packet.header())
    }

    fn on_ack(&self, pump: &mut PumpState, ack: &PacketHeader, from: SocketAddr) {
        let mut slab = self.packet_pool.lock();

        let matching = pump.ack_pending.iter(&slab)
            .find(|&h| slab.get(h)
                .map(|p| p.target_addr == Some(from) && p.header().is_acked_by(ack))
                .unwrap_or(false)
            );

        match matching {
            Some(handle) => {
                trace!("packet {} on channel {} acknowledged by {:?}", ack.packet_id, ack.channel_id, from);
                pump.ack_pending.remove(&mut slab, handle);
                slab.free(handle);
            }
            None => {
                debug!("ack for packet {} on channel {} from {:?} matches no pending packet - ignoring", ack.packet_id, ack.channel_id, from);
            }
        }
    }

    fn on_packet(&self, handle: SlabHandle, header: &PacketHeader, from: SocketAddr, now: Instant) {
        if header.channel_id as usize >= MAX_CHANNELS {
            debug!("packet for invalid channel {} from {:?} - dropping", header.channel_id, from);
            self.packet_pool.free(handle);
            return;
        }

        let Some(peer) = self.get_or_create_peer(from) else {
            self.packet_pool.free(handle);
            return;
        };

        let outcome = {
            let mut inbound = peer.lock_inbound();
            let outcome = {
                let mut slab = self.packet_pool.lock();
                inbound.route(&mut slab, handle, header.channel_id, now)
            };
            if inbound.has_ready_channels() {
                self.register_ready_peer(&peer);
            }
            outcome
        };

        match outcome {
            InsertOutcome::Queued => {
                trace!("queued packet {} on channel {}", header.packet_id, header.channel_id);
            }
            InsertOutcome::Duplicate => {
                debug!("duplicate packet {} on channel {} from {:?} - dropping", header.packet_id, header.channel_id, from);
                self.packet_pool.free(handle);
            }
            InsertOutcome::NoSpanCapacity => {
                // not acknowledged, so the sender will try again
                self.packet_pool.free(handle);
                return;
            }
        }

        if header.flags.contains(PacketFlags::CONFIRM_DELIVERY) {
            self.send_ack(header, from);
        }
    }

    /// queue an ack - it goes out with the next flush
    fn send_ack(&self, header: &PacketHeader, to: SocketAddr) {
        let mut slab = self.packet_pool.lock();
        let Some(handle) = slab.secure() else {
            debug!("packet pool is exhausted - not acknowledging packet {} on channel {}", header.packet_id, header.channel_id);
            return;
        };
        if let Some(packet) = slab.get_mut(handle) {
            packet.set_header(&header.to_ack());
            packet.target_addr = Some(to);
        }

        let mut batch = List::new();
        batch.push(&mut slab, handle);
        self.outbound.append(&mut slab, &mut batch);
    }

    /// re-send packets whose ack is overdue
    fn acknowledge(&self, pump: &mut PumpState, now: Instant) -> usize {
        let mut slab = self.packet_pool.lock();
        let mut num_resent = 0;

        let mut cursor = pump.ack_pending.peek();
        while let Some(handle) = cursor {
            cursor = pump.ack_pending.next(&slab, handle);

            let Some((timestamp, resend_count, target_addr, header)) = slab.get(handle)
                .map(|p| (p.timestamp, p.resend_count, p.target_addr, p.header()))
            else {
                continue;
            };

            let is_due = timestamp
                .map(|t| now.saturating_duration_since(t) > self.config.ack_timeout)
                .unwrap_or(true);
            if !is_due {
                continue;
            }

            let is_exhausted = self.config.max_resend_attempts
                .map(|max| resend_count >= max)
                .unwrap_or(false);
            let Some(to) = target_addr.filter(|_| !is_exhausted) else {
                warn!("no ack for packet {} on channel {} to {:?} after {} re-sends - giving up", header.packet_id, header.channel_id, target_addr, resend_count);
                pump.ack_pending.remove(&mut slab, handle);
                slab.free(handle);
                continue;
            };

            let result = match slab.get(handle) {
                Some(packet) => self.transport.send(packet.as_wire_bytes(), to),
                None => continue,
            };
            match result {
                Ok(Some(_)) => {
                    trace!("re-sent packet {} on channel {} to {:?}", header.packet_id, header.channel_id, to);
                    if let Some(packet) = slab.get_mut(handle) {
                        packet.timestamp = Some(now);
                        packet.resend_count += 1;
                    }
                    num_resent += 1;
                }
                Ok(None) => {
                    trace!("socket would block - postponing re-sends");
                    break;
                }
                Err(e) => {
                    error!("error re-sending packet to {:?}: {}", to, e);
                }
            }
        }

        num_resent
    }

    /// Send queued packets in order, stopping at the first one that can not be sent. Sent packets
    ///  with CONFIRM_DELIVERY move on to the ack-pending list.
    fn flush(&self, pump: &mut PumpState, now: Instant) -> usize {
        let mut slab = self.packet_pool.lock();
        let mut taken = self.outbound.take_all();
        pump.outbound_backlog.inherit_from(&mut slab, &mut taken);

        let mut num_sent = 0;
        while let Some(handle) = pump.outbound_backlog.peek() {
            let Some((header, target_addr)) = slab.get(handle).map(|p| (p.header(), p.target_addr)) else {
                break;
            };
            let Some(to) = target_addr else {
                warn!("outbound packet without target address - dropping");
                pump.outbound_backlog.remove(&mut slab, handle);
                slab.free(handle);
                continue;
            };

            let result = match slab.get(handle) {
                Some(packet) => self.transport.send(packet.as_wire_bytes(), to),
                None => break,
            };
            match result {
                Ok(Some(_)) => {
                    trace!("sent packet {} on channel {} to {:?}", header.packet_id, header.channel_id, to);
                    pump.outbound_backlog.remove(&mut slab, handle);
                    num_sent += 1;

                    if header.flags.contains(PacketFlags::CONFIRM_DELIVERY) && !header.is_ack() {
                        if let Some(packet) = slab.get_mut(handle) {
                            packet.timestamp = Some(now);
                        }
                        pump.ack_pending.push(&mut slab, handle);
                    }
                    else {
                        slab.free(handle);
                    }
                }
                Ok(None) => {
                    trace!("socket would block - {} packets remain queued", pump.outbound_backlog.len());
                    break;
                }
                Err(e) => {
                    error!("error sending packet to {:?}: {} - retrying in the next cycle", to, e);
                    break;
                }
            }
        }

        num_sent
    }

    fn evict_stale(&self, pump: &mut PumpState, now: Instant) -> usize {
        if let Some(last) = pump.last_eviction {
            if now.saturating_duration_since(last) < EVICTION_INTERVAL {
                return 0;
            }
        }
        pump.last_eviction = Some(now);

        let peers = self.peers.lock();
        let mut num_evicted = 0;
        for peer in peers.values() {
            let mut inbound = peer.lock_inbound();
            num_evicted += {
                let mut slab = self.packet_pool.lock();
                inbound.evict_stale(&mut slab, now, &self.config)
            };
            if inbound.has_ready_channels() {
                self.register_ready_peer(peer);
            }
        }
        num_evicted
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pump.lock().ack_pending.len()
    }

    /// packets waiting to be sent for the first time
    pub fn outbound_len(&self) -> usize {
        self.pump.lock().outbound_backlog.len() + self.outbound.len()
    }

    pub fn pool_stats(&self) -> PoolStats {
        let slab = self.packet_pool.lock();
        PoolStats {
            secured: slab.num_secured(),
            capacity: slab.capacity(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        let pending = self.pump.get_mut().ack_pending.len();
        if pending > 0 {
            debug!("dropping end point with {} unacknowledged packets", pending);
        }
    }
}
