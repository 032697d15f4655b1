//! A reliable-UDP message transport: applications send and receive *messages* (defined-length
//!  chunks of data) to and from peers identified by their socket address, over a single
//!  non-blocking UDP socket. Per message, the sender chooses whether delivery is confirmed
//!  (acknowledged and re-sent until acknowledged) and whether it is ordered relative to other
//!  ordered messages on the same channel.
//!
//! ## Design goals
//!
//! * peer-to-peer without a dedicated server vs. client, and without a handshake: a peer comes
//!    into existence when the first packet is sent to it or received from it
//! * 255 independent channels per peer, each with its own sequence of packet ids and its own
//!    receive window
//! * messages of (nearly) arbitrary size, split into packets that fit into a single datagram
//!    without IP-level fragmentation, and re-assembled on the receiving side
//! * bounded memory: all packets (outgoing, waiting for an ack, received) live in a single
//!    pre-allocated pool. When it is exhausted, sending fails fast and receiving leaves datagrams
//!    in the socket's buffer
//! * the application is never blocked by the network: enqueueing and receiving are non-blocking,
//!    and all I/O happens in a 'pump' that the application drives explicitly by calling
//!    [`end_point::EndPoint::update`] (or runs in a tokio task, see [`pump`])
//!
//! ## Packet
//!
//! Every datagram is a single packet of at most 1400 bytes, with a 4 byte header (all numbers in
//!  network byte order, BE) followed by up to 1396 bytes of payload:
//!
//! ```ascii
//! 0: packet id (u16) - sequence number, scoped to (peer, channel), wrapping
//! 2: channel id (u8) - 0..254
//! 3: flags (u8):
//!    * bit 0 (  1): CONFIRM_DELIVERY - the receiver acknowledges the packet
//!    * bit 2 (  4): IS_ACK - this packet acknowledges a packet with the same header
//!    * bit 3 (  8): IN_ORDER - the message is delivered only after all previous messages
//!                    on the channel
//!    * bit 4 ( 16): END_OF_MESSAGE - last packet of a message
//!    * bit 5 ( 32): START_OF_MESSAGE - first packet of a message
//! ```
//!
//! A single-packet message has both START_OF_MESSAGE and END_OF_MESSAGE. The packets of a message
//!  have consecutive ids.
//!
//! ## Acknowledgement
//!
//! An ack is a header-only packet echoing the acknowledged packet's header with IS_ACK added. The
//!  sender keeps packets with CONFIRM_DELIVERY after sending them, and re-sends them when no ack
//!  arrives within the configured timeout, up to a configured number of times. Receivers
//!  acknowledge duplicates as well (the first ack may have been lost), but deliver them only once.
//!
//! ## Receive window
//!
//! Per channel, the receiver tracks the lowest packet id that was not delivered yet, plus a
//!  bitmap of delivered ids ahead of it. Packets behind the window or marked delivered are
//!  duplicates. An IN_ORDER message becomes deliverable when the window has caught up with its
//!  first packet, i.e. when all messages before it were delivered or skipped. Messages that can
//!  not complete (lost fragments, gaps that are never filled) are evicted after a configurable
//!  per-channel timeout.
//!
//! Packet ids are 16 bit and wrap around, comparisons are done modulo 2^16 (like TCP sequence
//!  numbers). A peer that restarts begins again with id 0, and that is not detected.
//!
//! ## Related:
//! * UDT
//!   * dedicated UDP socket per peer
//!   * single channel
//! * QUIC
//!   * connection based - initial handshake
//!   * enforces encryption (TLS 1.3)
//!   * has stream multiplexing
//! * ENet
//!   * channels with reliable / unreliable and sequenced / unsequenced delivery
//!   * connection based

pub mod buffers;
pub mod channel;
pub mod config;
pub mod end_point;
pub mod error;
pub mod packet;
pub mod peer;
pub mod pump;
pub mod safe_converter;
pub mod transport;

#[cfg(test)]
pub mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    unsafe fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            // .with_max_level(Level::TRACE)
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
