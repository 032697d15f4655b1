//! An in-memory datagram network for end-to-end tests. Datagrams can be dropped selectively,
//!  and delivery order can be reversed to simulate reordering.

use crate::transport::Transport;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

type DropFilter = Box<dyn FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send>;

#[derive(Default)]
struct NetworkState {
    inboxes: FxHashMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>,
    drop_filter: Option<DropFilter>,
    reverse_order: bool,
    blocked: bool,
    num_sent: usize,
    num_dropped: usize,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> MemoryNetwork {
        Self::default()
    }

    pub fn transport(&self, addr: &str) -> Arc<MemoryTransport> {
        let addr: SocketAddr = addr.parse().unwrap();
        self.state.lock().inboxes.entry(addr).or_default();
        Arc::new(MemoryTransport {
            addr,
            network: self.clone(),
        })
    }

    /// `filter(from, to, datagram)` returns `true` for datagrams that get lost
    pub fn set_drop_filter(&self, filter: impl FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send + 'static) {
        self.state.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.state.lock().drop_filter = None;
    }

    /// deliver the most recently sent datagram first
    pub fn set_reverse_order(&self, reverse_order: bool) {
        self.state.lock().reverse_order = reverse_order;
    }

    /// make all sends report 'would block'
    pub fn set_blocked(&self, blocked: bool) {
        self.state.lock().blocked = blocked;
    }

    pub fn num_sent(&self) -> usize {
        self.state.lock().num_sent
    }

    pub fn num_dropped(&self) -> usize {
        self.state.lock().num_dropped
    }

    pub fn num_in_flight(&self) -> usize {
        self.state.lock().inboxes.values()
            .map(|q| q.len())
            .sum()
    }

    /// inject a raw datagram
    pub fn deliver(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        if let Some(inbox) = self.state.lock().inboxes.get_mut(&to) {
            inbox.push_back((datagram.to_vec(), from));
        }
    }
}

pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<Option<usize>> {
        let mut state = self.network.state.lock();
        if state.blocked {
            return Ok(None);
        }
        state.num_sent += 1;

        let is_dropped = match &mut state.drop_filter {
            Some(filter) => filter(self.addr, to, buf),
            None => false,
        };
        if is_dropped {
            state.num_dropped += 1;
            return Ok(Some(buf.len()));
        }

        if let Some(inbox) = state.inboxes.get_mut(&to) {
            inbox.push_back((buf.to_vec(), self.addr));
        }
        Ok(Some(buf.len()))
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut state = self.network.state.lock();
        let reverse_order = state.reverse_order;
        let Some(inbox) = state.inboxes.get_mut(&self.addr) else {
            return Ok(None);
        };

        let datagram = if reverse_order { inbox.pop_back() } else { inbox.pop_front() };
        Ok(datagram.map(|(data, from)| {
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            (len, from)
        }))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
