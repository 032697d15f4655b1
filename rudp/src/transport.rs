#[cfg(test)] use mockall::automock;
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{info, trace};

/// The datagram socket underneath an [`EndPoint`](crate::end_point::EndPoint). Both calls are
///  non-blocking: `Ok(None)` means the operation would block, which is not an error.
#[cfg_attr(test, automock)]
pub trait Transport: Send + Sync + 'static {
    fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<Option<usize>>;

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// A tokio UDP socket, used through its `try_*` operations. Readiness is tracked by the tokio
///  runtime's I/O driver, so the end point must be pumped from inside a runtime.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        info!("bound UDP socket to {:?}", socket.local_addr()?);
        Ok(UdpTransport { socket })
    }
}

fn would_block_as_none<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(x) => Ok(Some(x)),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

impl Transport for UdpTransport {
    fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<Option<usize>> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        would_block_as_none(self.socket.try_send_to(buf, to))
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        would_block_as_none(self.socket.try_recv_from(buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
