//! Dispatcher: owns the datagram socket and picks destinations.
//!
//! The socket is created on the first send, released exactly once during
//! shutdown, and never recreated afterwards. Destinations are chosen round
//! robin from a counter shared by every message of the client.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Destination;
use crate::error::GelfError;
use crate::lifecycle::InFlight;

/// Local address the UDP socket binds to.
const BIND_ADDRESS: &str = "0.0.0.0:0";

/// Something that can send one datagram to a destination.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, datagram: &[u8], destination: &Destination) -> io::Result<usize>;
}

/// Opens the transport on first use.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<Arc<dyn Transport>>;
}

/// Unconnected IPv4 UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral local port.
    pub async fn bind() -> io::Result<Self> {
        let socket = UdpSocket::bind(BIND_ADDRESS).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, datagram: &[u8], destination: &Destination) -> io::Result<usize> {
        self.socket
            .send_to(datagram, (destination.host.as_str(), destination.port))
            .await
    }
}

/// Connector producing a [`UdpTransport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpConnector;

#[async_trait]
impl Connector for UdpConnector {
    async fn connect(&self) -> io::Result<Arc<dyn Transport>> {
        let transport = UdpTransport::bind().await?;
        info!(local_addr = ?transport.local_addr().ok(), "Opened GELF socket");
        Ok(Arc::new(transport))
    }
}

enum SocketSlot {
    Idle,
    Open(Arc<dyn Transport>),
    Destroyed,
}

/// Sends datagrams through the shared socket.
pub struct Dispatcher {
    destinations: Vec<Destination>,
    call_counter: AtomicUsize,
    connector: Arc<dyn Connector>,
    socket: Mutex<SocketSlot>,
}

impl Dispatcher {
    /// Create a dispatcher over a non-empty destination list.
    pub fn new(destinations: Vec<Destination>, connector: Arc<dyn Connector>) -> Self {
        Self {
            destinations,
            call_counter: AtomicUsize::new(0),
            connector,
            socket: Mutex::new(SocketSlot::Idle),
        }
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Next destination in round-robin order.
    ///
    /// # Panics
    ///
    /// Panics if the destination list is empty.
    pub fn select_destination(&self) -> &Destination {
        let call = self.call_counter.fetch_add(1, Ordering::Relaxed);
        &self.destinations[call % self.destinations.len()]
    }

    /// Send one datagram, opening the socket if needed.
    ///
    /// The datagram is counted in `in_flight` from the moment it is handed
    /// to the transport until the send completes.
    ///
    /// # Errors
    ///
    /// - `GelfError::DestroyedTransport` if the socket was already released;
    ///   no counter is touched in that case
    /// - `GelfError::Send` if the socket cannot be opened or the send fails
    pub async fn send(
        &self,
        datagram: &[u8],
        destination: &Destination,
        in_flight: &InFlight,
    ) -> Result<(), GelfError> {
        let (transport, _ticket) = {
            let mut slot = self.socket.lock().await;
            let open = match &*slot {
                SocketSlot::Open(transport) => Some(Arc::clone(transport)),
                SocketSlot::Destroyed => return Err(GelfError::DestroyedTransport),
                SocketSlot::Idle => None,
            };
            let transport = match open {
                Some(transport) => transport,
                None => {
                    let transport = self
                        .connector
                        .connect()
                        .await
                        .map_err(|e| GelfError::send(destination.clone(), e))?;
                    *slot = SocketSlot::Open(Arc::clone(&transport));
                    transport
                }
            };
            // Counted under the slot lock so shutdown never releases the
            // socket between the check above and the send below
            (transport, in_flight.track_chunk())
        };

        let sent = transport
            .send_to(datagram, destination)
            .await
            .map_err(|e| GelfError::send(destination.clone(), e))?;

        debug!(destination = %destination, bytes = sent, "Sent GELF datagram");
        Ok(())
    }

    /// Release the socket if nothing is in flight.
    ///
    /// Returns `false` without side effects if work is still outstanding.
    /// Once released, the socket is never recreated.
    pub async fn destroy_if_drained(&self, in_flight: &InFlight) -> bool {
        let mut slot = self.socket.lock().await;
        if !in_flight.is_drained() {
            return false;
        }

        if matches!(*slot, SocketSlot::Open(_)) {
            info!("Closing GELF socket");
        }
        *slot = SocketSlot::Destroyed;
        true
    }

    /// Whether the socket has been opened and not yet released.
    #[cfg(test)]
    async fn is_open(&self) -> bool {
        matches!(*self.socket.lock().await, SocketSlot::Open(_))
    }

    #[cfg(test)]
    async fn is_destroyed(&self) -> bool {
        matches!(*self.socket.lock().await, SocketSlot::Destroyed)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("destinations", &self.destinations)
            .field("call_counter", &self.call_counter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
