//! Connected UDP transport with batched send accounting
//!
//! One transport per controller. Packets are sent without blocking: a packet
//! the kernel will not take immediately goes to a backlog drained by a writer
//! task, and every later packet queues behind it until the backlog is empty,
//! so packets leave in the order they were added. A batch does not complete
//! until its queued packets have been sent. Packets added while the transport
//! is suspended or disconnected or reconnecting are dropped and counted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};

/// Socket options applied on connect
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Kernel send buffer size in bytes (system default if unset)
    pub send_buffer_size: Option<usize>,
}

/// Snapshot of transport counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub sent: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    /// Packets discarded while suspended or disconnected
    pub dropped: u64,
    pub last_error: Option<String>,
    pub connected: bool,
    pub suspended: bool,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    bytes_sent: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Counters {
    fn record_sent(&self, bytes: usize) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_error(&self, destination: SocketAddr, err: &std::io::Error) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let message = err.to_string();
        let mut last = self.last_error.lock();
        // Log on change only; a dead link fails every packet
        if last.as_deref() != Some(message.as_str()) {
            warn!("Send to {} failed: {}", destination, message);
        } else {
            debug!("Send to {} failed: {}", destination, message);
        }
        *last = Some(message);
    }
}

/// Progress of one backlog writer
#[derive(Debug, Default)]
struct BacklogState {
    /// Packets handed to the writer
    queued: AtomicU64,
    /// Packets the writer has sent or failed
    done: AtomicU64,
    notify: Notify,
}

impl BacklogState {
    fn is_busy(&self) -> bool {
        self.done.load(Ordering::Acquire) < self.queued.load(Ordering::Acquire)
    }

    fn finish_one(&self) {
        self.done.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    async fn wait_for(&self, ticket: u64) {
        loop {
            let notified = self.notify.notified();
            if self.done.load(Ordering::Acquire) >= ticket {
                return;
            }
            notified.await;
        }
    }
}

/// Ordered queue of deferred packets for one socket
struct Backlog {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<BacklogState>,
}

impl Backlog {
    fn spawn(
        runtime: &tokio::runtime::Handle,
        socket: Arc<UdpSocket>,
        counters: Arc<Counters>,
        destination: SocketAddr,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let state = Arc::new(BacklogState::default());
        let writer_state = Arc::clone(&state);
        runtime.spawn(async move {
            while let Some(data) = rx.recv().await {
                match socket.send(&data).await {
                    Ok(n) => counters.record_sent(n),
                    Err(e) => counters.record_error(destination, &e),
                }
                writer_state.finish_one();
            }
        });
        Self { tx, state }
    }

    /// Queue `packet` and return its ticket, or None if the writer is gone.
    fn push(&self, packet: &[u8]) -> Option<u64> {
        let ticket = self.state.queued.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(packet.to_vec()).is_err() {
            self.state.finish_one();
            return None;
        }
        Some(ticket)
    }
}

#[derive(Default)]
struct OpenBatch {
    packets: usize,
    pending: Vec<(Arc<BacklogState>, u64)>,
}

impl OpenBatch {
    fn track(&mut self, state: &Arc<BacklogState>, ticket: u64) {
        match self.pending.last_mut() {
            Some((last, last_ticket)) if Arc::ptr_eq(last, state) => *last_ticket = ticket,
            _ => self.pending.push((Arc::clone(state), ticket)),
        }
    }
}

/// Packets sent between [`UdpTransport::start_send_batch`] and
/// [`UdpTransport::end_send_batch`].
pub struct SendBatch {
    destination: SocketAddr,
    packets: usize,
    /// Last queued packet of the batch per backlog
    pending: Vec<(Arc<BacklogState>, u64)>,
}

impl SendBatch {
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Packets accepted into the batch
    pub fn packets(&self) -> usize {
        self.packets
    }

    /// True once every packet has been sent or failed
    pub fn is_complete(&self) -> bool {
        self.pending
            .iter()
            .all(|(state, ticket)| state.done.load(Ordering::Acquire) >= *ticket)
    }

    /// Resolve once every packet has been sent or failed.
    pub async fn wait(self) {
        for (state, ticket) in &self.pending {
            state.wait_for(*ticket).await;
        }
    }
}

impl std::fmt::Debug for SendBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendBatch")
            .field("destination", &self.destination)
            .field("packets", &self.packets)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// UDP socket connected to one controller
pub struct UdpTransport {
    destination: SocketAddr,
    options: TransportOptions,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    suspended: AtomicBool,
    reconnecting: AtomicBool,
    batch: Mutex<Option<OpenBatch>>,
    backlog: Mutex<Option<Backlog>>,
    counters: Arc<Counters>,
}

impl UdpTransport {
    pub fn new(destination: SocketAddr, options: TransportOptions) -> Self {
        Self {
            destination,
            options,
            socket: Mutex::new(None),
            suspended: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            batch: Mutex::new(None),
            backlog: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    fn open_socket(&self) -> Result<UdpSocket> {
        let raw = Socket::new(
            Domain::for_address(self.destination),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        if let Some(size) = self.options.send_buffer_size {
            raw.set_send_buffer_size(size)?;
        }
        raw.set_nonblocking(true)?;
        let local: SocketAddr = if self.destination.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        raw.bind(&local.into())?;
        raw.connect(&self.destination.into())?;
        Ok(UdpSocket::from_std(raw.into())?)
    }

    /// Open the socket. Does nothing if already connected. Must be called from
    /// within a tokio runtime.
    pub fn connect(&self) -> Result<()> {
        let mut socket = self.socket.lock();
        if socket.is_some() {
            return Ok(());
        }
        *socket = Some(Arc::new(self.open_socket()?));
        info!("UDP transport connected to {}", self.destination);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Drop and reopen the socket. Packets added meanwhile are dropped.
    pub fn reconnect(&self) -> Result<()> {
        self.reconnecting.store(true, Ordering::Release);
        let result = {
            let mut socket = self.socket.lock();
            *socket = None;
            self.open_socket().map(|s| *socket = Some(Arc::new(s)))
        };
        // The old writer drains what it holds on the old socket
        self.backlog.lock().take();
        self.reconnecting.store(false, Ordering::Release);
        match &result {
            Ok(()) => info!("UDP transport reconnected to {}", self.destination),
            Err(e) => warn!("Reconnect to {} failed: {}", self.destination, e),
        }
        result
    }

    pub fn disconnect(&self) {
        self.backlog.lock().take();
        if self.socket.lock().take().is_some() {
            debug!("UDP transport to {} disconnected", self.destination);
        }
    }

    /// Stop sending; packets are dropped until [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Local address of the connected socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.socket.lock();
        let socket = socket
            .as_ref()
            .ok_or_else(|| ControlError::NotConnected(self.destination.to_string()))?;
        Ok(socket.local_addr()?)
    }

    /// Open a batch. A batch already open stays open.
    pub fn start_send_batch(&self) {
        let mut batch = self.batch.lock();
        if batch.is_none() {
            *batch = Some(OpenBatch::default());
        }
    }

    /// Send `packet`, counting it toward the open batch if there is one.
    ///
    /// Returns false if the packet was dropped or failed immediately.
    pub fn add_send_to_batch(&self, packet: &[u8]) -> bool {
        if self.is_suspended() || self.reconnecting.load(Ordering::Acquire) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Some(socket) = self.socket.lock().clone() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let mut backlog = self.backlog.lock();
        if !backlog.as_ref().is_some_and(|b| b.state.is_busy()) {
            match socket.try_send(packet) {
                Ok(n) => {
                    self.counters.record_sent(n);
                    if let Some(batch) = self.batch.lock().as_mut() {
                        batch.packets += 1;
                    }
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.counters.record_error(self.destination, &e);
                    return false;
                }
            }
        }
        self.defer(&mut backlog, socket, packet)
    }

    /// Queue `packet` behind any packets already waiting for the socket.
    fn defer(&self, backlog: &mut Option<Backlog>, socket: Arc<UdpSocket>, packet: &[u8]) -> bool {
        if backlog.is_none() {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                let err = std::io::Error::from(ErrorKind::WouldBlock);
                self.counters.record_error(self.destination, &err);
                return false;
            };
            *backlog = Some(Backlog::spawn(
                &runtime,
                socket,
                Arc::clone(&self.counters),
                self.destination,
            ));
        }
        let Some(writer) = backlog.as_ref() else {
            return false;
        };
        let Some(ticket) = writer.push(packet) else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            backlog.take();
            return false;
        };
        if let Some(batch) = self.batch.lock().as_mut() {
            batch.packets += 1;
            batch.track(&writer.state, ticket);
        }
        true
    }

    /// Close the open batch, if any.
    pub fn end_send_batch(&self) -> Option<SendBatch> {
        let batch = self.batch.lock().take()?;
        Some(SendBatch {
            destination: self.destination,
            packets: batch.packets,
            pending: batch.pending,
        })
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            last_error: self.counters.last_error.lock().clone(),
            connected: self.is_connected(),
            suspended: self.is_suspended(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn receiver() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (_rx, addr) = receiver().await;
        let transport = UdpTransport::new(addr, TransportOptions::default());
        assert!(transport.local_addr().is_err());
        transport.connect().unwrap();
        let local = transport.local_addr().unwrap();
        transport.connect().unwrap();
        assert_eq!(transport.local_addr().unwrap(), local);
    }

    #[tokio::test]
    async fn test_batch_counts_and_completes() {
        let (rx, addr) = receiver().await;
        let transport = UdpTransport::new(
            addr,
            TransportOptions {
                send_buffer_size: Some(256 * 1024),
            },
        );
        transport.connect().unwrap();

        transport.start_send_batch();
        assert!(transport.add_send_to_batch(b"one"));
        assert!(transport.add_send_to_batch(b"three"));
        let batch = transport.end_send_batch().unwrap();
        assert_eq!(batch.packets(), 2);
        batch.wait().await;
        assert!(transport.end_send_batch().is_none());

        assert_eq!(recv(&rx).await, b"one");
        assert_eq!(recv(&rx).await, b"three");
        let stats = transport.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.bytes_sent, 8);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_deferred_packets_keep_their_order() {
        let (rx, addr) = receiver().await;
        let transport = UdpTransport::new(addr, TransportOptions::default());
        transport.connect().unwrap();
        transport.start_send_batch();

        // First packet refused by the kernel; the writer has not run yet
        let socket = transport.socket.lock().clone().unwrap();
        assert!(transport.defer(&mut transport.backlog.lock(), socket, b"first"));
        assert!(transport.add_send_to_batch(b"second"));

        let batch = transport.end_send_batch().unwrap();
        assert_eq!(batch.packets(), 2);
        assert!(!batch.is_complete());
        batch.wait().await;

        assert_eq!(recv(&rx).await, b"first");
        assert_eq!(recv(&rx).await, b"second");

        // Backlog drained, so sends go straight out again
        assert!(transport.add_send_to_batch(b"third"));
        assert_eq!(recv(&rx).await, b"third");
        assert_eq!(transport.stats().sent, 3);
    }

    #[tokio::test]
    async fn test_drops_while_suspended_or_disconnected() {
        let (rx, addr) = receiver().await;
        let transport = UdpTransport::new(addr, TransportOptions::default());
        assert!(!transport.add_send_to_batch(b"early"));

        transport.connect().unwrap();
        transport.suspend();
        assert!(!transport.add_send_to_batch(b"suspended"));
        transport.resume();
        assert!(transport.add_send_to_batch(b"live"));
        assert_eq!(recv(&rx).await, b"live");

        let stats = transport.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.sent, 1);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_sending() {
        let (rx, addr) = receiver().await;
        let transport = UdpTransport::new(addr, TransportOptions::default());
        transport.connect().unwrap();
        transport.reconnect().unwrap();
        assert!(transport.is_connected());
        assert!(transport.add_send_to_batch(b"after"));
        assert_eq!(recv(&rx).await, b"after");

        transport.disconnect();
        assert!(!transport.stats().connected);
    }
}
