//! In-process transports for tests and single-process setups.
//!
//! [`MockNetwork`] plays the dialing side and hands the far end of every new
//! connection to its [`Acceptor`]. Each connection can be severed, which drops
//! whatever is still queued on it, like a broken socket would.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;

use tetherrpc::Message;

use crate::transport;
use crate::transport::ByteTransport;
use crate::transport::Connector;
use crate::transport::Transport;

/// Severs one in-process connection in both directions.
#[derive(Debug, Clone)]
pub struct LinkControl {
    severed: Arc<watch::Sender<bool>>,
}

impl LinkControl {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { severed: Arc::new(tx) }
    }

    pub fn sever(&self) {
        self.severed.send_replace(true);
    }

    pub fn is_severed(&self) -> bool {
        *self.severed.borrow()
    }
}

/// A duplex message transport using tokio mpsc channels.
///
/// Messages sent via `send()` appear on the other half's `recv()` as the same
/// `Arc`, and vice versa.
pub struct DuplexChannelTransport {
    tx: mpsc::UnboundedSender<Arc<Message>>,
    rx: Mutex<mpsc::UnboundedReceiver<Arc<Message>>>,
    control: LinkControl,
}

impl DuplexChannelTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (a, b, _) = Self::pair_with_control();
        (a, b)
    }

    /// Like [`pair`](Self::pair), plus a handle that breaks the connection.
    pub fn pair_with_control() -> (Self, Self, LinkControl) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let control = LinkControl::new();

        let a = Self { tx: tx_a, rx: Mutex::new(rx_b), control: control.clone() };
        let b = Self { tx: tx_b, rx: Mutex::new(rx_a), control: control.clone() };
        (a, b, control)
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, msg: Arc<Message>) -> transport::Result<()> {
        if self.control.is_severed() {
            return Err(transport::Error::ConnectionLost("link severed".into()));
        }
        self.tx
            .send(msg)
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Arc<Message>>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = wait_severed(self.control.severed.subscribe()) => Ok(None),
            msg = rx.recv() => Ok(msg),
        }
    }
}

async fn wait_severed(mut severed: watch::Receiver<bool>) {
    let _ = severed.wait_for(|s| *s).await;
}

/// A duplex byte-frame transport, to run [`Framed`](crate::transport::Framed)
/// in process.
pub struct ByteChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ByteChannelTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Self { tx: tx_a, rx: Mutex::new(rx_b) },
            Self { tx: tx_b, rx: Mutex::new(rx_a) },
        )
    }
}

#[async_trait::async_trait]
impl ByteTransport for ByteChannelTransport {
    async fn send(&self, frame: Vec<u8>) -> transport::Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

/// The dialing side of an in-process network.
pub struct MockNetwork {
    incoming: mpsc::UnboundedSender<Box<dyn Transport>>,
    links: DashMap<u64, LinkControl>,
    refusing: AtomicBool,
    connects: AtomicU64,
}

impl MockNetwork {
    pub fn new() -> (Arc<Self>, Acceptor) {
        let (incoming, rx) = mpsc::unbounded_channel();
        let network = Arc::new(Self {
            incoming,
            links: DashMap::new(),
            refusing: AtomicBool::new(false),
            connects: AtomicU64::new(0),
        });
        (network, Acceptor { rx: Mutex::new(rx) })
    }

    /// Breaks every live connection.
    pub fn sever_all(&self) {
        for entry in self.links.iter() {
            entry.value().sever();
        }
        self.links.clear();
    }

    /// While refusing, `connect` fails immediately.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for MockNetwork {
    async fn connect(&self) -> transport::Result<Box<dyn Transport>> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(transport::Error::Refused("mock network is refusing".into()));
        }
        let (local, remote, control) = DuplexChannelTransport::pair_with_control();
        self.incoming
            .send(Box::new(remote))
            .map_err(|_| transport::Error::Refused("acceptor is gone".into()))?;

        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.links.insert(n, control);
        Ok(Box::new(local))
    }
}

/// The accepting side of a [`MockNetwork`]. A passive connector.
pub struct Acceptor {
    rx: Mutex<mpsc::UnboundedReceiver<Box<dyn Transport>>>,
}

impl Acceptor {
    /// The next dialed-in connection, or `None` once the network is dropped.
    pub async fn accept(&self) -> Option<Box<dyn Transport>> {
        self.rx.lock().await.recv().await
    }
}

#[async_trait::async_trait]
impl Connector for Acceptor {
    async fn connect(&self) -> transport::Result<Box<dyn Transport>> {
        self.accept()
            .await
            .ok_or_else(|| transport::Error::ConnectionLost("mock network closed".into()))
    }

    fn is_passive(&self) -> bool {
        true
    }
}
