//! In-memory datagram fabric with programmable loss and reordering.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use murk_node::DatagramSocket;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::trace;

type Datagram = (Vec<u8>, SocketAddr);

/// The shared routing fabric: every test socket registers its address here
/// and datagrams are routed (or dropped, or delayed) between them.
pub struct Fabric {
    links: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>,
    loss_rate: Mutex<f64>,
    max_delay: Mutex<Duration>,
    next_port: Mutex<u16>,
}

impl Fabric {
    /// Creates a lossless, in-order fabric.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(HashMap::new()),
            loss_rate: Mutex::new(0.0),
            max_delay: Mutex::new(Duration::ZERO),
            next_port: Mutex::new(1),
        })
    }

    /// Sets the probability of any datagram being dropped.
    pub fn set_loss_rate(&self, rate: f64) {
        *self.loss_rate.lock() = rate.clamp(0.0, 1.0);
    }

    /// Sets the maximum random per-datagram delay; nonzero delay reorders.
    pub fn set_max_delay(&self, delay: Duration) {
        *self.max_delay.lock() = delay;
    }

    /// Opens a socket on the fabric with a fresh address.
    pub fn open_socket(self: &Arc<Self>) -> TestSocket {
        let port = {
            let mut next = self.next_port.lock();
            let port = *next;
            *next += 1;
            port
        };
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port);

        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().insert(addr, tx);

        TestSocket {
            addr,
            fabric: Arc::clone(self),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn route(&self, datagram: Datagram, to: SocketAddr) {
        {
            let loss = *self.loss_rate.lock();
            if loss > 0.0 && rand::thread_rng().gen::<f64>() < loss {
                trace!(%to, "Fabric dropped a datagram");
                return;
            }
        }

        let tx = match self.links.lock().get(&to) {
            Some(tx) => tx.clone(),
            None => return,
        };

        let max_delay = *self.max_delay.lock();
        if max_delay.is_zero() {
            let _ = tx.send(datagram);
        } else {
            let delay = rand::thread_rng().gen_range(Duration::ZERO..=max_delay);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(datagram);
            });
        }
    }
}

/// A socket attached to a [`Fabric`].
pub struct TestSocket {
    addr: SocketAddr,
    fabric: Arc<Fabric>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl DatagramSocket for TestSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.fabric.route((buf.to_vec(), self.addr), addr);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some((bytes, from)) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok((len, from))
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "fabric gone")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
