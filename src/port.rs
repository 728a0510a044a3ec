use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use grow_wire::Message;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{GrowError, Result};

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// One delivery on a port: a message plus the ports transferred with it.
pub struct Packet {
    pub message: Message,
    pub ports: Vec<(String, Port)>,
}

impl Packet {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            ports: Vec::new(),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("message", &self.message.kind())
            .field("ports", &self.ports.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

/// One end of a bidirectional in-memory link.
///
/// Delivery is FIFO and always asynchronous: a posted message is handed to
/// the peer's handler task, never to the poster's stack. Clones share the
/// same end; closing any clone closes the end for all of them.
#[derive(Clone)]
pub struct Port {
    id: u64,
    peer: Arc<str>,
    outbox: Arc<Mutex<Option<UnboundedSender<Packet>>>>,
    inbox: Arc<Mutex<Option<UnboundedReceiver<Packet>>>>,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Port {
    /// Creates a linked pair. `a` talks to `b_name`, `b` talks to `a_name`.
    pub fn pair(a_name: &str, b_name: &str) -> (Port, Port) {
        let (to_a, a_inbox) = mpsc::unbounded_channel();
        let (to_b, b_inbox) = mpsc::unbounded_channel();
        let a = Port::new(b_name, to_b, a_inbox);
        let b = Port::new(a_name, to_a, b_inbox);
        (a, b)
    }

    fn new(peer: &str, outbox: UnboundedSender<Packet>, inbox: UnboundedReceiver<Packet>) -> Self {
        Self {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            peer: Arc::from(peer),
            outbox: Arc::new(Mutex::new(Some(outbox))),
            inbox: Arc::new(Mutex::new(Some(inbox))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the proc on the other end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn post_message(&self, message: Message) -> Result<()> {
        self.post(Packet::new(message))
    }

    pub fn post_with_ports(&self, message: Message, ports: Vec<(String, Port)>) -> Result<()> {
        self.post(Packet { message, ports })
    }

    pub fn post(&self, packet: Packet) -> Result<()> {
        let guard = self
            .outbox
            .lock()
            .map_err(|_| GrowError::PortClosed(self.peer.to_string()))?;
        let outbox = guard
            .as_ref()
            .ok_or_else(|| GrowError::PortClosed(self.peer.to_string()))?;
        trace!(peer = %self.peer, kind = packet.message.kind(), "post");
        outbox
            .send(packet)
            .map_err(|_| GrowError::PortClosed(self.peer.to_string()))
    }

    /// Registers the single handler for this end.
    ///
    /// The handler runs on its own task, one packet at a time, in arrival
    /// order. The returned handle completes once the peer is gone or either
    /// end was closed.
    pub fn on_message<F>(&self, mut handler: F) -> Result<JoinHandle<()>>
    where
        F: FnMut(Packet) + Send + 'static,
    {
        let mut inbox = self
            .inbox
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| GrowError::PortInUse(self.peer.to_string()))?;
        let peer = self.peer.clone();
        Ok(tokio::spawn(async move {
            while let Some(packet) = inbox.recv().await {
                handler(packet);
            }
            trace!(%peer, "port drained");
        }))
    }

    /// Closes this end. The peer's handler finishes and further posts from
    /// either side fail with [`GrowError::PortClosed`].
    pub fn close(&self) {
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.take();
        }
        if let Ok(mut inbox) = self.inbox.lock() {
            if let Some(mut rx) = inbox.take() {
                rx.close();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbox
            .lock()
            .map(|outbox| outbox.as_ref().is_none_or(|tx| tx.is_closed()))
            .unwrap_or(true)
    }
}
