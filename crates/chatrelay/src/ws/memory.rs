//! In-process transports.
//!
//! A [`MemoryTransport`] is the relay's end; the matching [`MemoryPeer`] plays
//! the remote side (a browser or the chat backend) and can inject failures.

use async_trait::async_trait;
use chatrelay_protocol::{Message, NewMessage};
use tokio::sync::{Mutex, mpsc, watch};

use super::transport::{ServerFrame, Transport, TransportError};

/// Client side transport, fed with raw text frames.
pub type MemoryClient = MemoryTransport<String, ServerFrame>;

/// Backend side transport.
pub type MemoryBackend = MemoryTransport<Message, NewMessage>;

pub struct MemoryTransport<I, O> {
    incoming: Mutex<mpsc::UnboundedReceiver<Result<I, TransportError>>>,
    outgoing: mpsc::Sender<O>,
    closed: watch::Sender<bool>,
}

pub struct MemoryPeer<I, O> {
    tx: mpsc::UnboundedSender<Result<I, TransportError>>,
    rx: mpsc::Receiver<O>,
    closed: watch::Receiver<bool>,
}

/// Create a connected transport and peer.
///
/// `capacity` bounds what the relay can write before the peer reads; a full
/// buffer makes `send` wait, which is how tests simulate a stalled client.
pub fn pair<I, O>(capacity: usize) -> (MemoryTransport<I, O>, MemoryPeer<I, O>) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
    let (closed, closed_rx) = watch::channel(false);
    (
        MemoryTransport {
            incoming: Mutex::new(in_rx),
            outgoing: out_tx,
            closed,
        },
        MemoryPeer {
            tx: in_tx,
            rx: out_rx,
            closed: closed_rx,
        },
    )
}

#[async_trait]
impl<I, O> Transport for MemoryTransport<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    type Inbound = I;
    type Outbound = O;

    async fn send(&self, item: O) -> Result<(), TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            res = self.outgoing.send(item) => res.map_err(|_| TransportError::Closed),
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Result<I, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            item = incoming.recv() => item.unwrap_or(Err(TransportError::Closed)),
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl<I, O> MemoryPeer<I, O> {
    /// Deliver an item to the relay. Returns false once the transport is gone.
    pub fn send(&self, item: I) -> bool {
        self.tx.send(Ok(item)).is_ok()
    }

    /// Make the relay's next `recv` fail with `err`.
    pub fn fail(&self, err: TransportError) {
        let _ = self.tx.send(Err(err));
    }

    /// Next item written by the relay, or `None` once the transport is closed
    /// and everything written before the close was read.
    pub async fn recv(&mut self) -> Option<O> {
        tokio::select! {
            biased;
            item = self.rx.recv() => item,
            _ = self.closed.wait_for(|closed| *closed) => self.rx.try_recv().ok(),
        }
    }

    /// True once the relay closed its end.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the relay closes its end.
    pub async fn closed(&mut self) {
        let _ = self.closed.wait_for(|closed| *closed).await;
    }
}

impl MemoryPeer<String, ServerFrame> {
    /// Next text frame, skipping keepalive probes.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.recv().await? {
                ServerFrame::Text(text) => return Some(text),
                ServerFrame::Ping => continue,
            }
        }
    }
}
