//! In-memory transport.
//!
//! A channel-backed duplex connection. The server side gets a
//! [`MemorySource`]/[`MemorySink`] pair, the test or embedding side drives
//! the [`MemoryPeer`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameSource, Inbound, TransportError};

/// A frame written by the server side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text data frame.
    Text(String),
    /// Keepalive probe.
    Ping,
    /// Graceful close.
    Close,
}

/// Create a connected in-memory transport.
#[must_use]
pub fn pair() -> (MemorySource, MemorySink, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let fail_writes = Arc::new(AtomicBool::new(false));

    (
        MemorySource { inbound: inbound_rx },
        MemorySink {
            outbound: outbound_tx,
            fail_writes: Arc::clone(&fail_writes),
            is_open: true,
        },
        MemoryPeer {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            fail_writes,
        },
    )
}

/// Server-side read half.
pub struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        self.inbound.recv().await.transpose()
    }
}

/// Server-side write half.
pub struct MemorySink {
    outbound: mpsc::UnboundedSender<Outbound>,
    fail_writes: Arc<AtomicBool>,
    is_open: bool,
}

impl MemorySink {
    fn send(&self, frame: Outbound) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("write failure injected".into()));
        }

        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.send(Outbound::Text(text.to_owned()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.send(Outbound::Ping)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        // The peer may already be gone
        let _ = self.outbound.send(Outbound::Close);
        self.is_open = false;
        Ok(())
    }
}

/// The remote end of an in-memory connection.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<Inbound, TransportError>>>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryPeer {
    fn push(&self, item: Result<Inbound, TransportError>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(item).is_ok())
    }

    /// Send a text frame to the server. Returns `false` once disconnected.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(Ok(Inbound::Text(text.into())))
    }

    /// Answer a keepalive probe.
    pub fn send_pong(&self) -> bool {
        self.push(Ok(Inbound::Pong))
    }

    /// Make the server's next read fail with a transport error.
    pub fn send_error(&self, reason: impl Into<String>) -> bool {
        self.push(Err(TransportError::ReceiveFailed(reason.into())))
    }

    /// Close the peer's write direction; the server reads end-of-stream.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Make every subsequent server write fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Wait for the next frame written by the server.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Take a frame written by the server without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    /// Drain every text frame written so far, skipping pings and close.
    pub fn drain_text(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Some(frame) = self.try_recv() {
            if let Outbound::Text(text) = frame {
                texts.push(text);
            }
        }
        texts
    }
}
