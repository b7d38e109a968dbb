//! The conductor's event queue.
//!
//! A single ordered, closable, multi-producer/single-consumer buffer of
//! routing events. Every inbound message from every connection becomes a
//! queue event before any routing decision is made, so the order the one
//! consumer observes *is* the order things happened.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::conductor::ConductorMessage;

/// Producer handle. Cloneable; safe to push from any task at any time.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<ConductorMessage>,
    closed: Arc<AtomicBool>,
}

impl QueueSender {
    /// Enqueue an event. If a consumer is suspended waiting, the event is
    /// handed to it directly. After `close()`, pushes have no effect.
    pub fn push(&self, event: ConductorMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // The receiver only goes away when the conductor is torn down, at
        // which point producers have nothing left to say anyway.
        let _ = self.tx.send(event);
    }

    /// Make the queue terminal: a synthetic `Shutdown` event is injected
    /// exactly once, releasing a suspended consumer after any buffered
    /// events drain. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(ConductorMessage::Shutdown);
        }
    }
}

/// The consuming end. Only one logical consumer (the conductor's loop) may
/// iterate.
#[derive(Debug)]
pub struct MessageQueue {
    rx: mpsc::UnboundedReceiver<ConductorMessage>,
    sender: QueueSender,
    done: bool,
}

impl MessageQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MessageQueue {
            rx,
            sender: QueueSender {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            done: false,
        }
    }

    pub fn sender(&self) -> QueueSender {
        self.sender.clone()
    }

    /// Next event in push order. Returns `None` at the first `Shutdown`
    /// event, which is never yielded and ends iteration for good, or if
    /// all producers are gone.
    pub async fn next(&mut self) -> Option<ConductorMessage> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(ConductorMessage::Shutdown) | None => {
                self.done = true;
                None
            }
            Some(event) => Some(event),
        }
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
