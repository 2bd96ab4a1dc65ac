//! Observable event streams handed to callers of the repository.
//!
//! A [`Subscription`] is the receiving half of a bounded channel. Dropping it
//! closes the channel; producers check [`Publisher::is_closed`] before doing
//! further work.

use tokio::sync::mpsc;

const DEFAULT_BUFFER: usize = 16;

/// Stream of events produced by a background operation
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
}

/// Producing half of a [`Subscription`]
#[derive(Debug)]
pub(crate) struct Publisher<T> {
    tx: mpsc::Sender<T>,
}

pub(crate) fn channel<T>() -> (Publisher<T>, Subscription<T>) {
    let (tx, rx) = mpsc::channel(DEFAULT_BUFFER);
    (Publisher { tx }, Subscription { rx })
}

impl<T> Subscription<T> {
    /// Wait for the next event. `None` once the producer has finished.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Drain every remaining event.
    pub async fn collect(mut self) -> Vec<T> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }

    /// Wait for the producer to finish and return its final event.
    pub async fn last(mut self) -> Option<T> {
        let mut last = None;
        while let Some(event) = self.rx.recv().await {
            last = Some(event);
        }
        last
    }
}

impl<T> Publisher<T> {
    /// Send an event. Returns false when the subscriber is gone.
    pub async fn emit(&self, event: T) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
