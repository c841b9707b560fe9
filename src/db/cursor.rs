//! Streaming cursor over query results.
//!
//! A [`Cursor`] hands rows to a single consumer one at a time. The rows are
//! produced by a dedicated task that owns the open result set and feeds a
//! channel of capacity 1, so at most one row waits in memory. The producer
//! releases the result set (and its pooled connection) as soon as the rows
//! run out, the consumer drops the cursor, or the [`StopSignal`] fires.

use std::future::Future;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::shutdown::StopSignal;
use crate::{RelayError, Result};

/// Producer half of a cursor.
pub struct RowSink<T> {
    tx: mpsc::Sender<Result<T>>,
    stop: StopSignal,
}

impl<T> RowSink<T> {
    /// Forward `rows` to the consumer until exhausted, dropped or stopped.
    ///
    /// The first error is forwarded and ends production.
    pub async fn drain<S, E>(self, mut rows: S)
    where
        S: Stream<Item = std::result::Result<T, E>> + Unpin,
        E: Into<RelayError>,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.stopped() => {
                    debug!("Cursor stopped, releasing result set");
                    return;
                }
                _ = self.tx.closed() => {
                    debug!("Cursor dropped by consumer, releasing result set");
                    return;
                }
                row = rows.next() => row,
            };

            let item = match next {
                Some(Ok(row)) => Ok(row),
                Some(Err(e)) => Err(e.into()),
                None => return,
            };
            let failed = item.is_err();

            tokio::select! {
                biased;
                _ = self.stop.stopped() => {
                    debug!("Cursor stopped while waiting for consumer");
                    return;
                }
                sent = self.tx.send(item) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }

            if failed {
                return;
            }
        }
    }
}

/// Lazy, forward-only, single-consumer sequence of rows.
pub struct Cursor<T> {
    rx: mpsc::Receiver<Result<T>>,
    stop: StopSignal,
    peeked: Option<T>,
    finished: bool,
}

impl<T> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("finished", &self.finished)
            .finish()
    }
}

impl<T: Send + 'static> Cursor<T> {
    /// Create a connected producer/consumer pair.
    pub fn channel(stop: StopSignal) -> (RowSink<T>, Cursor<T>) {
        let (tx, rx) = mpsc::channel(1);
        let sink = RowSink {
            tx,
            stop: stop.clone(),
        };
        let cursor = Cursor {
            rx,
            stop,
            peeked: None,
            finished: false,
        };
        (sink, cursor)
    }

    /// Spawn `produce` on its own task and open the cursor.
    ///
    /// Fails when the query fails before yielding its first row, or when the
    /// signal fires before anything was produced.
    pub async fn spawn<F, Fut>(stop: StopSignal, produce: F) -> Result<Self>
    where
        F: FnOnce(RowSink<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sink, cursor) = Self::channel(stop);
        tokio::spawn(produce(sink));
        cursor.open().await
    }

    /// Wait for the first row so an outright failure is reported here.
    pub async fn open(mut self) -> Result<Self> {
        match self.rx.recv().await {
            Some(Ok(row)) => {
                self.peeked = Some(row);
                Ok(self)
            }
            Some(Err(e)) => Err(e),
            None => {
                self.finished = true;
                if self.stop.is_stopped() {
                    return Err(self.stop.stop_error());
                }
                Ok(self)
            }
        }
    }

    /// Get the next row, or `None` once the sequence has ended.
    ///
    /// A mid-stream error ends the sequence; rows already returned stay valid.
    pub async fn next(&mut self) -> Option<T> {
        if let Some(row) = self.peeked.take() {
            return Some(row);
        }
        if self.finished {
            return None;
        }

        match self.rx.recv().await {
            Some(Ok(row)) => Some(row),
            Some(Err(e)) => {
                warn!("Cursor terminated early: {}", e);
                self.finished = true;
                None
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Drain the remaining rows into a vector.
    pub async fn collect(mut self) -> Vec<T> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row);
        }
        rows
    }
}
