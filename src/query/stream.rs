//! Producer/consumer bridge.
//!
//! Runs a walk on its own task and exposes the transformed rows as a
//! [`RowStream`]. The walk stops reading the cursor as soon as the consumer
//! closes or drops the stream, and the stream completes when the walk ends,
//! whether by exhaustion, cancellation or failure. A failure is delivered as
//! the final `Err` item.

use super::walker::{AsyncWalker, WalkEnd, WalkOutcome};
use crate::db::AsyncCursor;
use crate::error::Result;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How far the producer may run ahead of the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Read a row only after the consumer asks for the next item.
    #[default]
    Demand,
    /// Read ahead until this many items are waiting.
    Bounded(usize),
    /// Read ahead without limit.
    Unbounded,
}

/// Producer half of the handoff.
pub(crate) enum Outlet<T> {
    Demand {
        tx: mpsc::UnboundedSender<T>,
        credits: Arc<Semaphore>,
    },
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T: Send> Outlet<T> {
    /// Waits until the consumer can take one more item. Returns false once
    /// the consumer is gone.
    async fn ready(&self) -> bool {
        match self {
            Self::Demand { tx, credits } => match credits.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    !tx.is_closed()
                }
                Err(_) => false,
            },
            // The permit is released straight away; with a single producer
            // the slot stays free until `push`.
            Self::Bounded(tx) => tx.reserve().await.is_ok(),
            Self::Unbounded(tx) => !tx.is_closed(),
        }
    }

    /// Hands one item over. Returns false if the consumer refused it.
    pub(crate) fn push(&self, item: T) -> bool {
        match self {
            Self::Demand { tx, .. } | Self::Unbounded(tx) => tx.send(item).is_ok(),
            Self::Bounded(tx) => tx.try_send(item).is_ok(),
        }
    }
}

enum Inlet<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

/// Consumer half of the handoff: a stream of transformed rows.
pub struct RowStream<T> {
    inlet: Inlet<Result<T>>,
    credits: Option<Arc<Semaphore>>,
    requested: bool,
}

impl<T> RowStream<T> {
    /// Stops the producer. Items already handed over can still be received.
    pub fn close(&mut self) {
        if let Some(credits) = &self.credits {
            credits.close();
        }
        match &mut self.inlet {
            Inlet::Bounded(rx) => rx.close(),
            Inlet::Unbounded(rx) => rx.close(),
        }
    }
}

impl<T> Stream for RowStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(credits) = &this.credits {
            if !this.requested {
                credits.add_permits(1);
                this.requested = true;
            }
        }

        let polled = match &mut this.inlet {
            Inlet::Bounded(rx) => rx.poll_recv(cx),
            Inlet::Unbounded(rx) => rx.poll_recv(cx),
        };
        if polled.is_ready() {
            this.requested = false;
        }
        polled
    }
}

impl<T> Drop for RowStream<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Creates a connected outlet/stream pair.
pub(crate) fn channel<T: Send>(backpressure: Backpressure) -> (Outlet<Result<T>>, RowStream<T>) {
    match backpressure {
        Backpressure::Demand => {
            let (tx, rx) = mpsc::unbounded_channel();
            let credits = Arc::new(Semaphore::new(0));
            (
                Outlet::Demand {
                    tx,
                    credits: Arc::clone(&credits),
                },
                RowStream {
                    inlet: Inlet::Unbounded(rx),
                    credits: Some(credits),
                    requested: false,
                },
            )
        }
        Backpressure::Bounded(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                Outlet::Bounded(tx),
                RowStream {
                    inlet: Inlet::Bounded(rx),
                    credits: None,
                    requested: false,
                },
            )
        }
        Backpressure::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Outlet::Unbounded(tx),
                RowStream {
                    inlet: Inlet::Unbounded(rx),
                    credits: None,
                    requested: false,
                },
            )
        }
    }
}

/// Walks `cursor`, pushing `transform(row)` for each row into `outlet`.
///
/// The consumer's readiness is awaited before every advance so a closed
/// stream never causes another read. Errors are pushed as the last item and
/// also returned.
pub(crate) async fn pump<C, T, F>(
    cursor: &mut C,
    mut transform: F,
    outlet: &Outlet<Result<T>>,
    cancel: Option<CancellationToken>,
) -> Result<WalkOutcome>
where
    C: AsyncCursor + ?Sized,
    T: Send,
    F: FnMut(&C) -> Result<T>,
{
    let mut walker = AsyncWalker::new(cursor).with_cancel(cancel.clone());

    loop {
        let ready = match &cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                ready = outlet.ready() => Some(ready),
            },
            None => Some(outlet.ready().await),
        };

        match ready {
            None => {
                walker.cancel();
                break;
            }
            Some(false) => {
                debug!("Consumer closed the stream after {} rows", walker.rows());
                walker.stop();
                break;
            }
            Some(true) => {}
        }

        let item = match walker.advance().await {
            Ok(Some(record)) => transform(record),
            Ok(None) => break,
            Err(e) => {
                outlet.push(Err(e.clone()));
                return Err(e);
            }
        };

        if let Err(e) = &item {
            let e = e.clone();
            walker.fail();
            outlet.push(item);
            return Err(e);
        }
        if !outlet.push(item) {
            walker.stop();
            break;
        }
    }

    Ok(walker.outcome())
}

/// Exposes an owned cursor as a stream of `transform(row)` items.
///
/// The walk runs on a spawned task, so this must be called from within a
/// Tokio runtime. The cursor is closed when the walk ends.
pub fn expose_as_stream<C, T, F>(
    mut cursor: C,
    transform: F,
    backpressure: Backpressure,
    cancel: Option<CancellationToken>,
) -> RowStream<T>
where
    C: AsyncCursor + 'static,
    T: Send + 'static,
    F: FnMut(&C) -> Result<T> + Send + 'static,
{
    let (outlet, stream) = channel(backpressure);

    tokio::spawn(async move {
        let outcome = pump(&mut cursor, transform, &outlet, cancel).await;
        cursor.close();
        if let Ok(WalkOutcome { rows, end }) = outcome {
            if end == WalkEnd::Cancelled {
                debug!("Stream cancelled after {rows} rows");
            }
        }
        drop(outlet);
    });

    stream
}
